//! Backend tests against scripted emulators.
//! Each fake speaks just enough of its wire protocol over an in-memory pipe.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tokio::io::{split, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use zdbg_core::gdb::{encode_le, frame, read_packet, GdbError};
use zdbg_core::remote::dzrp::{cmd, reason, ALT_STEP_INTO, NTF_PAUSE};
use zdbg_core::remote::{DzrpRemote, MameRemote, ZesaruxRemote};
use zdbg_core::{
    BreakpointRequest, LongAddress, MemoryModel, Remote, RemoteError, RemoteEvent, StepKind, StopReason, StopReply, WatchKind,
    Watchpoint,
};

type Transcript = Arc<Mutex<Vec<String>>>;

const SP: u16 = 0xFF00;

/// 64K of memory with a return address of 0x8010 on the stack.
fn initial_memory() -> Vec<u8> {
    let mut memory = vec![0u8; 0x10000];
    memory[usize::from(SP)] = 0x10;
    memory[usize::from(SP) + 1] = 0x80;
    memory
}

fn warnings(rx: &mut broadcast::Receiver<RemoteEvent>) -> Vec<String> {
    let mut found = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let RemoteEvent::Warning(message) = event {
            found.push(message);
        }
    }
    found
}

fn pipe() -> (Box<DuplexStream>, DuplexStream) {
    let (client, server) = tokio::io::duplex(0x4000);
    (Box::new(client), server)
}

// ---------------------------------------------------------------------------
// ZEsarUX

fn zesarux_status(pc: u16) -> String {
    format!(
        "PC={pc:04x} SP={SP:04x} AF=2a00 BC=0000 HL=1234 DE=0000 IX=0000 IY=5c3a \
         AF'=0000 BC'=0000 HL'=0000 DE'=0000 I=3f R=00  F=-------- F'=-------- MEMPTR=0000 IM1 IFF-- VPS: 0 "
    )
}

fn spawn_zesarux(stream: DuplexStream, transcript: Transcript) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (read, mut write) = split(stream);
        let mut lines = BufReader::new(read).lines();
        write
            .write_all(b"Welcome to ZEsarUX remote command protocol (ZRCP)\nWrite help for available commands\n\ncommand> ")
            .await
            .unwrap();

        let mut memory = initial_memory();
        let mut slots: BTreeMap<u16, u16> = BTreeMap::new();
        let mut pc: u16 = 0x8000;
        while let Ok(Some(line)) = lines.next_line().await {
            transcript.lock().unwrap().push(line.clone());
            let words: Vec<&str> = line.split_whitespace().collect();
            let reply = match words.as_slice() {
                ["get-version"] => "10.3".to_string(),
                ["get-registers"] => zesarux_status(pc),
                ["read-memory", address, size] => {
                    let address: usize = address.parse().unwrap();
                    let size: usize = size.parse().unwrap();
                    hex::encode(&memory[address..address + size])
                }
                ["write-memory-raw", address, data] => {
                    let address: usize = address.parse().unwrap();
                    let data = hex::decode(data).unwrap();
                    memory[address..address + data.len()].copy_from_slice(&data);
                    String::new()
                }
                ["set-breakpoint", slot, condition] => {
                    let address = condition.trim_start_matches("PC=").trim_end_matches('h');
                    slots.insert(slot.parse().unwrap(), u16::from_str_radix(address, 16).unwrap());
                    String::new()
                }
                ["disable-breakpoint", slot] => {
                    slots.remove(&slot.parse::<u16>().unwrap());
                    String::new()
                }
                ["set-membreakpoint", _, "1", _] => "Error. Read memory breakpoints are not available".to_string(),
                ["run"] => {
                    let mut text = "Running until a breakpoint, key press or data sent, menu opening or other event"
                        .to_string();
                    if let Some(target) = slots.values().copied().filter(|&a| a > pc).min() {
                        pc = target;
                        text.push_str(&format!("\nBreakpoint fired: PC={pc:04X}h"));
                    }
                    text
                }
                ["cpu-step"] => {
                    pc += 1;
                    String::new()
                }
                ["quit"] => {
                    let _ = write.write_all(b"Sayonara baby\n").await;
                    return;
                }
                _ => String::new(),
            };
            let text = if reply.is_empty() { "command> ".to_string() } else { format!("{reply}\ncommand> ") };
            write.write_all(text.as_bytes()).await.unwrap();
        }
    })
}

#[tokio::test]
async fn test_zesarux_debug_cycle() {
    let transcript = Transcript::default();
    let (client, server) = pipe();
    let emulator = spawn_zesarux(server, transcript.clone());

    let remote = ZesaruxRemote::new("localhost".to_string(), 10000, MemoryModel::Zx48k);
    let mut events = remote.subscribe();
    remote.connect_with(client).await.unwrap();

    let regs = remote.read_registers().await.unwrap();
    assert_eq!(regs.pc, 0x8000);
    assert_eq!(regs.hl, 0x1234);
    assert_eq!(regs.slots, vec![0, 1]);

    remote.write_memory(0x8004, &[0xCD, 0x00, 0x90]).await.unwrap();
    assert_eq!(remote.read_memory(0x8004, 3).await.unwrap(), vec![0xCD, 0x00, 0x90]);

    let bp = remote.set_breakpoint(BreakpointRequest::at(0x8003)).await.unwrap();
    assert_eq!(bp.id, 1);
    let stop = remote.resume().await.unwrap();
    assert_eq!(stop, StopReply::new(StopReason::BreakpointHit, 0x8003));

    let stop = remote.step(StepKind::Into).await.unwrap();
    assert_eq!(stop, StopReply::new(StopReason::Step, 0x8004));

    // Runs to the return address found on the stack.
    let stop = remote.step(StepKind::Out).await.unwrap();
    assert_eq!(stop, StopReply::new(StopReason::Step, 0x8010));

    // A rejected watchpoint is a warning, not a failure.
    remote.set_watchpoint(Watchpoint::new(0x4000, 1, WatchKind::Read)).await.unwrap();
    let found = warnings(&mut events);
    assert_eq!(found.len(), 1);
    assert!(found[0].starts_with("Watchpoint at 0x4000 not set: Error."));

    remote.disconnect().await.unwrap();
    timeout(Duration::from_secs(5), emulator).await.unwrap().unwrap();
    assert!(matches!(remote.read_registers().await, Err(RemoteError::Disconnected)));

    let transcript = transcript.lock().unwrap();
    let expected = [
        "get-version",
        "enable-breakpoints",
        "clear-membreakpoints",
        "write-memory-raw 32772 CD0090",
        "read-memory 32772 3",
        "set-breakpoint 1 PC=8003h",
        "enable-breakpoint 1",
        "cpu-step",
        "read-memory 65280 2",
        "set-breakpoint 100 PC=8010h",
        "disable-breakpoint 100",
        "set-membreakpoint 4000h 1 1",
        "quit",
    ];
    for line in expected {
        assert!(transcript.iter().any(|l| l == line), "missing '{line}' in {transcript:?}");
    }
}

#[tokio::test]
async fn test_zesarux_breakpoint_removal() {
    let transcript = Transcript::default();
    let (client, server) = pipe();
    let _emulator = spawn_zesarux(server, transcript.clone());

    let remote = ZesaruxRemote::new("localhost".to_string(), 10000, MemoryModel::Zx48k);
    remote.connect_with(client).await.unwrap();

    let first = remote.set_breakpoint(BreakpointRequest::at(0x8003)).await.unwrap();
    let second = remote.set_breakpoint(BreakpointRequest::at(0x8006)).await.unwrap();
    remote.remove_breakpoint(first.id).await.unwrap();
    assert_eq!(remote.breakpoints().await, vec![second]);

    // The freed slot is handed out again.
    remote.set_breakpoint(BreakpointRequest::at(0x8009)).await.unwrap();
    let err = remote.remove_breakpoint(99).await.unwrap_err();
    assert_eq!(err.to_string(), "Remote reported an error: unknown breakpoint 99");

    let transcript = transcript.lock().unwrap();
    assert!(transcript.iter().any(|l| l == "disable-breakpoint 1"));
    assert!(transcript.iter().any(|l| l == "set-breakpoint 1 PC=8009h"));
}

#[tokio::test]
async fn test_zesarux_pause_while_stopped() {
    let transcript = Transcript::default();
    let (client, server) = pipe();
    let _emulator = spawn_zesarux(server, transcript.clone());

    let remote = ZesaruxRemote::new("localhost".to_string(), 10000, MemoryModel::Zx48k);
    remote.connect_with(client).await.unwrap();

    remote.pause().await.unwrap();
    remote.write_memory(0x9000, &[0x12]).await.unwrap();
    assert_eq!(remote.read_memory(0x9000, 1).await.unwrap(), vec![0x12]);
    assert_eq!(remote.read_registers().await.unwrap().pc, 0x8000);
    assert!(!transcript.lock().unwrap().iter().any(|l| l.is_empty()));
}

#[tokio::test]
async fn test_zesarux_breakpoint_in_other_bank_continues() {
    let transcript = Transcript::default();
    let (client, server) = pipe();
    // Every run stops at 0xC000, first with bank 0 in the top slot, then bank 7.
    let _emulator = tokio::spawn({
        let transcript = transcript.clone();
        async move {
            let (read, mut write) = split(server);
            let mut lines = BufReader::new(read).lines();
            write.write_all(b"Welcome to ZEsarUX remote command protocol (ZRCP)\ncommand> ").await.unwrap();
            let mut pages = [0u8, 7].into_iter();
            let (mut pc, mut top) = (0x8000u16, 0u8);
            while let Ok(Some(line)) = lines.next_line().await {
                transcript.lock().unwrap().push(line.clone());
                let reply = match line.as_str() {
                    "get-registers" => format!("{}MMU=80000005000200{top:02x}\n", zesarux_status(pc)),
                    "run" => match pages.next() {
                        Some(page) => {
                            (pc, top) = (0xC000, page);
                            "Breakpoint fired: PC=C000h\n".to_string()
                        }
                        None => String::new(),
                    },
                    _ => String::new(),
                };
                write.write_all(format!("{reply}command> ").as_bytes()).await.unwrap();
            }
        }
    });

    let remote = ZesaruxRemote::new("localhost".to_string(), 10000, MemoryModel::Zx128k);
    remote.connect_with(client).await.unwrap();
    assert_eq!(remote.read_registers().await.unwrap().slots, vec![8, 5, 2, 0]);

    remote.set_breakpoint(BreakpointRequest::at(LongAddress::banked(0xC000, 7))).await.unwrap();
    let stop = remote.resume().await.unwrap();
    assert_eq!(stop, StopReply::new(StopReason::BreakpointHit, 0xC000));
    assert_eq!(remote.read_registers().await.unwrap().slots, vec![8, 5, 2, 7]);

    let transcript = transcript.lock().unwrap();
    assert_eq!(transcript.iter().filter(|l| *l == "run").count(), 2);
    assert!(transcript.iter().any(|l| l == "set-breakpoint 1 PC=C000h"));
}

// ---------------------------------------------------------------------------
// MAME gdbstub

fn mame_registers(pc: u16) -> String {
    // af bc de hl af' bc' de' hl' ix iy sp pc
    [0x2A00, 0, 0, 0x1234, 0, 0, 0, 0, 0, 0x5C3A, SP, pc].iter().map(|&v| encode_le(v, 2)).collect()
}

fn spawn_mame(stream: DuplexStream, architecture: &'static str, transcript: Transcript) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (read, mut write) = split(stream);
        let mut reader = BufReader::new(read);
        let mut memory = initial_memory();
        let mut breakpoints = BTreeSet::new();
        let mut pc: u16 = 0x8000;

        while let Ok(packet) = read_packet(&mut reader).await {
            transcript.lock().unwrap().push(packet.clone());
            let stop = |pc: u16| format!("T05{:02x}:{};", 0x0b, encode_le(pc, 2));
            let reply = match packet.as_bytes().first() {
                _ if packet.starts_with("qSupported") => "PacketSize=7fff;qXfer:features:read+".to_string(),
                _ if packet.starts_with("qXfer:features:read:target.xml:") => {
                    format!(
                        "l<?xml version=\"1.0\"?>\n<!DOCTYPE target SYSTEM \"gdb-target.dtd\">\n\
                         <target version=\"1.0\"><architecture>{architecture}</architecture></target>"
                    )
                }
                Some(b'?') => stop(pc),
                Some(b'g') => mame_registers(pc),
                Some(b'c') => {
                    pc = breakpoints.range(pc + 1..).next().copied().unwrap_or(pc);
                    stop(pc)
                }
                Some(b's') => {
                    pc += 1;
                    stop(pc)
                }
                Some(b'm') => {
                    let (address, size) = packet[1..].split_once(',').unwrap();
                    let address = usize::from_str_radix(address, 16).unwrap();
                    let size = usize::from_str_radix(size, 16).unwrap();
                    hex::encode(&memory[address..address + size])
                }
                Some(b'M') => {
                    let (header, data) = packet[1..].split_once(':').unwrap();
                    let address = usize::from_str_radix(header.split(',').next().unwrap(), 16).unwrap();
                    let data = hex::decode(data).unwrap();
                    memory[address..address + data.len()].copy_from_slice(&data);
                    "OK".to_string()
                }
                _ if packet.starts_with("Z0,") || packet.starts_with("z0,") => {
                    let address = packet[3..].split(',').next().unwrap();
                    let address = u16::from_str_radix(address, 16).unwrap();
                    if packet.starts_with('Z') {
                        breakpoints.insert(address);
                    } else {
                        breakpoints.remove(&address);
                    }
                    "OK".to_string()
                }
                Some(b'Z' | b'z') => String::new(),
                Some(b'P' | b'D') => "OK".to_string(),
                _ => String::new(),
            };
            write.write_all(b"+").await.unwrap();
            write.write_all(frame(&reply).as_bytes()).await.unwrap();
            if packet == "D" {
                return;
            }
        }
    })
}

#[tokio::test]
async fn test_mame_debug_cycle() {
    let transcript = Transcript::default();
    let (client, server) = pipe();
    let emulator = spawn_mame(server, "z80", transcript.clone());

    let remote = MameRemote::new("localhost".to_string(), 12000);
    let mut events = remote.subscribe();
    remote.connect_with(client).await.unwrap();

    let regs = remote.read_registers().await.unwrap();
    assert_eq!(regs.pc, 0x8000);
    assert_eq!(regs.af, 0x2A00);
    assert_eq!(regs.iy, 0x5C3A);

    remote.write_memory(0x8004, &[0xCD, 0x00, 0x90]).await.unwrap();

    remote.set_breakpoint(BreakpointRequest::at(0x8003)).await.unwrap();
    let stop = remote.resume().await.unwrap();
    assert_eq!(stop, StopReply::new(StopReason::BreakpointHit, 0x8003));

    let stop = remote.step(StepKind::Into).await.unwrap();
    assert_eq!(stop, StopReply::new(StopReason::Step, 0x8004));

    // CALL 0x9000 is stepped over with a temporary breakpoint behind it.
    let stop = remote.step(StepKind::Over).await.unwrap();
    assert_eq!(stop, StopReply::new(StopReason::Step, 0x8007));

    remote.set_watchpoint(Watchpoint::new(0x4000, 2, WatchKind::Read)).await.unwrap();
    let found = warnings(&mut events);
    assert_eq!(found.len(), 1);
    assert!(found[0].starts_with("Watchpoint at 0x4000 rejected"));

    remote.disconnect().await.unwrap();
    timeout(Duration::from_secs(5), emulator).await.unwrap().unwrap();

    let transcript = transcript.lock().unwrap();
    let expected = [
        "qSupported:xmlRegisters=z80",
        "qXfer:features:read:target.xml:0,7ff",
        "?",
        "M8004,3:cd0090",
        "Z0,8003,1",
        "s",
        "m8004,4",
        "Z0,8007,1",
        "z0,8007,1",
        "Z3,4000,2",
        "D",
    ];
    for packet in expected {
        assert!(transcript.iter().any(|p| p == packet), "missing '{packet}' in {transcript:?}");
    }
}

#[tokio::test]
async fn test_mame_rejects_other_architectures() {
    let (client, server) = pipe();
    let _emulator = spawn_mame(server, "i386", Transcript::default());

    let remote = MameRemote::new("localhost".to_string(), 12000);
    let err = remote.connect_with(client).await.unwrap_err();
    assert!(matches!(err, RemoteError::Gdb(GdbError::WrongArchitecture(ref arch)) if arch == "i386"));
    assert!(err.to_string().contains("Please select a Z80 driver/ROM"));
    assert!(matches!(remote.read_registers().await, Err(RemoteError::Disconnected)));
}

// ---------------------------------------------------------------------------
// DZRP

async fn read_request(stream: &mut DuplexStream) -> Option<(u8, u8, Vec<u8>)> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await.ok()?;
    let mut body = vec![0u8; u32::from_le_bytes(len) as usize];
    stream.read_exact(&mut body).await.ok()?;
    let payload = body.split_off(2);
    Some((body[0], body[1], payload))
}

async fn send_frame(stream: &mut DuplexStream, seq: u8, payload: &[u8]) {
    let mut frame = ((payload.len() + 1) as u32).to_le_bytes().to_vec();
    frame.push(seq);
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await.unwrap();
}

async fn notify_stop(stream: &mut DuplexStream, why: u8, pc: u16) {
    let [lo, hi] = pc.to_le_bytes();
    send_frame(stream, 0, &[NTF_PAUSE, why, lo, hi, 0, 0]).await;
}

fn dzrp_registers(pc: u16) -> Vec<u8> {
    let mut payload = Vec::new();
    for word in [pc, SP, 0x2A00, 0, 0, 0x1234, 0, 0x5C3A, 0, 0, 0, 0] {
        payload.extend_from_slice(&word.to_le_bytes());
    }
    // R, I, IM, reserved, slot count, slots
    payload.extend_from_slice(&[0, 0x3F, 1, 0, 2, 0, 1]);
    payload
}

/// `parked` is signalled when a continue has no breakpoint ahead and waits
/// for a pause.
fn spawn_dzrp(mut stream: DuplexStream, transcript: Transcript, parked: mpsc::UnboundedSender<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut memory = initial_memory();
        let mut breakpoints: BTreeMap<u16, u16> = BTreeMap::new();
        let mut next_id = 1u16;
        let mut pc: u16 = 0x8000;
        let mut running = false;

        while let Some((seq, command, payload)) = read_request(&mut stream).await {
            transcript.lock().unwrap().push(format!("{command} {payload:02X?}"));
            match command {
                cmd::INIT => {
                    let mut reply = vec![0, 2, 0, 0, 2];
                    reply.extend_from_slice(b"fake\0");
                    send_frame(&mut stream, seq, &reply).await;
                }
                cmd::GET_REGISTERS => send_frame(&mut stream, seq, &dzrp_registers(pc)).await,
                cmd::READ_MEM => {
                    let address = usize::from(u16::from_le_bytes([payload[1], payload[2]]));
                    let size = usize::from(u16::from_le_bytes([payload[3], payload[4]]));
                    send_frame(&mut stream, seq, &memory[address..address + size]).await;
                }
                cmd::WRITE_MEM => {
                    let address = usize::from(u16::from_le_bytes([payload[1], payload[2]]));
                    memory[address..address + payload.len() - 3].copy_from_slice(&payload[3..]);
                    send_frame(&mut stream, seq, &[0]).await;
                }
                cmd::ADD_BREAKPOINT => {
                    breakpoints.insert(next_id, u16::from_le_bytes([payload[0], payload[1]]));
                    send_frame(&mut stream, seq, &next_id.to_le_bytes()).await;
                    next_id += 1;
                }
                cmd::REMOVE_BREAKPOINT => {
                    breakpoints.remove(&u16::from_le_bytes([payload[0], payload[1]]));
                    send_frame(&mut stream, seq, &[]).await;
                }
                cmd::ADD_WATCHPOINT => {
                    let code = u8::from(payload[4] == 1);
                    send_frame(&mut stream, seq, &[code]).await;
                }
                cmd::CONTINUE => {
                    send_frame(&mut stream, seq, &[]).await;
                    if payload[6] == ALT_STEP_INTO {
                        pc += 1;
                        notify_stop(&mut stream, reason::NONE, pc).await;
                        continue;
                    }
                    let temporary = [(payload[0], payload[1], payload[2]), (payload[3], payload[4], payload[5])]
                        .into_iter()
                        .filter(|(enabled, ..)| *enabled != 0)
                        .map(|(_, lo, hi)| u16::from_le_bytes([lo, hi]));
                    let target = breakpoints.values().copied().chain(temporary).filter(|&a| a > pc).min();
                    match target {
                        Some(target) => {
                            pc = target;
                            let why = if breakpoints.values().any(|&a| a == pc) { reason::BREAKPOINT } else { reason::NONE };
                            notify_stop(&mut stream, why, pc).await;
                        }
                        None => {
                            running = true;
                            let _ = parked.send(());
                        }
                    }
                }
                cmd::PAUSE => {
                    send_frame(&mut stream, seq, &[]).await;
                    if running {
                        running = false;
                        notify_stop(&mut stream, reason::MANUAL, pc).await;
                    }
                }
                cmd::CLOSE => {
                    send_frame(&mut stream, seq, &[]).await;
                    return;
                }
                _ => send_frame(&mut stream, seq, &[]).await,
            }
        }
    })
}

#[tokio::test]
async fn test_dzrp_debug_cycle() {
    let transcript = Transcript::default();
    let (parked_tx, mut parked_rx) = mpsc::unbounded_channel();
    let (client, server) = pipe();
    let emulator = spawn_dzrp(server, transcript.clone(), parked_tx);

    let remote = Arc::new(DzrpRemote::new("localhost".to_string(), 11000));
    let mut events = remote.subscribe();
    remote.connect_with(client).await.unwrap();

    let regs = remote.read_registers().await.unwrap();
    assert_eq!(regs.pc, 0x8000);
    assert_eq!(regs.hl, 0x1234);
    assert_eq!(regs.i, 0x3F);
    assert_eq!(regs.slots, vec![0, 1]);

    remote.write_memory(0x9000, &[1, 2, 3]).await.unwrap();
    assert_eq!(remote.read_memory(0x9000, 3).await.unwrap(), vec![1, 2, 3]);

    let bp = remote.set_breakpoint(BreakpointRequest::at(0x8003)).await.unwrap();
    let stop = remote.resume().await.unwrap();
    assert_eq!(stop, StopReply::new(StopReason::BreakpointHit, 0x8003));

    let stop = remote.step(StepKind::Into).await.unwrap();
    assert_eq!(stop, StopReply::new(StopReason::Step, 0x8004));

    let stop = remote.step(StepKind::Out).await.unwrap();
    assert_eq!(stop, StopReply::new(StopReason::Step, 0x8010));

    remote.remove_breakpoint(bp.id).await.unwrap();
    assert!(remote.breakpoints().await.is_empty());

    remote.set_watchpoint(Watchpoint::new(0x4000, 1, WatchKind::Read)).await.unwrap();
    let found = warnings(&mut events);
    assert_eq!(found, vec!["Watchpoint at 0x4000 rejected (error 1)".to_string()]);

    // Nothing ahead to stop at: the run only ends on pause.
    let running = tokio::spawn({
        let remote = remote.clone();
        async move { remote.resume().await }
    });
    timeout(Duration::from_secs(5), parked_rx.recv()).await.unwrap().unwrap();
    remote.pause().await.unwrap();
    let stop = timeout(Duration::from_secs(5), running).await.unwrap().unwrap().unwrap();
    assert_eq!(stop, StopReply::new(StopReason::Paused, 0x8010));

    remote.disconnect().await.unwrap();
    timeout(Duration::from_secs(5), emulator).await.unwrap().unwrap();

    let transcript = transcript.lock().unwrap();
    let commands: Vec<u8> =
        transcript.iter().map(|l| l.split(' ').next().unwrap().parse().unwrap()).collect();
    assert_eq!(commands.first(), Some(&cmd::INIT));
    assert_eq!(commands.last(), Some(&cmd::CLOSE));
    assert!(commands.contains(&cmd::REMOVE_BREAKPOINT));
    assert!(commands.contains(&cmd::PAUSE));
}

#[tokio::test]
async fn test_dzrp_init_rejected() {
    let (client, mut server) = pipe();
    let emulator = tokio::spawn(async move {
        let (seq, command, _) = read_request(&mut server).await.unwrap();
        assert_eq!(command, cmd::INIT);
        let mut reply = vec![1, 2, 0, 0, 0];
        reply.extend_from_slice(b"version mismatch\0");
        send_frame(&mut server, seq, &reply).await;
    });

    let remote = DzrpRemote::new("localhost".to_string(), 11000);
    let err = remote.connect_with(client).await.unwrap_err();
    assert_eq!(err.to_string(), "Remote reported an error: INIT rejected: version mismatch");
    emulator.await.unwrap();
}

#[tokio::test]
async fn test_dzrp_pause_while_stopped() {
    let transcript = Transcript::default();
    let (parked_tx, _parked_rx) = mpsc::unbounded_channel();
    let (client, server) = pipe();
    let _emulator = spawn_dzrp(server, transcript.clone(), parked_tx);

    let remote = DzrpRemote::new("localhost".to_string(), 11000);
    remote.connect_with(client).await.unwrap();

    // Nothing is running, so there is nothing to interrupt.
    remote.pause().await.unwrap();
    assert_eq!(remote.read_registers().await.unwrap().pc, 0x8000);
    assert_eq!(remote.read_registers().await.unwrap().pc, 0x8000);

    let pause = format!("{} ", cmd::PAUSE);
    assert!(!transcript.lock().unwrap().iter().any(|l| l.starts_with(&pause)));
}

#[tokio::test]
async fn test_dzrp_drops_stale_responses() {
    let (client, mut server) = pipe();
    let emulator = tokio::spawn(async move {
        let (seq, command, _) = read_request(&mut server).await.unwrap();
        assert_eq!(command, cmd::INIT);
        let mut reply = vec![0, 2, 0, 0, 2];
        reply.extend_from_slice(b"fake\0");
        send_frame(&mut server, seq, &reply).await;

        // A late answer to an earlier PAUSE arrives ahead of the real reply.
        let (seq, command, _) = read_request(&mut server).await.unwrap();
        assert_eq!(command, cmd::GET_REGISTERS);
        send_frame(&mut server, seq.wrapping_sub(1), &[]).await;
        send_frame(&mut server, seq, &dzrp_registers(0x8123)).await;
    });

    let remote = DzrpRemote::new("localhost".to_string(), 11000);
    remote.connect_with(client).await.unwrap();
    assert_eq!(remote.read_registers().await.unwrap().pc, 0x8123);
    emulator.await.unwrap();
}
