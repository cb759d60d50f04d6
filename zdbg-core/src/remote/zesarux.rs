//! ZEsarUX remote command protocol.
//!
//! A line based text protocol: every command is terminated by a newline and
//! answered with free text followed by a `command> ` prompt. Registers are
//! reported as one status line decoded by [`RegisterLineDecoder`].

use super::link::Link;
use super::{notify_stopped, resolve_stop, warn, Remote, RemoteError, RemoteEvent, RemoteKind, EVENT_CAPACITY};
use crate::debug::stepping::return_address;
use crate::debug::{
    Breakpoint, BreakpointManager, BreakpointRequest, StepKind, StopReason, StopReply, WatchKind, Watchpoint,
};
use crate::memory::MemoryModel;
use crate::registers::{RegisterLineDecoder, RegisterSet, Z80Register};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{broadcast, Mutex};

pub const DEFAULT_PORT: u16 = 10000;

/// Breakpoint slots 1..=99 are handed out to user breakpoints.
const USER_SLOTS: u16 = 99;
/// Slot reserved for the temporary breakpoint of a step-out.
const TEMP_SLOT: u16 = 100;

const MEMBP_DISABLED: u8 = 0;

fn membp_type(kind: WatchKind) -> u8 {
    match kind {
        WatchKind::Read => 1,
        WatchKind::Write => 2,
        WatchKind::Access => 3,
    }
}

/// Read a reply up to and excluding the prompt line.
///
/// The prompt is a line starting with `command` and ending in `> `, e.g.
/// `command> ` or `command@cpu-step> `.
pub async fn read_reply<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<String> {
    let mut buf = Vec::new();
    loop {
        let n = reader.read_until(b' ', &mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed before prompt"));
        }
        if buf.ends_with(b"> ") {
            let start = buf.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
            if buf[start..].starts_with(b"command") {
                buf.truncate(start);
                break;
            }
        }
    }
    Ok(String::from_utf8_lossy(&buf).trim_end().to_string())
}

/// Locate the first `XXXXh` token after `marker`.
fn hex_after(text: &str, marker: &str) -> Option<u16> {
    let rest = &text[text.find(marker)? + marker.len()..];
    rest.split(|c: char| !c.is_ascii_hexdigit() && c != 'h' && c != 'H')
        .filter_map(|tok| tok.strip_suffix(['h', 'H']))
        .find_map(|digits| u16::from_str_radix(digits, 16).ok())
}

/// Classify the text returned by `run`.
fn classify_run_reply(text: &str, pc: u16) -> Option<StopReply> {
    if let Some(pos) = text.find("Memory breakpoint fired") {
        let detail = text[pos..].to_ascii_lowercase();
        let kind = if detail.contains("read") && detail.contains("write") {
            WatchKind::Access
        } else if detail.contains("read") {
            WatchKind::Read
        } else {
            WatchKind::Write
        };
        let address = hex_after(&text[pos..], "fired").unwrap_or(pc);
        return Some(StopReply::new(kind.stop_reason(), address));
    }
    if text.contains("Breakpoint fired") {
        return Some(StopReply::new(StopReason::BreakpointHit, pc));
    }
    None
}

struct State {
    decoder: RegisterLineDecoder,
    breakpoints: BreakpointManager,
    /// Breakpoint id to ZEsarUX breakpoint slot.
    slots: HashMap<u32, u16>,
}

pub struct ZesaruxRemote {
    host: String,
    port: u16,
    model: MemoryModel,
    link: Link,
    state: Mutex<State>,
    pause_requested: AtomicBool,
    /// Set while a `run` command is pending.
    running: AtomicBool,
    events: broadcast::Sender<RemoteEvent>,
}

impl ZesaruxRemote {
    pub fn new(host: String, port: u16, model: MemoryModel) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            host,
            port,
            model,
            link: Link::new("zesarux", events.clone()),
            state: Mutex::new(State {
                decoder: RegisterLineDecoder::new(model),
                breakpoints: BreakpointManager::new(),
                slots: HashMap::new(),
            }),
            pause_requested: AtomicBool::new(false),
            running: AtomicBool::new(false),
            events,
        }
    }

    /// Use an already established stream and perform the handshake.
    pub async fn connect_with(&self, transport: Box<dyn super::Transport>) -> Result<(), RemoteError> {
        self.link.attach(transport).await;
        if let Err(err) = self.handshake().await {
            self.link.close().await;
            return Err(err);
        }
        Ok(())
    }

    async fn handshake(&self) -> Result<(), RemoteError> {
        {
            let mut ex = self.link.begin().await?;
            let greeting = read_reply(ex.reader()).await;
            let greeting = ex.check(greeting).await?;
            log::debug!("zesarux <- {greeting}");
        }
        let version = self.command("get-version").await?;
        log::info!("Connected to ZEsarUX {version}");
        self.command("enable-breakpoints").await?;
        self.command("clear-membreakpoints").await?;
        // Fails the connection if the status line lacks a register.
        let regs = self.read_registers().await?;
        log::debug!("Initial registers: {regs}");
        Ok(())
    }

    async fn command(&self, cmd: &str) -> Result<String, RemoteError> {
        let mut ex = self.link.begin().await?;
        log::debug!("zesarux -> {cmd}");
        ex.send(format!("{cmd}\n").as_bytes()).await?;
        let reply = read_reply(ex.reader()).await;
        let reply = ex.check(reply).await?;
        log::debug!("zesarux <- {reply}");
        if let Some(err) = reply.lines().find(|line| line.starts_with("Error")) {
            return Err(RemoteError::Remote(err.to_string()));
        }
        Ok(reply)
    }

    fn free_slot(state: &State) -> Option<u16> {
        (1..=USER_SLOTS).find(|slot| !state.slots.values().any(|used| used == slot))
    }

    async fn arm_slot(&self, slot: u16, address: u16) -> Result<(), RemoteError> {
        self.command(&format!("set-breakpoint {slot} PC={address:04X}h")).await?;
        self.command(&format!("enable-breakpoint {slot}")).await?;
        Ok(())
    }

    /// Run until the given temporary breakpoint, used by step-out.
    async fn run_to(&self, address: u16) -> Result<StopReply, RemoteError> {
        self.state.lock().await.breakpoints.arm_temporary(address);
        self.arm_slot(TEMP_SLOT, address).await?;
        let result = self.run_until_stop().await;
        self.state.lock().await.breakpoints.clear_temporary();
        self.command(&format!("disable-breakpoint {TEMP_SLOT}")).await?;
        result
    }

    async fn run_until_stop(&self) -> Result<StopReply, RemoteError> {
        loop {
            self.pause_requested.store(false, Ordering::SeqCst);
            self.running.store(true, Ordering::SeqCst);
            let text = self.command("run").await;
            self.running.store(false, Ordering::SeqCst);
            let text = text?;
            let regs = self.read_registers().await?;
            let paused = self.pause_requested.swap(false, Ordering::SeqCst);

            let state = self.state.lock().await;
            let armed = state.breakpoints.is_armed(regs.pc, self.model, &regs.slots)
                || state.breakpoints.check_tmp_breakpoints(Some(regs.pc), None);
            let stop = match classify_run_reply(&text, regs.pc) {
                Some(stop) => stop,
                None if armed => StopReply::new(StopReason::BreakpointHit, regs.pc),
                None if paused => StopReply::new(StopReason::Paused, regs.pc),
                None => StopReply::new(StopReason::Unknown, regs.pc),
            };
            if let Some(report) = resolve_stop(&state.breakpoints, self.model, stop, &regs, &self.events) {
                return Ok(report);
            }
        }
    }
}

#[async_trait]
impl Remote for ZesaruxRemote {
    fn kind(&self) -> RemoteKind {
        RemoteKind::Zesarux
    }

    fn subscribe(&self) -> broadcast::Receiver<RemoteEvent> {
        self.events.subscribe()
    }

    async fn connect(&self) -> Result<(), RemoteError> {
        self.link.open_tcp(&self.host, self.port).await?;
        if let Err(err) = self.handshake().await {
            self.link.close().await;
            return Err(err);
        }
        Ok(())
    }

    async fn read_registers(&self) -> Result<RegisterSet, RemoteError> {
        let line = self.command("get-registers").await?;
        let mut state = self.state.lock().await;
        Ok(state.decoder.decode(&line)?)
    }

    async fn write_register(&self, register: Z80Register, value: u16) -> Result<(), RemoteError> {
        self.command(&format!("set-register {}={value:04X}h", register.name())).await?;
        Ok(())
    }

    async fn read_memory(&self, address: u16, size: u16) -> Result<Vec<u8>, RemoteError> {
        let reply = self.command(&format!("read-memory {address} {size}")).await?;
        let data = hex::decode(reply.trim())
            .map_err(|e| RemoteError::UnexpectedResponse(format!("read-memory: {e}")))?;
        if data.len() != usize::from(size) {
            return Err(RemoteError::UnexpectedResponse(format!(
                "read-memory returned {} bytes, expected {size}",
                data.len()
            )));
        }
        Ok(data)
    }

    async fn write_memory(&self, address: u16, data: &[u8]) -> Result<(), RemoteError> {
        self.command(&format!("write-memory-raw {address} {}", hex::encode_upper(data))).await?;
        Ok(())
    }

    async fn set_breakpoint(&self, request: BreakpointRequest) -> Result<Breakpoint, RemoteError> {
        let mut state = self.state.lock().await;
        let (bp, created) = state.breakpoints.add(request).map_err(RemoteError::Condition)?;
        if !created {
            return Ok(bp);
        }
        let Some(slot) = Self::free_slot(&state) else {
            state.breakpoints.remove(bp.id);
            return Err(RemoteError::Remote("no free breakpoint slot".to_string()));
        };
        state.slots.insert(bp.id, slot);
        drop(state);

        if let Err(err) = self.arm_slot(slot, bp.address.address()).await {
            let mut state = self.state.lock().await;
            state.slots.remove(&bp.id);
            state.breakpoints.remove(bp.id);
            return Err(err);
        }
        Ok(bp)
    }

    async fn remove_breakpoint(&self, id: u32) -> Result<(), RemoteError> {
        let mut state = self.state.lock().await;
        if state.breakpoints.remove(id).is_none() {
            return Err(RemoteError::Remote(format!("unknown breakpoint {id}")));
        }
        let slot = state.slots.remove(&id);
        drop(state);
        if let Some(slot) = slot {
            self.command(&format!("disable-breakpoint {slot}")).await?;
        }
        Ok(())
    }

    async fn breakpoints(&self) -> Vec<Breakpoint> {
        self.state.lock().await.breakpoints.list()
    }

    async fn set_watchpoint(&self, watchpoint: Watchpoint) -> Result<(), RemoteError> {
        let cmd = format!(
            "set-membreakpoint {:04X}h {} {}",
            watchpoint.address,
            membp_type(watchpoint.kind),
            watchpoint.size.max(1)
        );
        match self.command(&cmd).await {
            Ok(_) => {
                self.state.lock().await.breakpoints.add_watchpoint(watchpoint);
                Ok(())
            }
            Err(RemoteError::Remote(message)) => {
                warn(&self.events, format!("Watchpoint at 0x{:04X} not set: {message}", watchpoint.address));
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn remove_watchpoint(&self, watchpoint: Watchpoint) -> Result<(), RemoteError> {
        if !self.state.lock().await.breakpoints.remove_watchpoint(&watchpoint) {
            return Ok(());
        }
        let cmd = format!(
            "set-membreakpoint {:04X}h {MEMBP_DISABLED} {}",
            watchpoint.address,
            watchpoint.size.max(1)
        );
        self.command(&cmd).await?;
        Ok(())
    }

    async fn resume(&self) -> Result<StopReply, RemoteError> {
        let stop = self.run_until_stop().await?;
        notify_stopped(&self.events, stop);
        Ok(stop)
    }

    async fn pause(&self) -> Result<(), RemoteError> {
        if !self.link.is_connected() {
            return Err(RemoteError::Disconnected);
        }
        // Any input interrupts a running `run` command. While idle it would
        // only produce an extra prompt.
        if !self.running.load(Ordering::SeqCst) {
            log::debug!("zesarux: not running, pause ignored");
            return Ok(());
        }
        self.pause_requested.store(true, Ordering::SeqCst);
        self.link.send_out_of_band(b"\n").await
    }

    async fn step(&self, kind: StepKind) -> Result<StopReply, RemoteError> {
        let stop = match kind {
            StepKind::Into | StepKind::Over => {
                let cmd = if kind == StepKind::Into { "cpu-step" } else { "cpu-step-over" };
                self.command(cmd).await?;
                let regs = self.read_registers().await?;
                StopReply::new(StopReason::Step, regs.pc)
            }
            StepKind::Out => {
                let regs = self.read_registers().await?;
                let stack = self.read_memory(regs.sp, 2).await?;
                let target = return_address(&stack)
                    .ok_or_else(|| RemoteError::UnexpectedResponse("short stack read".to_string()))?;
                self.run_to(target).await?
            }
        };
        notify_stopped(&self.events, stop);
        Ok(stop)
    }

    async fn disconnect(&self) -> Result<(), RemoteError> {
        // The emulator closes the socket after `quit`, there is no prompt to wait for.
        if let Ok(mut ex) = self.link.begin().await {
            log::debug!("zesarux -> quit");
            let _ = ex.send(b"quit\n").await;
        }
        self.link.close().await;
        self.state.lock().await.breakpoints.clear_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_read_reply_strips_prompt() {
        let mut reader = BufReader::new("PC=8000 SP=ff4a\ncommand> ".as_bytes());
        assert_eq!(read_reply(&mut reader).await.unwrap(), "PC=8000 SP=ff4a");

        let mut reader = BufReader::new("done\ncommand@cpu-step> ".as_bytes());
        assert_eq!(read_reply(&mut reader).await.unwrap(), "done");

        let mut reader = BufReader::new("A> B\ncommand> ".as_bytes());
        assert_eq!(read_reply(&mut reader).await.unwrap(), "A> B");
    }

    #[tokio::test]
    async fn test_read_reply_eof() {
        let mut reader = BufReader::new("no prompt".as_bytes());
        let err = read_reply(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_classify_run_reply() {
        let text = "Running until a breakpoint, key press or data sent, menu opening or other event\n\
                    Breakpoint fired: PC=8003h";
        assert_eq!(classify_run_reply(text, 0x8003), Some(StopReply::new(StopReason::BreakpointHit, 0x8003)));

        let text = "Memory breakpoint fired: write address 4000h";
        assert_eq!(classify_run_reply(text, 0x8010), Some(StopReply::new(StopReason::WatchpointWrite, 0x4000)));

        let text = "Memory breakpoint fired: read";
        assert_eq!(classify_run_reply(text, 0x8010), Some(StopReply::new(StopReason::WatchpointRead, 0x8010)));

        assert_eq!(classify_run_reply("Running until a breakpoint", 0x8000), None);
    }
}
