//! DZRP binary protocol backend.
//!
//! Frames are `[length u32 LE][seq u8][command u8][payload]` for requests and
//! `[length u32 LE][seq u8][payload]` for responses, the length counting the
//! bytes after the length field. A frame with sequence number 0 is a
//! notification sent by the remote when execution stopped.

use super::link::{Exchange, Link};
use super::{notify_stopped, resolve_stop, warn, Remote, RemoteError, RemoteEvent, RemoteKind, EVENT_CAPACITY};
use crate::debug::stepping::{return_address, step_over_target, LOOKAHEAD};
use crate::debug::{
    Breakpoint, BreakpointManager, BreakpointRequest, StepKind, StopReason, StopReply, WatchKind, Watchpoint,
};
use crate::memory::{LongAddress, MemoryModel};
use crate::registers::{RegisterSet, Z80Register};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{broadcast, Mutex};

pub const DEFAULT_PORT: u16 = 11000;

/// Protocol version announced on init.
pub const VERSION: [u8; 3] = [2, 0, 0];

/// Frames larger than this are treated as a corrupt stream.
const MAX_FRAME: usize = 0x1_0000 + 16;

pub mod cmd {
    pub const INIT: u8 = 1;
    pub const CLOSE: u8 = 2;
    pub const GET_REGISTERS: u8 = 3;
    pub const SET_REGISTER: u8 = 4;
    pub const CONTINUE: u8 = 6;
    pub const PAUSE: u8 = 7;
    pub const READ_MEM: u8 = 8;
    pub const WRITE_MEM: u8 = 9;
    pub const ADD_BREAKPOINT: u8 = 40;
    pub const REMOVE_BREAKPOINT: u8 = 41;
    pub const ADD_WATCHPOINT: u8 = 42;
    pub const REMOVE_WATCHPOINT: u8 = 43;
}

/// Notification id of a stop.
pub const NTF_PAUSE: u8 = 1;

/// Alternate commands carried by CONTINUE.
pub const ALT_NONE: u8 = 0;
pub const ALT_STEP_INTO: u8 = 1;

/// Break reasons carried by a stop notification.
pub mod reason {
    pub const NONE: u8 = 0;
    pub const MANUAL: u8 = 1;
    pub const BREAKPOINT: u8 = 2;
    pub const WATCHPOINT_READ: u8 = 3;
    pub const WATCHPOINT_WRITE: u8 = 4;
    pub const OTHER: u8 = 5;
}

fn machine_model(machine: u8) -> MemoryModel {
    match machine {
        1 => MemoryModel::Zx16k,
        2 => MemoryModel::Zx48k,
        3 => MemoryModel::Zx128k,
        4 => MemoryModel::ZxNext,
        _ => MemoryModel::Unknown,
    }
}

fn access_code(kind: WatchKind) -> u8 {
    match kind {
        WatchKind::Read => 1,
        WatchKind::Write => 2,
        WatchKind::Access => 3,
    }
}

/// Register number used by SET_REGISTER: the position in [`Z80Register::ALL`].
pub fn register_number(register: Z80Register) -> u8 {
    Z80Register::ALL.iter().position(|r| *r == register).unwrap_or_default() as u8
}

/// Encode a request frame.
pub fn encode_request(seq: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() + 2) as u32;
    let mut frame = Vec::with_capacity(payload.len() + 6);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.push(seq);
    frame.push(command);
    frame.extend_from_slice(payload);
    frame
}

/// Read one response or notification frame: `(seq, payload)`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<(u8, Vec<u8>)> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len).await?;
    let len = u32::from_le_bytes(len) as usize;
    if len == 0 || len > MAX_FRAME {
        return Err(io::Error::new(io::ErrorKind::InvalidData, format!("invalid frame length {len}")));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let payload = body.split_off(1);
    Ok((body[0], payload))
}

/// A decoded stop notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub reason: u8,
    pub address: LongAddress,
    pub text: String,
}

impl Notification {
    pub fn parse(payload: &[u8]) -> Result<Self, RemoteError> {
        let [id, reason, lo, hi, bank, rest @ ..] = payload else {
            return Err(RemoteError::UnexpectedResponse(format!("short notification: {payload:02X?}")));
        };
        if *id != NTF_PAUSE {
            return Err(RemoteError::UnexpectedResponse(format!("unknown notification {id}")));
        }
        let address = u16::from_le_bytes([*lo, *hi]);
        let address = match bank {
            0 => LongAddress::plain(address),
            bank => LongAddress::banked(address, bank - 1),
        };
        let text = rest.split(|&b| b == 0).next().map(String::from_utf8_lossy).unwrap_or_default();
        Ok(Self { reason: *reason, address, text: text.to_string() })
    }

    fn stop_reason(&self) -> StopReason {
        match self.reason {
            reason::NONE | reason::MANUAL => StopReason::Paused,
            reason::BREAKPOINT => StopReason::BreakpointHit,
            reason::WATCHPOINT_READ => StopReason::WatchpointRead,
            reason::WATCHPOINT_WRITE => StopReason::WatchpointWrite,
            _ => StopReason::Unknown,
        }
    }
}

/// Decode a GET_REGISTERS response.
pub fn decode_registers(payload: &[u8]) -> Result<RegisterSet, RemoteError> {
    const WORDS: usize = 12;
    let short = || RemoteError::UnexpectedResponse(format!("short register block ({} bytes)", payload.len()));
    if payload.len() < WORDS * 2 + 5 {
        return Err(short());
    }
    let word = |i: usize| u16::from_le_bytes([payload[i * 2], payload[i * 2 + 1]]);
    let tail = &payload[WORDS * 2..];
    let slot_count = usize::from(tail[4]);
    let slots = tail.get(5..5 + slot_count).ok_or_else(short)?.to_vec();
    Ok(RegisterSet {
        pc: word(0),
        sp: word(1),
        af: word(2),
        bc: word(3),
        de: word(4),
        hl: word(5),
        ix: word(6),
        iy: word(7),
        af2: word(8),
        bc2: word(9),
        de2: word(10),
        hl2: word(11),
        r: tail[0],
        i: tail[1],
        im: tail[2],
        slots: if slots.is_empty() { vec![0] } else { slots },
    })
}

fn encode_long(address: LongAddress) -> [u8; 3] {
    let [lo, hi] = address.address().to_le_bytes();
    [lo, hi, address.bank().map_or(0, |b| b.wrapping_add(1))]
}

struct State {
    model: MemoryModel,
    breakpoints: BreakpointManager,
    /// Breakpoint id to the id assigned by the remote.
    remote_ids: HashMap<u32, u16>,
}

pub struct DzrpRemote {
    host: String,
    port: u16,
    link: Link,
    seq: AtomicU8,
    /// Set while a CONTINUE waits for its stop notification.
    running: AtomicBool,
    state: Mutex<State>,
    events: broadcast::Sender<RemoteEvent>,
}

impl DzrpRemote {
    pub fn new(host: String, port: u16) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            host,
            port,
            link: Link::new("dzrp", events.clone()),
            seq: AtomicU8::new(0),
            running: AtomicBool::new(false),
            state: Mutex::new(State {
                model: MemoryModel::Unknown,
                breakpoints: BreakpointManager::new(),
                remote_ids: HashMap::new(),
            }),
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
        let mut payload = VERSION.to_vec();
        payload.extend_from_slice(b"zdbg\0");
        let reply = self.request(cmd::INIT, &payload).await?;
        let [error, major, minor, patch, machine, name @ ..] = reply.as_slice() else {
            return Err(RemoteError::UnexpectedResponse("short INIT response".to_string()));
        };
        if *error != 0 {
            let message = String::from_utf8_lossy(name).trim_end_matches('\0').to_string();
            return Err(RemoteError::Remote(format!("INIT rejected: {message}")));
        }
        let model = machine_model(*machine);
        log::info!(
            "Connected to '{}' (DZRP {major}.{minor}.{patch}, {model})",
            String::from_utf8_lossy(name).trim_end_matches('\0')
        );
        self.state.lock().await.model = model;
        Ok(())
    }

    /// Sequence numbers run 1..=255; 0 is reserved for notifications.
    fn next_seq(&self) -> u8 {
        loop {
            let seq = self.seq.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
            if seq != 0 {
                return seq;
            }
        }
    }

    async fn send_request(&self, ex: &mut Exchange<'_>, command: u8, payload: &[u8]) -> Result<u8, RemoteError> {
        let seq = self.next_seq();
        log::debug!("dzrp -> seq={seq} cmd={command} {payload:02X?}");
        ex.send(&encode_request(seq, command, payload)).await?;
        Ok(seq)
    }

    async fn receive(ex: &mut Exchange<'_>) -> Result<(u8, Vec<u8>), RemoteError> {
        let frame = read_frame(ex.reader()).await;
        let (seq, payload) = ex.check(frame).await?;
        log::debug!("dzrp <- seq={seq} {payload:02X?}");
        Ok((seq, payload))
    }

    async fn request(&self, command: u8, payload: &[u8]) -> Result<Vec<u8>, RemoteError> {
        let mut ex = self.link.begin().await?;
        let seq = self.send_request(&mut ex, command, payload).await?;
        loop {
            let (reply_seq, reply) = Self::receive(&mut ex).await?;
            if reply_seq == seq {
                return Ok(reply);
            }
            if reply_seq == 0 {
                log::debug!("dzrp: ignoring notification outside of continue");
                continue;
            }
            // A PAUSE that raced the end of a CONTINUE is answered late.
            log::debug!("dzrp: dropping stale response seq={reply_seq} (waiting for {seq})");
        }
    }

    /// Send CONTINUE and wait for the stop notification.
    async fn continue_once(&self, tmp: [Option<u16>; 2], alternate: u8, range: (u16, u16)) -> Result<Notification, RemoteError> {
        let mut payload = Vec::with_capacity(11);
        for bp in tmp {
            payload.push(u8::from(bp.is_some()));
            payload.extend_from_slice(&bp.unwrap_or_default().to_le_bytes());
        }
        payload.push(alternate);
        payload.extend_from_slice(&range.0.to_le_bytes());
        payload.extend_from_slice(&range.1.to_le_bytes());

        let mut ex = self.link.begin().await?;
        self.running.store(true, Ordering::SeqCst);
        let result = self.await_notification(&mut ex, &payload).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn await_notification(&self, ex: &mut Exchange<'_>, payload: &[u8]) -> Result<Notification, RemoteError> {
        let seq = self.send_request(ex, cmd::CONTINUE, payload).await?;
        let mut acknowledged = false;
        loop {
            let (reply_seq, reply) = Self::receive(ex).await?;
            match reply_seq {
                0 => return Notification::parse(&reply),
                s if s == seq => acknowledged = true,
                // Response to an out-of-band PAUSE.
                _ => log::debug!("dzrp: pause acknowledged (continue acknowledged: {acknowledged})"),
            }
        }
    }

    async fn run_until_stop(&self, tmp: [Option<u16>; 2]) -> Result<StopReply, RemoteError> {
        {
            let mut state = self.state.lock().await;
            for address in tmp.into_iter().flatten() {
                state.breakpoints.arm_temporary(address);
            }
        }
        let result = self.run_loop(tmp).await;
        self.state.lock().await.breakpoints.clear_temporary();
        result
    }

    async fn run_loop(&self, tmp: [Option<u16>; 2]) -> Result<StopReply, RemoteError> {
        loop {
            let notification = self.continue_once(tmp, ALT_NONE, (0, 0)).await?;
            if !notification.text.is_empty() {
                log::info!("Break: {}", notification.text);
            }
            let stop = StopReply::new(notification.stop_reason(), notification.address.address());
            let regs = self.read_registers().await?;
            let state = self.state.lock().await;
            // Temporary breakpoints are reported by the remote with reason NONE.
            let stop = if state.breakpoints.check_tmp_breakpoints(Some(stop.address), None) {
                StopReply::new(StopReason::BreakpointHit, stop.address)
            } else {
                stop
            };
            if let Some(report) = resolve_stop(&state.breakpoints, state.model, stop, &regs, &self.events) {
                return Ok(report);
            }
        }
    }
}

#[async_trait]
impl Remote for DzrpRemote {
    fn kind(&self) -> RemoteKind {
        RemoteKind::Dzrp
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
        let reply = self.request(cmd::GET_REGISTERS, &[]).await?;
        decode_registers(&reply)
    }

    async fn write_register(&self, register: Z80Register, value: u16) -> Result<(), RemoteError> {
        let mut payload = vec![register_number(register)];
        payload.extend_from_slice(&value.to_le_bytes());
        self.request(cmd::SET_REGISTER, &payload).await?;
        Ok(())
    }

    async fn read_memory(&self, address: u16, size: u16) -> Result<Vec<u8>, RemoteError> {
        let mut payload = vec![0];
        payload.extend_from_slice(&address.to_le_bytes());
        payload.extend_from_slice(&size.to_le_bytes());
        let data = self.request(cmd::READ_MEM, &payload).await?;
        if data.len() != usize::from(size) {
            return Err(RemoteError::UnexpectedResponse(format!(
                "READ_MEM returned {} bytes, expected {size}",
                data.len()
            )));
        }
        Ok(data)
    }

    async fn write_memory(&self, address: u16, data: &[u8]) -> Result<(), RemoteError> {
        let mut payload = vec![0];
        payload.extend_from_slice(&address.to_le_bytes());
        payload.extend_from_slice(data);
        match self.request(cmd::WRITE_MEM, &payload).await?.first() {
            None | Some(0) => Ok(()),
            Some(code) => Err(RemoteError::Remote(format!("WRITE_MEM failed with {code}"))),
        }
    }

    async fn set_breakpoint(&self, request: BreakpointRequest) -> Result<Breakpoint, RemoteError> {
        let (bp, created) =
            self.state.lock().await.breakpoints.add(request).map_err(RemoteError::Condition)?;
        if !created {
            return Ok(bp);
        }
        let reply = match self.request(cmd::ADD_BREAKPOINT, &encode_long(bp.address)).await {
            Ok(reply) => reply,
            Err(err) => {
                self.state.lock().await.breakpoints.remove(bp.id);
                return Err(err);
            }
        };
        let mut state = self.state.lock().await;
        match reply.as_slice() {
            [0, 0, ..] | [] | [_] => {
                state.breakpoints.remove(bp.id);
                Err(RemoteError::Remote(format!("breakpoint at {} rejected", bp.address)))
            }
            [lo, hi, ..] => {
                state.remote_ids.insert(bp.id, u16::from_le_bytes([*lo, *hi]));
                Ok(bp)
            }
        }
    }

    async fn remove_breakpoint(&self, id: u32) -> Result<(), RemoteError> {
        let remote_id = {
            let mut state = self.state.lock().await;
            state
                .breakpoints
                .remove(id)
                .ok_or_else(|| RemoteError::Remote(format!("unknown breakpoint {id}")))?;
            state.remote_ids.remove(&id)
        };
        if let Some(remote_id) = remote_id {
            self.request(cmd::REMOVE_BREAKPOINT, &remote_id.to_le_bytes()).await?;
        }
        Ok(())
    }

    async fn breakpoints(&self) -> Vec<Breakpoint> {
        self.state.lock().await.breakpoints.list()
    }

    async fn set_watchpoint(&self, watchpoint: Watchpoint) -> Result<(), RemoteError> {
        let mut payload = watchpoint.address.to_le_bytes().to_vec();
        payload.extend_from_slice(&watchpoint.size.max(1).to_le_bytes());
        payload.push(access_code(watchpoint.kind));
        let reply = self.request(cmd::ADD_WATCHPOINT, &payload).await?;
        match reply.first() {
            None | Some(0) => {
                self.state.lock().await.breakpoints.add_watchpoint(watchpoint);
            }
            Some(code) => warn(
                &self.events,
                format!("Watchpoint at 0x{:04X} rejected (error {code})", watchpoint.address),
            ),
        }
        Ok(())
    }

    async fn remove_watchpoint(&self, watchpoint: Watchpoint) -> Result<(), RemoteError> {
        if !self.state.lock().await.breakpoints.remove_watchpoint(&watchpoint) {
            return Ok(());
        }
        let mut payload = watchpoint.address.to_le_bytes().to_vec();
        payload.extend_from_slice(&watchpoint.size.max(1).to_le_bytes());
        self.request(cmd::REMOVE_WATCHPOINT, &payload).await?;
        Ok(())
    }

    async fn resume(&self) -> Result<StopReply, RemoteError> {
        let stop = self.run_until_stop([None, None]).await?;
        notify_stopped(&self.events, stop);
        Ok(stop)
    }

    async fn pause(&self) -> Result<(), RemoteError> {
        if !self.link.is_connected() {
            return Err(RemoteError::Disconnected);
        }
        if !self.running.load(Ordering::SeqCst) {
            log::debug!("dzrp: not running, pause ignored");
            return Ok(());
        }
        let seq = self.next_seq();
        log::debug!("dzrp -> seq={seq} PAUSE");
        self.link.send_out_of_band(&encode_request(seq, cmd::PAUSE, &[])).await
    }

    async fn step(&self, kind: StepKind) -> Result<StopReply, RemoteError> {
        let regs = self.read_registers().await?;
        let target = match kind {
            StepKind::Into => None,
            StepKind::Over => step_over_target(regs.pc, &self.read_memory(regs.pc, LOOKAHEAD).await?),
            StepKind::Out => Some(
                return_address(&self.read_memory(regs.sp, 2).await?)
                    .ok_or_else(|| RemoteError::UnexpectedResponse("short stack read".to_string()))?,
            ),
        };
        let stop = match target {
            Some(target) => self.run_until_stop([Some(target), None]).await?,
            None => {
                let notification =
                    self.continue_once([None, None], ALT_STEP_INTO, (regs.pc, regs.pc.wrapping_add(1))).await?;
                let reason = match notification.stop_reason() {
                    StopReason::Paused | StopReason::Unknown => StopReason::Step,
                    other => other,
                };
                StopReply::new(reason, notification.address.address())
            }
        };
        notify_stopped(&self.events, stop);
        Ok(stop)
    }

    async fn disconnect(&self) -> Result<(), RemoteError> {
        if self.link.is_connected() {
            if let Err(err) = self.request(cmd::CLOSE, &[]).await {
                log::debug!("CLOSE failed: {err}");
            }
        }
        self.link.close().await;
        let mut state = self.state.lock().await;
        state.breakpoints.clear_all();
        state.remote_ids.clear();
        Ok(())
    }
}
