//! MAME gdbstub backend.
//!
//! Speaks the GDB Remote Serial Protocol. The register layout is taken from
//! the target description, which must announce the `z80` architecture.
//! Step-over and step-out are emulated with temporary breakpoints.

use super::link::{Exchange, Link};
use super::{notify_stopped, resolve_stop, warn, Remote, RemoteError, RemoteEvent, RemoteKind, EVENT_CAPACITY};
use crate::debug::stepping::{return_address, step_over_target, LOOKAHEAD};
use crate::debug::{
    Breakpoint, BreakpointManager, BreakpointRequest, StepKind, StopReason, StopReply, WatchKind, Watchpoint,
};
use crate::gdb::{encode_le, frame, parse_stop_reply, parse_xml, read_packet, RegisterLayout, BREAK_SIGNAL};
use crate::memory::MemoryModel;
use crate::registers::{RegisterSet, Z80Register};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, Mutex};

pub const DEFAULT_PORT: u16 = 12000;

const XFER_CHUNK: usize = 0x7FF;

fn watch_type(kind: WatchKind) -> u8 {
    match kind {
        WatchKind::Write => 2,
        WatchKind::Read => 3,
        WatchKind::Access => 4,
    }
}

fn check_ok(reply: &str) -> Result<(), RemoteError> {
    match reply {
        "OK" => Ok(()),
        "" => Err(RemoteError::Unsupported("packet not supported by the stub")),
        other => Err(RemoteError::Remote(other.to_string())),
    }
}

struct State {
    layout: RegisterLayout,
    breakpoints: BreakpointManager,
}

pub struct MameRemote {
    host: String,
    port: u16,
    link: Link,
    state: Mutex<State>,
    /// Set while `c` or `s` waits for its stop reply.
    running: AtomicBool,
    events: broadcast::Sender<RemoteEvent>,
}

impl MameRemote {
    pub fn new(host: String, port: u16) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            host,
            port,
            link: Link::new("mame", events.clone()),
            state: Mutex::new(State { layout: RegisterLayout::mame_default(), breakpoints: BreakpointManager::new() }),
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
        let features = self.request("qSupported:xmlRegisters=z80").await?;
        log::debug!("Stub features: {features}");

        let mut xml = String::new();
        loop {
            let reply = self
                .request(&format!("qXfer:features:read:target.xml:{:x},{:x}", xml.len(), XFER_CHUNK))
                .await?;
            let (marker, data) = reply.split_at(reply.len().min(1));
            xml.push_str(data);
            match marker {
                "m" => continue,
                "l" => break,
                _ => return Err(RemoteError::UnexpectedResponse(format!("qXfer: '{reply}'"))),
            }
        }
        let layout = parse_xml(&xml)?;
        log::info!("Target description: {} registers", layout.registers().len());

        let reply = self.request("?").await?;
        let stop = parse_stop_reply(&reply, &layout)?;
        log::info!("Connected to MAME, stopped at 0x{:04X}", stop.address);
        self.state.lock().await.layout = layout;
        Ok(())
    }

    async fn send_packet(ex: &mut Exchange<'_>, payload: &str) -> Result<(), RemoteError> {
        log::debug!("gdb -> {payload}");
        ex.send(frame(payload).as_bytes()).await
    }

    async fn receive_packet(ex: &mut Exchange<'_>) -> Result<String, RemoteError> {
        let packet = read_packet(ex.reader()).await;
        let packet = ex.check(packet).await?;
        ex.send(b"+").await?;
        Ok(packet)
    }

    /// One request/reply cycle.
    async fn request(&self, payload: &str) -> Result<String, RemoteError> {
        let mut ex = self.link.begin().await?;
        Self::send_packet(&mut ex, payload).await?;
        Self::receive_packet(&mut ex).await
    }

    async fn wait_stop(&self, payload: &str) -> Result<StopReply, RemoteError> {
        let reply = {
            let mut ex = self.link.begin().await?;
            Self::send_packet(&mut ex, payload).await?;
            self.running.store(true, Ordering::SeqCst);
            let reply = Self::receive_packet(&mut ex).await;
            self.running.store(false, Ordering::SeqCst);
            reply?
        };
        match reply.chars().next() {
            Some('T') => {
                let state = self.state.lock().await;
                Ok(parse_stop_reply(&reply, &state.layout)?)
            }
            Some('S') => {
                let signal = u8::from_str_radix(reply.get(1..3).unwrap_or_default(), 16)
                    .map_err(|_| RemoteError::UnexpectedResponse(reply.clone()))?;
                let regs = self.read_registers().await?;
                let reason = if signal == 0x02 { StopReason::Paused } else { StopReason::BreakpointHit };
                Ok(StopReply::new(reason, regs.pc))
            }
            Some('W') | Some('X') => {
                let _ = self.events.send(RemoteEvent::Error("Target exited".to_string()));
                self.link.close().await;
                Err(RemoteError::Disconnected)
            }
            _ => Err(RemoteError::UnexpectedResponse(reply)),
        }
    }

    async fn insert_breakpoint(&self, address: u16) -> Result<(), RemoteError> {
        check_ok(&self.request(&format!("Z0,{address:x},1")).await?)
    }

    async fn delete_breakpoint(&self, address: u16) -> Result<(), RemoteError> {
        check_ok(&self.request(&format!("z0,{address:x},1")).await?)
    }

    /// Continue until a stop that is reported to the caller.
    async fn run_until_stop(&self) -> Result<StopReply, RemoteError> {
        loop {
            let stop = self.wait_stop("c").await?;
            let regs = self.read_registers().await?;
            let state = self.state.lock().await;
            if let Some(report) =
                resolve_stop(&state.breakpoints, MemoryModel::Unknown, stop, &regs, &self.events)
            {
                return Ok(report);
            }
        }
    }

    /// Run to a temporary breakpoint, removing it afterwards unless a user
    /// breakpoint shares the address.
    async fn run_to(&self, target: u16) -> Result<StopReply, RemoteError> {
        let user_armed = {
            let mut state = self.state.lock().await;
            state.breakpoints.arm_temporary(target);
            state.breakpoints.is_armed(target, MemoryModel::Unknown, &[0])
        };
        if !user_armed {
            self.insert_breakpoint(target).await?;
        }
        let result = self.run_until_stop().await;
        self.state.lock().await.breakpoints.clear_temporary();
        if !user_armed {
            self.delete_breakpoint(target).await?;
        }
        result
    }

    async fn single_step(&self) -> Result<StopReply, RemoteError> {
        let stop = self.wait_stop("s").await?;
        let reason = match stop.reason {
            StopReason::BreakpointHit | StopReason::Unknown => StopReason::Step,
            other => other,
        };
        Ok(StopReply::new(reason, stop.address))
    }
}

#[async_trait]
impl Remote for MameRemote {
    fn kind(&self) -> RemoteKind {
        RemoteKind::Mame
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
        let reply = self.request("g").await?;
        let state = self.state.lock().await;
        Ok(state.layout.decode_registers(&reply)?)
    }

    async fn write_register(&self, register: Z80Register, value: u16) -> Result<(), RemoteError> {
        let (register, value) = match register.pair() {
            Some(pair) => {
                let mut regs = self.read_registers().await?;
                regs.set(register, value);
                (pair, regs.get(pair))
            }
            None => (register, value),
        };
        let packet = {
            let state = self.state.lock().await;
            let gdb_reg = state
                .layout
                .find(register)
                .ok_or(RemoteError::Unsupported("register not in the target description"))?;
            format!("P{:x}={}", gdb_reg.regnum, encode_le(value, usize::from(gdb_reg.bitsize / 8)))
        };
        check_ok(&self.request(&packet).await?)
    }

    async fn read_memory(&self, address: u16, size: u16) -> Result<Vec<u8>, RemoteError> {
        let reply = self.request(&format!("m{address:x},{size:x}")).await?;
        if reply.starts_with('E') && reply.len() == 3 {
            return Err(RemoteError::Remote(reply));
        }
        hex::decode(&reply).map_err(|e| RemoteError::UnexpectedResponse(format!("m: {e}")))
    }

    async fn write_memory(&self, address: u16, data: &[u8]) -> Result<(), RemoteError> {
        let packet = format!("M{address:x},{:x}:{}", data.len(), hex::encode(data));
        check_ok(&self.request(&packet).await?)
    }

    async fn set_breakpoint(&self, request: BreakpointRequest) -> Result<Breakpoint, RemoteError> {
        let (bp, needs_arming) = {
            let mut state = self.state.lock().await;
            let already = state.breakpoints.is_armed(request.address.address(), MemoryModel::Unknown, &[0]);
            let (bp, created) = state.breakpoints.add(request).map_err(RemoteError::Condition)?;
            (bp, created && !already)
        };
        if needs_arming {
            if let Err(err) = self.insert_breakpoint(bp.address.address()).await {
                self.state.lock().await.breakpoints.remove(bp.id);
                return Err(err);
            }
        }
        Ok(bp)
    }

    async fn remove_breakpoint(&self, id: u32) -> Result<(), RemoteError> {
        let address = {
            let mut state = self.state.lock().await;
            let shared = state.breakpoints.address_shared(id);
            let bp = state
                .breakpoints
                .remove(id)
                .ok_or_else(|| RemoteError::Remote(format!("unknown breakpoint {id}")))?;
            (!shared).then_some(bp.address.address())
        };
        if let Some(address) = address {
            self.delete_breakpoint(address).await?;
        }
        Ok(())
    }

    async fn breakpoints(&self) -> Vec<Breakpoint> {
        self.state.lock().await.breakpoints.list()
    }

    async fn set_watchpoint(&self, watchpoint: Watchpoint) -> Result<(), RemoteError> {
        let packet =
            format!("Z{},{:x},{:x}", watch_type(watchpoint.kind), watchpoint.address, watchpoint.size.max(1));
        match check_ok(&self.request(&packet).await?) {
            Ok(()) => {
                self.state.lock().await.breakpoints.add_watchpoint(watchpoint);
            }
            Err(err) => {
                warn(&self.events, format!("Watchpoint at 0x{:04X} rejected: {err}", watchpoint.address));
            }
        }
        Ok(())
    }

    async fn remove_watchpoint(&self, watchpoint: Watchpoint) -> Result<(), RemoteError> {
        if !self.state.lock().await.breakpoints.remove_watchpoint(&watchpoint) {
            return Ok(());
        }
        let packet =
            format!("z{},{:x},{:x}", watch_type(watchpoint.kind), watchpoint.address, watchpoint.size.max(1));
        check_ok(&self.request(&packet).await?)
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
        // A break while halted would be answered with a stop reply nobody waits for.
        if !self.running.load(Ordering::SeqCst) {
            log::debug!("gdb: not running, break ignored");
            return Ok(());
        }
        log::debug!("gdb -> break");
        self.link.send_out_of_band(&[BREAK_SIGNAL]).await
    }

    async fn step(&self, kind: StepKind) -> Result<StopReply, RemoteError> {
        let stop = match kind {
            StepKind::Into => self.single_step().await?,
            StepKind::Over => {
                let regs = self.read_registers().await?;
                let code = self.read_memory(regs.pc, LOOKAHEAD).await?;
                match step_over_target(regs.pc, &code) {
                    Some(target) => self.run_to(target).await?,
                    None => self.single_step().await?,
                }
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
        if self.link.is_connected() {
            if let Err(err) = self.request("D").await {
                log::debug!("Detach failed: {err}");
            }
        }
        self.link.close().await;
        self.state.lock().await.breakpoints.clear_all();
        Ok(())
    }
}
