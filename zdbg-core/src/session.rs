//! Session management module.
//!
//! Owns the single active remote and runs it on background tasks. Commands
//! are processed strictly in order by a worker; `Pause` bypasses the queue so
//! it can interrupt a pending `Resume`. Remote events and command results are
//! broadcast to every subscriber as [`DebugEvent`]s, in the order they happened:
//! events raised while a command runs are relayed before its results.
//! A broken channel ends the session.

use crate::config::RemoteConfig;
use crate::debug::{Breakpoint, BreakpointRequest, StepKind, StopReply, Watchpoint};
use crate::registers::{RegisterSet, Z80Register};
use crate::remote::{create_remote, Remote, RemoteError, RemoteEvent, RemoteKind};
use anyhow::{Context as _, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugCommand {
    Pause,
    Resume,
    Step(StepKind),
    ReadRegisters,
    WriteRegister(Z80Register, u16),
    ReadMemory(u16, u16),
    WriteMemory(u16, Vec<u8>),
    SetBreakpoint(BreakpointRequest),
    ClearBreakpoint(u32),
    ListBreakpoints,
    SetWatchpoint(Watchpoint),
    ClearWatchpoint(Watchpoint),
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum DebugEvent {
    Resumed,
    Stopped(StopReply),
    Registers(RegisterSet),
    MemoryData(u16, Vec<u8>),
    Breakpoints(Vec<Breakpoint>),
    Coverage(Vec<u16>),
    Log(String),
    Warning(String),
    Error(String),
    Disconnected,
}

impl From<RemoteEvent> for DebugEvent {
    fn from(event: RemoteEvent) -> Self {
        match event {
            RemoteEvent::Stopped { reason, address } => Self::Stopped(StopReply::new(reason, address)),
            RemoteEvent::Coverage(addresses) => Self::Coverage(addresses),
            RemoteEvent::Warning(message) => Self::Warning(message),
            RemoteEvent::Error(message) => Self::Error(message),
            RemoteEvent::Log(message) => Self::Log(message),
        }
    }
}

/// A handle to the debug session running on background tasks.
pub struct SessionHandle {
    command_tx: mpsc::UnboundedSender<DebugCommand>,
    event_tx: broadcast::Sender<DebugEvent>,
    kind: Option<RemoteKind>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Subscribe to debug events
    pub fn subscribe(&self) -> broadcast::Receiver<DebugEvent> {
        self.event_tx.subscribe()
    }

    /// Internal helper to create a SessionHandle for testing
    #[cfg(test)]
    pub fn new_test() -> (Self, mpsc::UnboundedReceiver<DebugCommand>, broadcast::Sender<DebugEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (evt_tx, _) = broadcast::channel(100);

        (Self { command_tx: cmd_tx, event_tx: evt_tx.clone(), kind: None, task: None }, cmd_rx, evt_tx)
    }

    /// Create the configured backend, connect it and start dispatching.
    pub async fn connect(config: &RemoteConfig) -> Result<Self> {
        Self::start(create_remote(config)).await
    }

    /// Connect an existing remote and start dispatching.
    pub async fn start(remote: Arc<dyn Remote>) -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        // create a broadcast channel with capacity 100
        let (evt_tx, _) = broadcast::channel(100);
        let kind = remote.kind();

        // Subscribed first so that warnings raised by the handshake are kept.
        let remote_events = remote.subscribe();
        remote.connect().await.with_context(|| format!("Failed to connect to the {kind} backend"))?;
        log::info!("Connected to the {kind} backend");

        let task = tokio::spawn(dispatch(remote, cmd_rx, remote_events, evt_tx.clone()));
        Ok(Self { command_tx: cmd_tx, event_tx: evt_tx, kind: Some(kind), task: Some(task) })
    }

    pub fn kind(&self) -> Option<RemoteKind> {
        self.kind
    }

    pub fn send(&self, cmd: DebugCommand) -> Result<()> {
        self.command_tx.send(cmd).context("Failed to send command")
    }

    /// Send `Exit` and wait until the remote has been torn down.
    pub async fn shutdown(mut self) -> Result<()> {
        // The session may already be gone after a fatal remote error.
        let _ = self.command_tx.send(DebugCommand::Exit);
        if let Some(task) = self.task.take() {
            task.await.context("Session task failed")?;
        }
        Ok(())
    }
}

/// Pass one remote event on to the subscribers. Returns false once the
/// remote's event channel is closed.
fn relay(event: Result<RemoteEvent, broadcast::error::RecvError>, evt_tx: &broadcast::Sender<DebugEvent>) -> bool {
    match event {
        Ok(event) => {
            let _ = evt_tx.send(event.into());
            true
        }
        Err(broadcast::error::RecvError::Lagged(count)) => {
            log::warn!("Dropped {count} remote events");
            true
        }
        Err(broadcast::error::RecvError::Closed) => false,
    }
}

/// Relay whatever the remote has raised so far.
fn flush(remote_events: &mut broadcast::Receiver<RemoteEvent>, evt_tx: &broadcast::Sender<DebugEvent>) {
    loop {
        match remote_events.try_recv() {
            Ok(event) => {
                let _ = evt_tx.send(event.into());
            }
            Err(broadcast::error::TryRecvError::Lagged(count)) => log::warn!("Dropped {count} remote events"),
            Err(_) => return,
        }
    }
}

/// Route commands: `Pause` goes to the remote immediately, everything else
/// is queued for the worker.
async fn dispatch(
    remote: Arc<dyn Remote>,
    mut cmd_rx: mpsc::UnboundedReceiver<DebugCommand>,
    remote_events: broadcast::Receiver<RemoteEvent>,
    evt_tx: broadcast::Sender<DebugEvent>,
) {
    let running = Arc::new(AtomicBool::new(false));
    let (work_tx, work_rx) = mpsc::unbounded_channel();
    let worker = tokio::spawn(work(remote.clone(), work_rx, remote_events, evt_tx.clone(), running.clone()));

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            DebugCommand::Pause => {
                if let Err(e) = remote.pause().await {
                    let _ = evt_tx.send(DebugEvent::Error(format!("Failed to pause: {e}")));
                }
            }
            DebugCommand::Exit => {
                // A pending resume would keep the worker from seeing Exit.
                if running.load(Ordering::SeqCst) {
                    let _ = remote.pause().await;
                }
                let _ = work_tx.send(DebugCommand::Exit);
                break;
            }
            other => {
                if work_tx.send(other).is_err() {
                    break;
                }
            }
        }
    }

    drop(work_tx);
    if let Err(e) = worker.await {
        log::error!("Session worker failed: {e}");
    }
}

async fn work(
    remote: Arc<dyn Remote>,
    mut work_rx: mpsc::UnboundedReceiver<DebugCommand>,
    mut remote_events: broadcast::Receiver<RemoteEvent>,
    evt_tx: broadcast::Sender<DebugEvent>,
    running: Arc<AtomicBool>,
) {
    let mut events_open = true;
    loop {
        flush(&mut remote_events, &evt_tx);
        let cmd = tokio::select! {
            cmd = work_rx.recv() => match cmd {
                Some(DebugCommand::Exit) | None => break,
                Some(cmd) => cmd,
            },
            event = remote_events.recv(), if events_open => {
                events_open = relay(event, &evt_tx);
                continue;
            }
        };

        // Events raised while the command runs (log points, coverage) go out live.
        let result = {
            let exec = execute(remote.as_ref(), cmd, &evt_tx, &running);
            tokio::pin!(exec);
            loop {
                tokio::select! {
                    result = &mut exec => break result,
                    event = remote_events.recv(), if events_open => {
                        events_open = relay(event, &evt_tx);
                    }
                }
            }
        };
        if let Err(e) = result {
            flush(&mut remote_events, &evt_tx);
            log::warn!("Command failed: {e}");
            let _ = evt_tx.send(DebugEvent::Error(e.to_string()));
            if matches!(e, RemoteError::Disconnected | RemoteError::Io(_)) {
                log::error!("Connection to the {} backend lost", remote.kind());
                break;
            }
        }
    }

    if let Err(e) = remote.disconnect().await {
        log::warn!("Disconnect failed: {e}");
    }
    flush(&mut remote_events, &evt_tx);
    log::info!("Session closed");
    let _ = evt_tx.send(DebugEvent::Disconnected);
}

async fn execute(
    remote: &dyn Remote,
    cmd: DebugCommand,
    evt_tx: &broadcast::Sender<DebugEvent>,
    running: &AtomicBool,
) -> Result<(), RemoteError> {
    match cmd {
        DebugCommand::Resume => {
            let _ = evt_tx.send(DebugEvent::Resumed);
            running.store(true, Ordering::SeqCst);
            let result = remote.resume().await;
            running.store(false, Ordering::SeqCst);
            result?;
        }
        DebugCommand::Step(kind) => {
            running.store(true, Ordering::SeqCst);
            let result = remote.step(kind).await;
            running.store(false, Ordering::SeqCst);
            result?;
        }
        DebugCommand::ReadRegisters => {
            let _ = evt_tx.send(DebugEvent::Registers(remote.read_registers().await?));
        }
        DebugCommand::WriteRegister(register, value) => {
            remote.write_register(register, value).await?;
            let _ = evt_tx.send(DebugEvent::Registers(remote.read_registers().await?));
        }
        DebugCommand::ReadMemory(address, size) => {
            let data = remote.read_memory(address, size).await?;
            let _ = evt_tx.send(DebugEvent::MemoryData(address, data));
        }
        DebugCommand::WriteMemory(address, data) => remote.write_memory(address, &data).await?,
        DebugCommand::SetBreakpoint(request) => {
            remote.set_breakpoint(request).await?;
            let _ = evt_tx.send(DebugEvent::Breakpoints(remote.breakpoints().await));
        }
        DebugCommand::ClearBreakpoint(id) => {
            remote.remove_breakpoint(id).await?;
            let _ = evt_tx.send(DebugEvent::Breakpoints(remote.breakpoints().await));
        }
        DebugCommand::ListBreakpoints => {
            let _ = evt_tx.send(DebugEvent::Breakpoints(remote.breakpoints().await));
        }
        DebugCommand::SetWatchpoint(watchpoint) => remote.set_watchpoint(watchpoint).await?,
        DebugCommand::ClearWatchpoint(watchpoint) => remote.remove_watchpoint(watchpoint).await?,
        // Handled by the dispatcher
        DebugCommand::Pause | DebugCommand::Exit => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulatorConfig;
    use crate::debug::StopReason;
    use std::time::Duration;

    async fn next_event(rx: &mut broadcast::Receiver<DebugEvent>, want: impl Fn(&DebugEvent) -> bool) -> DebugEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if want(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_session_handle_send_receive() {
        let (handle, mut cmd_rx, event_tx) = SessionHandle::new_test();

        // Test Command sending
        handle.send(DebugCommand::Pause).unwrap();
        let cmd = cmd_rx.recv().await.unwrap();
        assert_eq!(cmd, DebugCommand::Pause);

        // Test Event broadcasting
        let mut receiver = handle.subscribe();
        event_tx.send(DebugEvent::Resumed).unwrap();

        let event = receiver.recv().await.unwrap();
        assert_eq!(event, DebugEvent::Resumed);
    }

    #[test]
    fn test_remote_event_conversion() {
        let event: DebugEvent = RemoteEvent::Stopped { reason: StopReason::Step, address: 0x1234 }.into();
        assert_eq!(event, DebugEvent::Stopped(StopReply::new(StopReason::Step, 0x1234)));
        let event: DebugEvent = RemoteEvent::Warning("w".to_string()).into();
        assert_eq!(event, DebugEvent::Warning("w".to_string()));
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_string(&DebugEvent::MemoryData(0x8000, vec![1, 2])).unwrap();
        assert_eq!(json, r#"{"event":"memory_data","data":[32768,[1,2]]}"#);
        let json = serde_json::to_string(&DebugEvent::Disconnected).unwrap();
        assert_eq!(json, r#"{"event":"disconnected"}"#);
    }

    #[tokio::test]
    async fn test_simulator_session() {
        let config = RemoteConfig::Simulator(SimulatorConfig::default());
        let handle = SessionHandle::connect(&config).await.unwrap();
        assert_eq!(handle.kind(), Some(RemoteKind::Simulator));
        let mut events = handle.subscribe();

        // LD A,0x11; NOP; HALT
        handle.send(DebugCommand::WriteMemory(0x8000, vec![0x3E, 0x11, 0x00, 0x76])).unwrap();
        handle.send(DebugCommand::SetBreakpoint(BreakpointRequest::at(0x8002))).unwrap();
        handle.send(DebugCommand::Resume).unwrap();
        handle.send(DebugCommand::ReadRegisters).unwrap();

        let event = next_event(&mut events, |e| matches!(e, DebugEvent::Breakpoints(_))).await;
        let DebugEvent::Breakpoints(list) = event else { unreachable!() };
        assert_eq!(list.len(), 1);

        let event = next_event(&mut events, |e| matches!(e, DebugEvent::Stopped(_))).await;
        assert_eq!(event, DebugEvent::Stopped(StopReply::new(StopReason::BreakpointHit, 0x8002)));

        let event = next_event(&mut events, |e| matches!(e, DebugEvent::Registers(_))).await;
        let DebugEvent::Registers(regs) = event else { unreachable!() };
        assert_eq!(regs.get(Z80Register::A), 0x11);

        handle.shutdown().await.unwrap();
        next_event(&mut events, |e| *e == DebugEvent::Disconnected).await;
    }

    #[tokio::test]
    async fn test_pause_bypasses_queue() {
        let config = RemoteConfig::Simulator(SimulatorConfig::default());
        let handle = SessionHandle::connect(&config).await.unwrap();
        let mut events = handle.subscribe();

        // loop: JR loop
        handle.send(DebugCommand::WriteMemory(0x8000, vec![0x18, 0xFE])).unwrap();
        handle.send(DebugCommand::Resume).unwrap();
        next_event(&mut events, |e| *e == DebugEvent::Resumed).await;
        // Queued behind the resume, only runs once the pause took effect.
        handle.send(DebugCommand::ReadRegisters).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.send(DebugCommand::Pause).unwrap();

        let event = next_event(&mut events, |e| matches!(e, DebugEvent::Stopped(_))).await;
        assert_eq!(event, DebugEvent::Stopped(StopReply::new(StopReason::Paused, 0x8000)));
        next_event(&mut events, |e| matches!(e, DebugEvent::Registers(_))).await;
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_command_errors_are_reported() {
        let config = RemoteConfig::Simulator(SimulatorConfig::default());
        let handle = SessionHandle::connect(&config).await.unwrap();
        let mut events = handle.subscribe();

        handle.send(DebugCommand::ClearBreakpoint(42)).unwrap();
        let event = next_event(&mut events, |e| matches!(e, DebugEvent::Error(_))).await;
        assert_eq!(event, DebugEvent::Error("Remote reported an error: unknown breakpoint 42".to_string()));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_has_context() {
        let config = RemoteConfig::Mame { host: "127.0.0.1".to_string(), port: 1 };
        let err = SessionHandle::connect(&config).await.err().unwrap();
        assert_eq!(err.to_string(), "Failed to connect to the mame backend");
    }
}
