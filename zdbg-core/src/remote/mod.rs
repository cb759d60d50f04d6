//! Remote backend abstraction.
//!
//! Every emulator or target is driven through the [`Remote`] trait. The
//! backends translate their native break indications into [`RemoteEvent`]s
//! so the session sees the same vocabulary regardless of what is connected.

pub mod dzrp;
pub mod link;
pub mod mame;
pub mod simulator;
pub mod zesarux;

pub use dzrp::DzrpRemote;
pub use link::Transport;
pub use mame::MameRemote;
pub use simulator::SimulatorRemote;
pub use zesarux::ZesaruxRemote;

use crate::config::RemoteConfig;
use crate::debug::{
    Breakpoint, BreakpointManager, BreakpointRequest, ConditionError, StepKind, StopReason, StopReply, Watchpoint,
};
use crate::gdb::GdbError;
use crate::memory::MemoryModel;
use crate::registers::{DecodeError, RegisterSet, Z80Register};
use async_trait::async_trait;
use serde::Serialize;
use simulator::dma::DmaError;
use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Capacity of each backend's event channel.
pub const EVENT_CAPACITY: usize = 100;

/// The uniform event vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum RemoteEvent {
    Stopped { reason: StopReason, address: u16 },
    Coverage(Vec<u16>),
    Warning(String),
    Error(String),
    /// Output of a log point.
    Log(String),
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Not connected")]
    Disconnected,
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Gdb(#[from] GdbError),
    #[error(transparent)]
    Dma(#[from] DmaError),
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("Not supported by this backend: {0}")]
    Unsupported(&'static str),
    #[error("Invalid breakpoint condition: {0}")]
    Condition(#[from] ConditionError),
    #[error("Remote reported an error: {0}")]
    Remote(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RemoteKind {
    Zesarux,
    Mame,
    Dzrp,
    Simulator,
}

impl fmt::Display for RemoteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Zesarux => "zesarux",
            Self::Mame => "mame",
            Self::Dzrp => "dzrp",
            Self::Simulator => "simulator",
        };
        f.write_str(name)
    }
}

/// Operations every backend supports.
///
/// Requests on one remote are serialized. `resume` completes on the next stop,
/// which may take arbitrarily long; `pause` is delivered out-of-band and may be
/// called while a `resume` is pending.
#[async_trait]
pub trait Remote: Send + Sync {
    fn kind(&self) -> RemoteKind;

    fn subscribe(&self) -> broadcast::Receiver<RemoteEvent>;

    /// Connect and validate the target. Failures are fatal and leave the
    /// remote unusable.
    async fn connect(&self) -> Result<(), RemoteError>;

    async fn read_registers(&self) -> Result<RegisterSet, RemoteError>;

    async fn write_register(&self, register: Z80Register, value: u16) -> Result<(), RemoteError>;

    async fn read_memory(&self, address: u16, size: u16) -> Result<Vec<u8>, RemoteError>;

    async fn write_memory(&self, address: u16, data: &[u8]) -> Result<(), RemoteError>;

    async fn set_breakpoint(&self, request: BreakpointRequest) -> Result<Breakpoint, RemoteError>;

    async fn remove_breakpoint(&self, id: u32) -> Result<(), RemoteError>;

    async fn breakpoints(&self) -> Vec<Breakpoint>;

    /// Arm a watchpoint. A backend that rejects it reports a warning instead
    /// of failing.
    async fn set_watchpoint(&self, watchpoint: Watchpoint) -> Result<(), RemoteError>;

    async fn remove_watchpoint(&self, watchpoint: Watchpoint) -> Result<(), RemoteError>;

    async fn resume(&self) -> Result<StopReply, RemoteError>;

    async fn pause(&self) -> Result<(), RemoteError>;

    async fn step(&self, kind: StepKind) -> Result<StopReply, RemoteError>;

    async fn disconnect(&self) -> Result<(), RemoteError>;
}

/// Create the backend selected by the configuration. The remote is not
/// connected yet.
pub fn create_remote(config: &RemoteConfig) -> Arc<dyn Remote> {
    match config {
        RemoteConfig::Zesarux { host, port, memory_model } => {
            Arc::new(ZesaruxRemote::new(host.clone(), *port, *memory_model))
        }
        RemoteConfig::Mame { host, port } => Arc::new(MameRemote::new(host.clone(), *port)),
        RemoteConfig::Dzrp { host, port } => Arc::new(DzrpRemote::new(host.clone(), *port)),
        RemoteConfig::Simulator(settings) => Arc::new(SimulatorRemote::new(settings.clone())),
    }
}

/// Decide whether a stop is reported to the caller.
///
/// Returns `None` when execution should silently continue: every breakpoint
/// at the address had a false condition or was a log point. A stop on an
/// armed temporary breakpoint is reported as a step.
pub(crate) fn resolve_stop(
    breakpoints: &BreakpointManager,
    model: MemoryModel,
    stop: StopReply,
    regs: &RegisterSet,
    events: &broadcast::Sender<RemoteEvent>,
) -> Option<StopReply> {
    if stop.reason != StopReason::BreakpointHit {
        return Some(stop);
    }
    let temporary = breakpoints.check_tmp_breakpoints(Some(stop.address), None);
    let outcome = breakpoints.evaluate_hit(stop.address, model, regs);
    for message in outcome.logs {
        log::info!("Log point: {message}");
        let _ = events.send(RemoteEvent::Log(message));
    }

    let user_stop = outcome.stop && breakpoints.is_armed(stop.address, model, &regs.slots);
    if temporary {
        let reason = if user_stop { StopReason::BreakpointHit } else { StopReason::Step };
        return Some(StopReply::new(reason, stop.address));
    }
    outcome.stop.then_some(stop)
}

/// Broadcast a stop to subscribers.
pub(crate) fn notify_stopped(events: &broadcast::Sender<RemoteEvent>, stop: StopReply) {
    log::info!("Stopped: {} at 0x{:04X}", stop.reason, stop.address);
    let _ = events.send(RemoteEvent::Stopped { reason: stop.reason, address: stop.address });
}

/// Broadcast a downgraded failure.
pub(crate) fn warn(events: &broadcast::Sender<RemoteEvent>, message: impl Into<String>) {
    let message = message.into();
    log::warn!("{message}");
    let _ = events.send(RemoteEvent::Warning(message));
}
