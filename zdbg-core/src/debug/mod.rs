//! Debug control types shared by every backend.
//!
//! Stop reasons, watchpoint kinds and the bookkeeping for armed breakpoints.

pub mod breakpoint;
pub mod condition;
pub mod stepping;

pub use breakpoint::{Breakpoint, BreakpointManager, BreakpointRequest, HitOutcome, Watchpoint};
pub use condition::{Condition, ConditionError};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why execution stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StopReason {
    BreakpointHit,
    WatchpointRead,
    WatchpointWrite,
    WatchpointAccess,
    Step,
    Paused,
    Unknown,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::BreakpointHit => "breakpoint hit",
            Self::WatchpointRead => "watchpoint read",
            Self::WatchpointWrite => "watchpoint write",
            Self::WatchpointAccess => "watchpoint access",
            Self::Step => "step",
            Self::Paused => "paused",
            Self::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

/// A backend's notification that execution halted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReply {
    pub reason: StopReason,
    pub address: u16,
}

impl StopReply {
    pub const fn new(reason: StopReason, address: u16) -> Self {
        Self { reason, address }
    }
}

/// Memory access that triggers a watchpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchKind {
    Read,
    Write,
    Access,
}

impl WatchKind {
    /// Whether a watchpoint of this kind fires for an access of kind `access`.
    pub fn covers(&self, access: Self) -> bool {
        *self == Self::Access || access == Self::Access || *self == access
    }

    pub fn stop_reason(&self) -> StopReason {
        match self {
            Self::Read => StopReason::WatchpointRead,
            Self::Write => StopReason::WatchpointWrite,
            Self::Access => StopReason::WatchpointAccess,
        }
    }
}

/// Flavour of single stepping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Into,
    Over,
    Out,
}
