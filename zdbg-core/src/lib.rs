//! zdbg Core - The heart of the debugger.
//!
//! This crate talks to Z80 debugging backends (emulators, a hardware bridge
//! and an in-process simulator) and exposes them through one uniform model of
//! registers, memory, breakpoints, watchpoints and stop events.

pub mod config;
pub mod debug;
pub mod gdb;
pub mod memory;
pub mod registers;
pub mod remote;
pub mod session;

// Re-export commonly used types
pub use config::{RemoteConfig, SimulatorConfig};
pub use debug::{Breakpoint, BreakpointRequest, StepKind, StopReason, StopReply, WatchKind, Watchpoint};
pub use memory::{LongAddress, MemoryModel};
pub use registers::{RegisterLineDecoder, RegisterSet, Z80Register};
pub use remote::{create_remote, Remote, RemoteError, RemoteEvent, RemoteKind};
pub use session::{DebugCommand, DebugEvent, SessionHandle};
