//! In-process simulator backend.
//!
//! Runs a Z80 subset with paged memory and a zxnDMA inside the debugger. It
//! has no transport: requests operate directly on the machine state and
//! `resume` executes in chunks, yielding to the runtime in between so that a
//! `pause` can be observed.

pub mod cpu;
pub mod dma;
pub mod machine;

pub use machine::{Machine, DEFAULT_DMA_PORT};

use super::{notify_stopped, resolve_stop, warn, Remote, RemoteError, RemoteEvent, RemoteKind, EVENT_CAPACITY};
use crate::config::SimulatorConfig;
use crate::debug::stepping::{return_address, step_over_target, LOOKAHEAD};
use crate::debug::{Breakpoint, BreakpointManager, BreakpointRequest, StepKind, StopReason, StopReply, Watchpoint};
use crate::registers::{RegisterSet, Z80Register};
use async_trait::async_trait;
use dma::DmaRegisterFile;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, Mutex, MutexGuard};

/// Instructions executed between checks of the runtime.
const CHUNK: usize = 10_000;

struct Simulation {
    machine: Machine,
    breakpoints: BreakpointManager,
    connected: bool,
}

impl Simulation {
    /// Registers with the slot vector taken from the current paging.
    fn registers(&self) -> RegisterSet {
        let mut regs = self.machine.cpu.regs.clone();
        regs.slots = self.machine.memory.slots().to_vec();
        regs
    }
}

pub struct SimulatorRemote {
    config: SimulatorConfig,
    sim: Mutex<Simulation>,
    running: AtomicBool,
    pause_requested: AtomicBool,
    events: broadcast::Sender<RemoteEvent>,
}

impl SimulatorRemote {
    pub fn new(config: SimulatorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let sim = Simulation {
            machine: Machine::new(config.memory_model, config.dma_port),
            breakpoints: BreakpointManager::new(),
            connected: false,
        };
        Self {
            config,
            sim: Mutex::new(sim),
            running: AtomicBool::new(false),
            pause_requested: AtomicBool::new(false),
            events,
        }
    }

    /// Register file and decode state of the DMA.
    pub async fn dma_registers(&self) -> Result<DmaRegisterFile, RemoteError> {
        Ok(self.lock().await?.machine.dma().registers().clone())
    }

    async fn lock(&self) -> Result<MutexGuard<'_, Simulation>, RemoteError> {
        let sim = self.sim.lock().await;
        if !sim.connected {
            return Err(RemoteError::Disconnected);
        }
        Ok(sim)
    }

    /// Execute one instruction and return the stop it caused, if any.
    fn execute(&self, sim: &mut Simulation) -> Option<StopReply> {
        let outcome = match sim.machine.step(sim.breakpoints.watchpoints()) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn(&self.events, err.to_string());
                return Some(StopReply::new(StopReason::Unknown, sim.machine.cpu.regs.pc));
            }
        };
        for message in outcome.warnings {
            warn(&self.events, message);
        }
        let pc = sim.machine.cpu.regs.pc;
        if let Some((wp, address)) = outcome.watch_hit {
            log::debug!("{:?} watchpoint at 0x{address:04X} triggered by code before 0x{pc:04X}", wp.kind);
            return Some(StopReply::new(wp.kind.stop_reason(), address));
        }
        if sim.machine.cpu.halted {
            warn(&self.events, format!("CPU halted at 0x{pc:04X}"));
            return Some(StopReply::new(StopReason::Paused, pc));
        }

        let model = sim.machine.memory.model();
        let temporary = sim.breakpoints.check_tmp_breakpoints(Some(pc), None);
        if temporary || sim.breakpoints.is_armed(pc, model, sim.machine.memory.slots()) {
            let regs = sim.registers();
            let stop = StopReply::new(StopReason::BreakpointHit, pc);
            return resolve_stop(&sim.breakpoints, model, stop, &regs, &self.events);
        }
        None
    }

    fn run_chunk(&self, sim: &mut Simulation) -> Option<StopReply> {
        for _ in 0..CHUNK {
            if self.pause_requested.swap(false, Ordering::SeqCst) {
                return Some(StopReply::new(StopReason::Paused, sim.machine.cpu.regs.pc));
            }
            if let Some(stop) = self.execute(sim) {
                return Some(stop);
            }
        }
        None
    }

    /// Run until a stop, optionally with a temporary breakpoint at `target`.
    async fn run(&self, target: Option<u16>) -> Result<StopReply, RemoteError> {
        if let Some(target) = target {
            self.lock().await?.breakpoints.arm_temporary(target);
        }
        self.running.store(true, Ordering::SeqCst);
        let result = loop {
            let mut sim = match self.lock().await {
                Ok(sim) => sim,
                Err(err) => break Err(err),
            };
            if let Some(stop) = self.run_chunk(&mut sim) {
                sim.breakpoints.clear_temporary();
                self.stopped(&mut sim, stop);
                break Ok(stop);
            }
            drop(sim);
            tokio::task::yield_now().await;
        };
        self.running.store(false, Ordering::SeqCst);
        self.pause_requested.store(false, Ordering::SeqCst);
        result
    }

    fn stopped(&self, sim: &mut Simulation, stop: StopReply) {
        let coverage = sim.machine.take_coverage();
        if !coverage.is_empty() {
            let _ = self.events.send(RemoteEvent::Coverage(coverage));
        }
        notify_stopped(&self.events, stop);
    }
}

#[async_trait]
impl Remote for SimulatorRemote {
    fn kind(&self) -> RemoteKind {
        RemoteKind::Simulator
    }

    fn subscribe(&self) -> broadcast::Receiver<RemoteEvent> {
        self.events.subscribe()
    }

    async fn connect(&self) -> Result<(), RemoteError> {
        let mut machine = Machine::new(self.config.memory_model, self.config.dma_port);
        if let Some(path) = &self.config.program {
            let image = tokio::fs::read(path).await?;
            if usize::from(self.config.load_address) + image.len() > 0x1_0000 {
                return Err(RemoteError::Remote(format!(
                    "{} ({} bytes) does not fit at 0x{:04X}",
                    path.display(),
                    image.len(),
                    self.config.load_address
                )));
            }
            machine.memory.load(self.config.load_address, &image);
            log::info!("Loaded {} bytes at 0x{:04X} from {}", image.len(), self.config.load_address, path.display());
        }
        machine.cpu.regs.pc = self.config.entry.unwrap_or(self.config.load_address);

        let mut sim = self.sim.lock().await;
        *sim = Simulation { machine, breakpoints: BreakpointManager::new(), connected: true };
        log::info!("Simulator ready ({}, DMA port 0x{:02X})", self.config.memory_model, self.config.dma_port);
        Ok(())
    }

    async fn read_registers(&self) -> Result<RegisterSet, RemoteError> {
        Ok(self.lock().await?.registers())
    }

    async fn write_register(&self, register: Z80Register, value: u16) -> Result<(), RemoteError> {
        let mut sim = self.lock().await?;
        sim.machine.cpu.regs.set(register, value);
        if register == Z80Register::PC {
            sim.machine.cpu.halted = false;
        }
        Ok(())
    }

    async fn read_memory(&self, address: u16, size: u16) -> Result<Vec<u8>, RemoteError> {
        Ok(self.lock().await?.machine.memory.read_block(address, size))
    }

    async fn write_memory(&self, address: u16, data: &[u8]) -> Result<(), RemoteError> {
        self.lock().await?.machine.memory.load(address, data);
        Ok(())
    }

    async fn set_breakpoint(&self, request: BreakpointRequest) -> Result<Breakpoint, RemoteError> {
        let (bp, _) = self.lock().await?.breakpoints.add(request).map_err(RemoteError::Condition)?;
        Ok(bp)
    }

    async fn remove_breakpoint(&self, id: u32) -> Result<(), RemoteError> {
        self.lock()
            .await?
            .breakpoints
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RemoteError::Remote(format!("unknown breakpoint {id}")))
    }

    async fn breakpoints(&self) -> Vec<Breakpoint> {
        self.sim.lock().await.breakpoints.list()
    }

    async fn set_watchpoint(&self, watchpoint: Watchpoint) -> Result<(), RemoteError> {
        self.lock().await?.breakpoints.add_watchpoint(watchpoint);
        Ok(())
    }

    async fn remove_watchpoint(&self, watchpoint: Watchpoint) -> Result<(), RemoteError> {
        self.lock().await?.breakpoints.remove_watchpoint(&watchpoint);
        Ok(())
    }

    async fn resume(&self) -> Result<StopReply, RemoteError> {
        self.run(None).await
    }

    async fn pause(&self) -> Result<(), RemoteError> {
        if self.running.load(Ordering::SeqCst) {
            self.pause_requested.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn step(&self, kind: StepKind) -> Result<StopReply, RemoteError> {
        let target = {
            let sim = self.lock().await?;
            let regs = &sim.machine.cpu.regs;
            match kind {
                StepKind::Into => None,
                StepKind::Over => step_over_target(regs.pc, &sim.machine.memory.read_block(regs.pc, LOOKAHEAD)),
                StepKind::Out => return_address(&sim.machine.memory.read_block(regs.sp, 2)),
            }
        };
        if target.is_some() {
            return self.run(target).await;
        }

        let mut sim = self.lock().await?;
        let stop = match self.execute(&mut sim) {
            Some(stop) if stop.reason != StopReason::BreakpointHit => stop,
            _ => StopReply::new(StopReason::Step, sim.machine.cpu.regs.pc),
        };
        self.stopped(&mut sim, stop);
        Ok(stop)
    }

    async fn disconnect(&self) -> Result<(), RemoteError> {
        let mut sim = self.sim.lock().await;
        sim.connected = false;
        sim.breakpoints.clear_all();
        Ok(())
    }
}
