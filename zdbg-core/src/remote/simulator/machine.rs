//! The simulated computer: CPU, paged memory, paging ports and the DMA.

use super::cpu::{Bus, CpuError, Z80Cpu, NEXTREG_DATA, NEXTREG_SELECT};
use super::dma::{DmaAction, DmaBus, ZxnDma};
use crate::debug::{WatchKind, Watchpoint};
use crate::memory::{BankedMemory, MemoryModel};
use std::collections::BTreeSet;

/// Default port of the zxnDMA.
pub const DEFAULT_DMA_PORT: u16 = 0x6B;

/// What happened while executing one instruction.
#[derive(Debug, Default)]
pub struct StepOutcome {
    /// First watchpoint triggered by the instruction and the accessed address.
    pub watch_hit: Option<(Watchpoint, u16)>,
    /// Contained peripheral faults.
    pub warnings: Vec<String>,
}

pub struct Machine {
    pub cpu: Z80Cpu,
    pub memory: BankedMemory,
    dma: ZxnDma,
    dma_port: u16,
    nextreg_selected: u8,
    paging_locked: bool,
    coverage: BTreeSet<u16>,
}

impl Machine {
    pub fn new(model: MemoryModel, dma_port: u16) -> Self {
        Self {
            cpu: Z80Cpu::new(),
            memory: BankedMemory::new(model),
            dma: ZxnDma::new(),
            dma_port,
            nextreg_selected: 0,
            paging_locked: false,
            coverage: BTreeSet::new(),
        }
    }

    pub fn dma(&self) -> &ZxnDma {
        &self.dma
    }

    /// Execute one instruction, watching memory accesses against `watchpoints`.
    ///
    /// Nothing raises interrupts, so stepping a halted CPU leaves the `HALT`
    /// and continues with the following instruction.
    pub fn step(&mut self, watchpoints: &[Watchpoint]) -> Result<StepOutcome, CpuError> {
        if self.cpu.halted {
            self.cpu.halted = false;
            self.cpu.regs.pc = self.cpu.regs.pc.wrapping_add(1);
            return Ok(StepOutcome::default());
        }
        self.coverage.insert(self.cpu.regs.pc);
        let mut bus = MachineBus {
            memory: &mut self.memory,
            dma: &mut self.dma,
            dma_port: self.dma_port,
            nextreg_selected: &mut self.nextreg_selected,
            paging_locked: &mut self.paging_locked,
            watchpoints,
            outcome: StepOutcome::default(),
        };
        self.cpu.step(&mut bus)?;
        Ok(bus.outcome)
    }

    /// Addresses executed since the last call.
    pub fn take_coverage(&mut self) -> Vec<u16> {
        std::mem::take(&mut self.coverage).into_iter().collect()
    }
}

struct MachineBus<'a> {
    memory: &'a mut BankedMemory,
    dma: &'a mut ZxnDma,
    dma_port: u16,
    nextreg_selected: &'a mut u8,
    paging_locked: &'a mut bool,
    watchpoints: &'a [Watchpoint],
    outcome: StepOutcome,
}

impl MachineBus<'_> {
    /// The DMA decodes the low address byte only.
    fn is_dma_port(&self, port: u16) -> bool {
        port & 0xFF == self.dma_port & 0xFF
    }

    fn watch(&mut self, address: u16, access: WatchKind) {
        if self.outcome.watch_hit.is_some() {
            return;
        }
        if let Some(wp) = self.watchpoints.iter().find(|wp| wp.contains(address) && wp.kind.covers(access)) {
            self.outcome.watch_hit = Some((*wp, address));
        }
    }

    fn write_dma(&mut self, value: u8) {
        match self.dma.write(value) {
            Ok(DmaAction::Transfer) => self.dma.transfer(&mut DmaMemory(self.memory)),
            Ok(DmaAction::None) => {}
            Err(err) => self.outcome.warnings.push(err.to_string()),
        }
    }

    /// 128K paging: bits 0-2 select the RAM bank at 0xC000, bit 4 the ROM and
    /// bit 5 locks paging until reset.
    fn write_7ffd(&mut self, value: u8) {
        if *self.paging_locked {
            return;
        }
        let rom_base = self.memory.model().rom_bank_base();
        self.memory.set_slot(3, value & 0x07);
        self.memory.set_slot(0, rom_base + ((value >> 4) & 0x01));
        *self.paging_locked = value & 0x20 != 0;
    }

    /// Next MMU registers 0x50-0x57 page an 8K bank into each slot. 0xFF in
    /// the two lowest slots selects the ROM.
    fn write_nextreg(&mut self, value: u8) {
        let register = *self.nextreg_selected;
        if !(0x50..=0x57).contains(&register) {
            log::trace!("NEXTREG 0x{register:02X} = 0x{value:02X} ignored");
            return;
        }
        let slot = usize::from(register - 0x50);
        let bank = if value == 0xFF && slot < 2 { 0xFE + slot as u8 } else { value };
        self.memory.set_slot(slot, bank);
    }
}

impl Bus for MachineBus<'_> {
    fn fetch(&mut self, address: u16) -> u8 {
        self.memory.read(address)
    }

    fn read(&mut self, address: u16) -> u8 {
        self.watch(address, WatchKind::Read);
        self.memory.read(address)
    }

    fn write(&mut self, address: u16, value: u8) {
        self.watch(address, WatchKind::Write);
        self.memory.write(address, value);
    }

    fn input(&mut self, port: u16) -> u8 {
        if self.is_dma_port(port) {
            return self.dma.status();
        }
        if port == NEXTREG_SELECT {
            return *self.nextreg_selected;
        }
        0xFF
    }

    fn output(&mut self, port: u16, value: u8) {
        let model = self.memory.model();
        if self.is_dma_port(port) {
            self.write_dma(value);
        } else if model == MemoryModel::Zx128k && port & 0x8002 == 0 {
            self.write_7ffd(value);
        } else if model == MemoryModel::ZxNext && port == NEXTREG_SELECT {
            *self.nextreg_selected = value;
        } else if model == MemoryModel::ZxNext && port == NEXTREG_DATA {
            self.write_nextreg(value);
        } else {
            log::trace!("OUT (0x{port:04X}),0x{value:02X}");
        }
    }
}

struct DmaMemory<'a>(&'a mut BankedMemory);

impl DmaBus for DmaMemory<'_> {
    fn dma_read_memory(&mut self, address: u16) -> u8 {
        self.0.read(address)
    }

    fn dma_write_memory(&mut self, address: u16, value: u8) {
        self.0.write(address, value);
    }

    fn dma_read_port(&mut self, port: u16) -> u8 {
        log::trace!("DMA IN (0x{port:04X})");
        0xFF
    }

    fn dma_write_port(&mut self, port: u16, value: u8) {
        log::trace!("DMA OUT (0x{port:04X}),0x{value:02X}");
    }
}
