//! Paged memory used by the in-process simulator.

use super::MemoryModel;

/// Bank storage plus the current slot mapping for a memory model.
pub struct BankedMemory {
    model: MemoryModel,
    banks: Vec<Vec<u8>>,
    slots: Vec<u8>,
}

impl BankedMemory {
    pub fn new(model: MemoryModel) -> Self {
        let banks = model.bank_sizes().into_iter().map(|size| vec![0u8; size]).collect();
        Self { model, banks, slots: model.default_slots() }
    }

    pub fn model(&self) -> MemoryModel {
        self.model
    }

    pub fn slots(&self) -> &[u8] {
        &self.slots
    }

    /// Page `bank` into `slot`. Requests for banks that do not fit the slot are ignored.
    pub fn set_slot(&mut self, slot: usize, bank: u8) {
        if slot >= self.slots.len() {
            log::warn!("Ignoring paging request for slot {slot}");
            return;
        }
        if self.banks.get(usize::from(bank)).map(Vec::len) != Some(self.model.slot_size(slot)) {
            log::warn!("Bank {bank} cannot be paged into slot {slot}");
            return;
        }
        self.slots[slot] = bank;
    }

    fn locate(&self, address: u16) -> (usize, usize) {
        let slot = self.model.slot_of(address);
        let offset = usize::from(address - self.model.slot_starts()[slot]);
        (usize::from(self.slots[slot]), offset)
    }

    pub fn read(&self, address: u16) -> u8 {
        let (bank, offset) = self.locate(address);
        self.banks[bank][offset]
    }

    /// Write one byte. Writes into ROM banks are dropped.
    pub fn write(&mut self, address: u16, value: u8) {
        let (bank, offset) = self.locate(address);
        if self.model.is_rom(bank as u8) {
            return;
        }
        self.banks[bank][offset] = value;
    }

    /// Write one byte regardless of ROM protection. Used by the debugger itself.
    pub fn poke(&mut self, address: u16, value: u8) {
        let (bank, offset) = self.locate(address);
        self.banks[bank][offset] = value;
    }

    pub fn read_block(&self, address: u16, size: u16) -> Vec<u8> {
        (0..size).map(|i| self.read(address.wrapping_add(i))).collect()
    }

    pub fn load(&mut self, address: u16, data: &[u8]) {
        let mut addr = address;
        for &byte in data {
            self.poke(addr, byte);
            addr = addr.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_memory_wraps() {
        let mut mem = BankedMemory::new(MemoryModel::Unknown);
        mem.load(0xFFFF, &[0x11, 0x22]);
        assert_eq!(mem.read(0xFFFF), 0x11);
        assert_eq!(mem.read(0x0000), 0x22);
        assert_eq!(mem.read_block(0xFFFF, 2), vec![0x11, 0x22]);
    }

    #[test]
    fn test_rom_is_write_protected() {
        let mut mem = BankedMemory::new(MemoryModel::Zx48k);
        mem.write(0x0010, 0xAA);
        assert_eq!(mem.read(0x0010), 0x00);
        mem.poke(0x0010, 0xAA);
        assert_eq!(mem.read(0x0010), 0xAA);
        mem.write(0x8000, 0x55);
        assert_eq!(mem.read(0x8000), 0x55);
    }

    #[test]
    fn test_paging_switches_visible_bank() {
        let mut mem = BankedMemory::new(MemoryModel::Zx128k);
        mem.write(0xC000, 0x01);
        mem.set_slot(3, 7);
        assert_eq!(mem.read(0xC000), 0x00);
        mem.write(0xC000, 0x07);
        mem.set_slot(3, 0);
        assert_eq!(mem.read(0xC000), 0x01);
        assert_eq!(mem.slots(), &[8, 5, 2, 0]);
    }

    #[test]
    fn test_invalid_paging_is_ignored() {
        let mut mem = BankedMemory::new(MemoryModel::Zx128k);
        mem.set_slot(9, 1);
        mem.set_slot(3, 200);
        assert_eq!(mem.slots(), &[8, 5, 2, 0]);
    }
}
