//! Memory model module.
//!
//! Describes how the 64K address space is split into slots for each supported
//! machine, and how long (banked) addresses are encoded.

pub mod banked;

pub use banked::BankedMemory;

use serde::{Deserialize, Serialize};
use std::fmt;

/// The memory layout of the debugged machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryModel {
    /// Nothing is known about paging, the whole address space is one slot.
    #[default]
    Unknown,
    /// 16K ROM, 16K RAM, unpopulated upper 32K.
    Zx16k,
    /// 16K ROM followed by 48K RAM.
    Zx48k,
    /// Four 16K slots, RAM banks 0-7 and two ROMs.
    Zx128k,
    /// Eight 8K slots, 224 RAM pages and four ROM pages.
    ZxNext,
}

/// Shape of the slot vector reported for a memory model.
///
/// Chosen once per model and used by the register line decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotLayout {
    /// A single placeholder slot.
    Unknown,
    /// Two fixed slots, MMU data is ignored.
    Fixed2,
    /// Three fixed slots, MMU data is ignored.
    Fixed3,
    /// One bank index per slot, decoded from MMU data.
    Banked { slots: usize, rom_base: u8 },
}

const SLOTS_UNKNOWN: &[u16] = &[0x0000];
const SLOTS_ZX16K: &[u16] = &[0x0000, 0x4000, 0x8000];
const SLOTS_ZX48K: &[u16] = &[0x0000, 0x4000];
const SLOTS_ZX128K: &[u16] = &[0x0000, 0x4000, 0x8000, 0xC000];
const SLOTS_ZXNEXT: &[u16] = &[0x0000, 0x2000, 0x4000, 0x6000, 0x8000, 0xA000, 0xC000, 0xE000];

impl MemoryModel {
    /// Start address of every slot, in ascending order.
    pub fn slot_starts(&self) -> &'static [u16] {
        match self {
            Self::Unknown => SLOTS_UNKNOWN,
            Self::Zx16k => SLOTS_ZX16K,
            Self::Zx48k => SLOTS_ZX48K,
            Self::Zx128k => SLOTS_ZX128K,
            Self::ZxNext => SLOTS_ZXNEXT,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_starts().len()
    }

    /// Size in bytes of the given slot.
    pub fn slot_size(&self, slot: usize) -> usize {
        let starts = self.slot_starts();
        let start = usize::from(starts[slot]);
        let end = starts.get(slot + 1).map_or(0x1_0000, |&s| usize::from(s));
        end - start
    }

    /// Index of the slot that contains `address`.
    pub fn slot_of(&self, address: u16) -> usize {
        self.slot_starts().iter().rposition(|&start| address >= start).unwrap_or(0)
    }

    pub fn slot_layout(&self) -> SlotLayout {
        match self {
            Self::Unknown => SlotLayout::Unknown,
            Self::Zx48k => SlotLayout::Fixed2,
            Self::Zx16k => SlotLayout::Fixed3,
            Self::Zx128k | Self::ZxNext => {
                SlotLayout::Banked { slots: self.slot_count(), rom_base: self.rom_bank_base() }
            }
        }
    }

    /// Bank id of the first ROM bank. ROM page `n` maps to bank `rom_base + n`.
    pub fn rom_bank_base(&self) -> u8 {
        match self {
            Self::Unknown | Self::Zx16k | Self::Zx48k => 0,
            Self::Zx128k => 8,
            Self::ZxNext => 0xFC,
        }
    }

    /// Bank mapping after reset.
    pub fn default_slots(&self) -> Vec<u8> {
        match self {
            Self::Unknown => vec![0],
            Self::Zx48k => vec![0, 1],
            Self::Zx16k => vec![0, 1, 2],
            Self::Zx128k => vec![8, 5, 2, 0],
            Self::ZxNext => vec![0xFE, 0xFF, 10, 11, 4, 5, 0, 1],
        }
    }

    /// Sizes of all banks, indexed by bank id. Unused ids have size zero.
    pub fn bank_sizes(&self) -> Vec<usize> {
        match self {
            Self::Unknown => vec![0x1_0000],
            Self::Zx48k => vec![0x4000, 0xC000],
            Self::Zx16k => vec![0x4000, 0x4000, 0x8000],
            Self::Zx128k => vec![0x4000; 10],
            Self::ZxNext => {
                let mut sizes = vec![0x2000; 224];
                sizes.resize(0xFC, 0);
                sizes.extend([0x2000; 4]);
                sizes
            }
        }
    }

    /// Whether the bank is ROM.
    pub fn is_rom(&self, bank: u8) -> bool {
        match self {
            Self::Unknown => false,
            Self::Zx16k | Self::Zx48k => bank == 0,
            Self::Zx128k | Self::ZxNext => bank >= self.rom_bank_base(),
        }
    }
}

impl fmt::Display for MemoryModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Zx16k => "zx16k",
            Self::Zx48k => "zx48k",
            Self::Zx128k => "zx128k",
            Self::ZxNext => "zxnext",
        };
        f.write_str(name)
    }
}

/// A 16-bit address, optionally qualified with the bank it lives in.
///
/// Encoded as `((bank + 1) << 16) | address`; an upper half of zero means the
/// address is plain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LongAddress(u32);

impl LongAddress {
    pub const fn plain(address: u16) -> Self {
        Self(address as u32)
    }

    pub const fn banked(address: u16, bank: u8) -> Self {
        Self(((bank as u32 + 1) << 16) | address as u32)
    }

    /// Qualify `address` with the bank currently paged into its slot.
    pub fn resolve(address: u16, model: MemoryModel, slots: &[u8]) -> Self {
        match slots.get(model.slot_of(address)) {
            Some(&bank) if model != MemoryModel::Unknown => Self::banked(address, bank),
            _ => Self::plain(address),
        }
    }

    pub const fn address(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    pub const fn bank(&self) -> Option<u8> {
        match self.0 >> 16 {
            0 => None,
            upper => Some((upper - 1) as u8),
        }
    }

    pub const fn is_long(&self) -> bool {
        self.0 >> 16 != 0
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// Whether this address refers to the same location as a plain CPU
    /// address given the current slot mapping.
    pub fn matches(&self, address: u16, model: MemoryModel, slots: &[u8]) -> bool {
        if self.address() != address {
            return false;
        }
        match self.bank() {
            None => true,
            Some(bank) => slots.get(model.slot_of(address)) == Some(&bank),
        }
    }
}

impl From<u16> for LongAddress {
    fn from(address: u16) -> Self {
        Self::plain(address)
    }
}

impl fmt::Display for LongAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bank() {
            Some(bank) => write!(f, "0x{:04X}@{}", self.address(), bank),
            None => write!(f, "0x{:04X}", self.address()),
        }
    }
}
