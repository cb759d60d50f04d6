//! Z80 register model.
//!
//! `RegisterSet` is the complete register snapshot every backend produces.

pub mod decoder;

pub use decoder::{DecodeError, RegisterLineDecoder, StatusField};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Registers that can be read or written individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Z80Register {
    PC,
    SP,
    AF,
    BC,
    DE,
    HL,
    IX,
    IY,
    AF2,
    BC2,
    DE2,
    HL2,
    I,
    R,
    IM,
    A,
    F,
    B,
    C,
    D,
    E,
    H,
    L,
}

impl Z80Register {
    pub const ALL: [Self; 23] = [
        Self::PC,
        Self::SP,
        Self::AF,
        Self::BC,
        Self::DE,
        Self::HL,
        Self::IX,
        Self::IY,
        Self::AF2,
        Self::BC2,
        Self::DE2,
        Self::HL2,
        Self::I,
        Self::R,
        Self::IM,
        Self::A,
        Self::F,
        Self::B,
        Self::C,
        Self::D,
        Self::E,
        Self::H,
        Self::L,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::PC => "PC",
            Self::SP => "SP",
            Self::AF => "AF",
            Self::BC => "BC",
            Self::DE => "DE",
            Self::HL => "HL",
            Self::IX => "IX",
            Self::IY => "IY",
            Self::AF2 => "AF'",
            Self::BC2 => "BC'",
            Self::DE2 => "DE'",
            Self::HL2 => "HL'",
            Self::I => "I",
            Self::R => "R",
            Self::IM => "IM",
            Self::A => "A",
            Self::F => "F",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
            Self::E => "E",
            Self::H => "H",
            Self::L => "L",
        }
    }

    /// Whether the register is 8 bits wide.
    pub fn is_byte(&self) -> bool {
        !matches!(
            self,
            Self::PC
                | Self::SP
                | Self::AF
                | Self::BC
                | Self::DE
                | Self::HL
                | Self::IX
                | Self::IY
                | Self::AF2
                | Self::BC2
                | Self::DE2
                | Self::HL2
        )
    }

    /// The register pair an 8-bit register is half of.
    pub fn pair(&self) -> Option<Self> {
        match self {
            Self::A | Self::F => Some(Self::AF),
            Self::B | Self::C => Some(Self::BC),
            Self::D | Self::E => Some(Self::DE),
            Self::H | Self::L => Some(Self::HL),
            _ => None,
        }
    }
}

impl fmt::Display for Z80Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Z80Register {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Self::ALL
            .iter()
            .find(|reg| reg.name() == upper)
            .copied()
            .ok_or_else(|| format!("Unknown register '{s}'"))
    }
}

/// A complete snapshot of the CPU registers and the slot mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSet {
    pub pc: u16,
    pub sp: u16,
    pub af: u16,
    pub bc: u16,
    pub de: u16,
    pub hl: u16,
    pub ix: u16,
    pub iy: u16,
    pub af2: u16,
    pub bc2: u16,
    pub de2: u16,
    pub hl2: u16,
    pub i: u8,
    pub r: u8,
    pub im: u8,
    /// Bank paged into each slot.
    pub slots: Vec<u8>,
}

fn high(word: u16) -> u16 {
    word >> 8
}

fn low(word: u16) -> u16 {
    word & 0xFF
}

fn with_high(word: u16, value: u16) -> u16 {
    (word & 0x00FF) | ((value & 0xFF) << 8)
}

fn with_low(word: u16, value: u16) -> u16 {
    (word & 0xFF00) | (value & 0xFF)
}

impl RegisterSet {
    pub fn get(&self, reg: Z80Register) -> u16 {
        match reg {
            Z80Register::PC => self.pc,
            Z80Register::SP => self.sp,
            Z80Register::AF => self.af,
            Z80Register::BC => self.bc,
            Z80Register::DE => self.de,
            Z80Register::HL => self.hl,
            Z80Register::IX => self.ix,
            Z80Register::IY => self.iy,
            Z80Register::AF2 => self.af2,
            Z80Register::BC2 => self.bc2,
            Z80Register::DE2 => self.de2,
            Z80Register::HL2 => self.hl2,
            Z80Register::I => u16::from(self.i),
            Z80Register::R => u16::from(self.r),
            Z80Register::IM => u16::from(self.im),
            Z80Register::A => high(self.af),
            Z80Register::F => low(self.af),
            Z80Register::B => high(self.bc),
            Z80Register::C => low(self.bc),
            Z80Register::D => high(self.de),
            Z80Register::E => low(self.de),
            Z80Register::H => high(self.hl),
            Z80Register::L => low(self.hl),
        }
    }

    /// Set a register. 8-bit registers take the low byte of `value`.
    pub fn set(&mut self, reg: Z80Register, value: u16) {
        let byte = (value & 0xFF) as u8;
        match reg {
            Z80Register::PC => self.pc = value,
            Z80Register::SP => self.sp = value,
            Z80Register::AF => self.af = value,
            Z80Register::BC => self.bc = value,
            Z80Register::DE => self.de = value,
            Z80Register::HL => self.hl = value,
            Z80Register::IX => self.ix = value,
            Z80Register::IY => self.iy = value,
            Z80Register::AF2 => self.af2 = value,
            Z80Register::BC2 => self.bc2 = value,
            Z80Register::DE2 => self.de2 = value,
            Z80Register::HL2 => self.hl2 = value,
            Z80Register::I => self.i = byte,
            Z80Register::R => self.r = byte,
            Z80Register::IM => self.im = byte.min(2),
            Z80Register::A => self.af = with_high(self.af, value),
            Z80Register::F => self.af = with_low(self.af, value),
            Z80Register::B => self.bc = with_high(self.bc, value),
            Z80Register::C => self.bc = with_low(self.bc, value),
            Z80Register::D => self.de = with_high(self.de, value),
            Z80Register::E => self.de = with_low(self.de, value),
            Z80Register::H => self.hl = with_high(self.hl, value),
            Z80Register::L => self.hl = with_low(self.hl, value),
        }
    }
}

impl fmt::Display for RegisterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PC={:04X} SP={:04X} AF={:04X} BC={:04X} DE={:04X} HL={:04X} IX={:04X} IY={:04X} \
             AF'={:04X} BC'={:04X} DE'={:04X} HL'={:04X} I={:02X} R={:02X} IM{}",
            self.pc,
            self.sp,
            self.af,
            self.bc,
            self.de,
            self.hl,
            self.ix,
            self.iy,
            self.af2,
            self.bc2,
            self.de2,
            self.hl2,
            self.i,
            self.r,
            self.im
        )
    }
}
