//! Instruction-stepped Z80 core.
//!
//! Covers the instructions needed to run small test programs: 8/16-bit loads,
//! 8-bit arithmetic and logic, increments and decrements, absolute and
//! relative jumps, calls and returns, stack operations, exchanges, port I/O,
//! block copies, interrupt mode control, `HALT` and the Z80N `NEXTREG`.
//! Timing is not modelled.

use crate::registers::{RegisterSet, Z80Register};
use thiserror::Error;

#[repr(u8)]
#[derive(Copy, Clone, Debug)]
pub enum Flag {
    C = 0x01,
    N = 0x02,
    PV = 0x04,
    X = 0x08,
    H = 0x10,
    Y = 0x20,
    Z = 0x40,
    S = 0x80,
}

/// Memory and I/O as seen by the CPU.
pub trait Bus {
    /// Opcode and operand fetches.
    fn fetch(&mut self, address: u16) -> u8;
    /// Data reads.
    fn read(&mut self, address: u16) -> u8;
    fn write(&mut self, address: u16, value: u8);
    fn input(&mut self, port: u16) -> u8;
    fn output(&mut self, port: u16, value: u8);
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CpuError {
    #[error("Unsupported instruction {opcode} at 0x{pc:04X}")]
    UnsupportedInstruction { pc: u16, opcode: String },
}

/// Port pair used by `NEXTREG`.
pub const NEXTREG_SELECT: u16 = 0x243B;
pub const NEXTREG_DATA: u16 = 0x253B;

const R8: [Z80Register; 8] = [
    Z80Register::B,
    Z80Register::C,
    Z80Register::D,
    Z80Register::E,
    Z80Register::H,
    Z80Register::L,
    Z80Register::F, // (HL), never used
    Z80Register::A,
];

const RP: [Z80Register; 4] = [Z80Register::BC, Z80Register::DE, Z80Register::HL, Z80Register::SP];
const RP2: [Z80Register; 4] = [Z80Register::BC, Z80Register::DE, Z80Register::HL, Z80Register::AF];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum IndexMode {
    IX,
    IY,
}

#[derive(Debug, Clone, Default)]
pub struct Z80Cpu {
    pub regs: RegisterSet,
    pub iff1: bool,
    pub iff2: bool,
    pub halted: bool,
}

fn parity(value: u8) -> bool {
    value.count_ones() % 2 == 0
}

fn sz_flags(value: u8) -> u8 {
    let mut f = value & (Flag::S as u8 | Flag::X as u8 | Flag::Y as u8);
    if value == 0 {
        f |= Flag::Z as u8;
    }
    f
}

impl Z80Cpu {
    pub fn new() -> Self {
        Self { regs: RegisterSet { sp: 0xFFFF, af: 0xFFFF, slots: vec![0], ..Default::default() }, ..Default::default() }
    }

    fn a(&self) -> u8 {
        self.regs.get(Z80Register::A) as u8
    }

    fn set_a(&mut self, value: u8) {
        self.regs.set(Z80Register::A, u16::from(value));
    }

    fn f(&self) -> u8 {
        self.regs.get(Z80Register::F) as u8
    }

    fn set_f(&mut self, value: u8) {
        self.regs.set(Z80Register::F, u16::from(value));
    }

    fn flag(&self, flag: Flag) -> bool {
        self.f() & flag as u8 != 0
    }

    fn bump_r(&mut self) {
        self.regs.r = (self.regs.r & 0x80) | (self.regs.r.wrapping_add(1) & 0x7F);
    }

    fn fetch_byte(&mut self, bus: &mut impl Bus) -> u8 {
        let value = bus.fetch(self.regs.pc);
        self.regs.pc = self.regs.pc.wrapping_add(1);
        value
    }

    fn fetch_word(&mut self, bus: &mut impl Bus) -> u16 {
        let low = self.fetch_byte(bus);
        let high = self.fetch_byte(bus);
        u16::from_le_bytes([low, high])
    }

    fn read_word(bus: &mut impl Bus, address: u16) -> u16 {
        u16::from_le_bytes([bus.read(address), bus.read(address.wrapping_add(1))])
    }

    fn write_word(bus: &mut impl Bus, address: u16, value: u16) {
        let [low, high] = value.to_le_bytes();
        bus.write(address, low);
        bus.write(address.wrapping_add(1), high);
    }

    fn push(&mut self, bus: &mut impl Bus, value: u16) {
        let [low, high] = value.to_le_bytes();
        self.regs.sp = self.regs.sp.wrapping_sub(1);
        bus.write(self.regs.sp, high);
        self.regs.sp = self.regs.sp.wrapping_sub(1);
        bus.write(self.regs.sp, low);
    }

    fn pop(&mut self, bus: &mut impl Bus) -> u16 {
        let low = bus.read(self.regs.sp);
        self.regs.sp = self.regs.sp.wrapping_add(1);
        let high = bus.read(self.regs.sp);
        self.regs.sp = self.regs.sp.wrapping_add(1);
        u16::from_le_bytes([low, high])
    }

    fn get_r8(&mut self, bus: &mut impl Bus, index: u8) -> u8 {
        match index {
            6 => bus.read(self.regs.hl),
            i => self.regs.get(R8[usize::from(i)]) as u8,
        }
    }

    fn set_r8(&mut self, bus: &mut impl Bus, index: u8, value: u8) {
        match index {
            6 => bus.write(self.regs.hl, value),
            i => self.regs.set(R8[usize::from(i)], u16::from(value)),
        }
    }

    fn condition(&self, cc: u8) -> bool {
        match cc {
            0 => !self.flag(Flag::Z),
            1 => self.flag(Flag::Z),
            2 => !self.flag(Flag::C),
            3 => self.flag(Flag::C),
            4 => !self.flag(Flag::PV),
            5 => self.flag(Flag::PV),
            6 => !self.flag(Flag::S),
            _ => self.flag(Flag::S),
        }
    }

    fn inc8(&mut self, value: u8) -> u8 {
        let result = value.wrapping_add(1);
        let mut f = sz_flags(result) | (self.f() & Flag::C as u8);
        if value & 0x0F == 0x0F {
            f |= Flag::H as u8;
        }
        if value == 0x7F {
            f |= Flag::PV as u8;
        }
        self.set_f(f);
        result
    }

    fn dec8(&mut self, value: u8) -> u8 {
        let result = value.wrapping_sub(1);
        let mut f = sz_flags(result) | Flag::N as u8 | (self.f() & Flag::C as u8);
        if value & 0x0F == 0 {
            f |= Flag::H as u8;
        }
        if value == 0x80 {
            f |= Flag::PV as u8;
        }
        self.set_f(f);
        result
    }

    fn alu(&mut self, op: u8, value: u8) {
        let a = self.a();
        let carry = u8::from(self.flag(Flag::C));
        match op {
            // ADD, ADC
            0 | 1 => {
                let c = if op == 1 { carry } else { 0 };
                let wide = u16::from(a) + u16::from(value) + u16::from(c);
                let result = wide as u8;
                let mut f = sz_flags(result);
                if (a & 0x0F) + (value & 0x0F) + c > 0x0F {
                    f |= Flag::H as u8;
                }
                if (a ^ result) & (value ^ result) & 0x80 != 0 {
                    f |= Flag::PV as u8;
                }
                if wide > 0xFF {
                    f |= Flag::C as u8;
                }
                self.set_a(result);
                self.set_f(f);
            }
            // SUB, SBC, CP
            2 | 3 | 7 => {
                let c = if op == 3 { carry } else { 0 };
                let wide = u16::from(a).wrapping_sub(u16::from(value)).wrapping_sub(u16::from(c));
                let result = wide as u8;
                let mut f = sz_flags(result) | Flag::N as u8;
                if (a & 0x0F) < (value & 0x0F) + c {
                    f |= Flag::H as u8;
                }
                if (a ^ value) & (a ^ result) & 0x80 != 0 {
                    f |= Flag::PV as u8;
                }
                if wide > 0xFF {
                    f |= Flag::C as u8;
                }
                if op == 7 {
                    f = (f & !(Flag::X as u8 | Flag::Y as u8)) | (value & (Flag::X as u8 | Flag::Y as u8));
                } else {
                    self.set_a(result);
                }
                self.set_f(f);
            }
            // AND, XOR, OR
            _ => {
                let result = match op {
                    4 => a & value,
                    5 => a ^ value,
                    _ => a | value,
                };
                let mut f = sz_flags(result);
                if parity(result) {
                    f |= Flag::PV as u8;
                }
                if op == 4 {
                    f |= Flag::H as u8;
                }
                self.set_a(result);
                self.set_f(f);
            }
        }
    }

    fn add16(&mut self, left: u16, right: u16) -> u16 {
        let wide = u32::from(left) + u32::from(right);
        let keep = self.f() & (Flag::S as u8 | Flag::Z as u8 | Flag::PV as u8);
        let mut f = keep | ((wide >> 8) as u8 & (Flag::X as u8 | Flag::Y as u8));
        if (left & 0x0FFF) + (right & 0x0FFF) > 0x0FFF {
            f |= Flag::H as u8;
        }
        if wide > 0xFFFF {
            f |= Flag::C as u8;
        }
        self.set_f(f);
        wide as u16
    }

    fn unsupported(&mut self, pc: u16, bytes: &[u8]) -> CpuError {
        self.regs.pc = pc;
        let opcode = bytes.iter().map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(" ");
        CpuError::UnsupportedInstruction { pc, opcode }
    }

    /// Execute one instruction. A halted CPU does nothing.
    pub fn step(&mut self, bus: &mut impl Bus) -> Result<(), CpuError> {
        if self.halted {
            return Ok(());
        }
        let pc = self.regs.pc;
        let opcode = self.fetch_byte(bus);
        self.bump_r();
        match opcode {
            0xED => self.execute_ed(bus, pc),
            0xDD => self.execute_index(bus, pc, IndexMode::IX),
            0xFD => self.execute_index(bus, pc, IndexMode::IY),
            op => self.execute(bus, pc, op),
        }
    }

    fn execute(&mut self, bus: &mut impl Bus, pc: u16, op: u8) -> Result<(), CpuError> {
        let y = (op >> 3) & 0x07;
        let z = op & 0x07;
        let p = usize::from(y >> 1);
        match op {
            0x00 => {}
            0x01 | 0x11 | 0x21 | 0x31 => {
                let value = self.fetch_word(bus);
                self.regs.set(RP[p], value);
            }
            0x02 => bus.write(self.regs.bc, self.a()),
            0x12 => bus.write(self.regs.de, self.a()),
            0x0A => {
                let value = bus.read(self.regs.bc);
                self.set_a(value);
            }
            0x1A => {
                let value = bus.read(self.regs.de);
                self.set_a(value);
            }
            0x22 => {
                let address = self.fetch_word(bus);
                Self::write_word(bus, address, self.regs.hl);
            }
            0x2A => {
                let address = self.fetch_word(bus);
                self.regs.hl = Self::read_word(bus, address);
            }
            0x32 => {
                let address = self.fetch_word(bus);
                bus.write(address, self.a());
            }
            0x3A => {
                let address = self.fetch_word(bus);
                let value = bus.read(address);
                self.set_a(value);
            }
            0x03 | 0x13 | 0x23 | 0x33 => {
                let value = self.regs.get(RP[p]).wrapping_add(1);
                self.regs.set(RP[p], value);
            }
            0x0B | 0x1B | 0x2B | 0x3B => {
                let value = self.regs.get(RP[p]).wrapping_sub(1);
                self.regs.set(RP[p], value);
            }
            0x09 | 0x19 | 0x29 | 0x39 => {
                let value = self.add16(self.regs.hl, self.regs.get(RP[p]));
                self.regs.hl = value;
            }
            _ if op & 0xC7 == 0x04 => {
                let value = self.get_r8(bus, y);
                let result = self.inc8(value);
                self.set_r8(bus, y, result);
            }
            _ if op & 0xC7 == 0x05 => {
                let value = self.get_r8(bus, y);
                let result = self.dec8(value);
                self.set_r8(bus, y, result);
            }
            _ if op & 0xC7 == 0x06 => {
                let value = self.fetch_byte(bus);
                self.set_r8(bus, y, value);
            }
            0x08 => std::mem::swap(&mut self.regs.af, &mut self.regs.af2),
            0xD9 => {
                std::mem::swap(&mut self.regs.bc, &mut self.regs.bc2);
                std::mem::swap(&mut self.regs.de, &mut self.regs.de2);
                std::mem::swap(&mut self.regs.hl, &mut self.regs.hl2);
            }
            0xEB => std::mem::swap(&mut self.regs.de, &mut self.regs.hl),
            0xE3 => {
                let value = Self::read_word(bus, self.regs.sp);
                Self::write_word(bus, self.regs.sp, self.regs.hl);
                self.regs.hl = value;
            }
            0x10 => {
                let offset = self.fetch_byte(bus) as i8;
                let b = (self.regs.get(Z80Register::B) as u8).wrapping_sub(1);
                self.regs.set(Z80Register::B, u16::from(b));
                if b != 0 {
                    self.regs.pc = self.regs.pc.wrapping_add_signed(i16::from(offset));
                }
            }
            0x18 | 0x20 | 0x28 | 0x30 | 0x38 => {
                let offset = self.fetch_byte(bus) as i8;
                if op == 0x18 || self.condition(y - 4) {
                    self.regs.pc = self.regs.pc.wrapping_add_signed(i16::from(offset));
                }
            }
            0x76 => {
                self.halted = true;
                self.regs.pc = pc;
            }
            0x40..=0x7F => {
                let value = self.get_r8(bus, z);
                self.set_r8(bus, y, value);
            }
            0x80..=0xBF => {
                let value = self.get_r8(bus, z);
                self.alu(y, value);
            }
            _ if op & 0xC7 == 0xC6 => {
                let value = self.fetch_byte(bus);
                self.alu(y, value);
            }
            0xC3 => self.regs.pc = self.fetch_word(bus),
            _ if op & 0xC7 == 0xC2 => {
                let target = self.fetch_word(bus);
                if self.condition(y) {
                    self.regs.pc = target;
                }
            }
            0xE9 => self.regs.pc = self.regs.hl,
            0xCD => {
                let target = self.fetch_word(bus);
                self.push(bus, self.regs.pc);
                self.regs.pc = target;
            }
            _ if op & 0xC7 == 0xC4 => {
                let target = self.fetch_word(bus);
                if self.condition(y) {
                    self.push(bus, self.regs.pc);
                    self.regs.pc = target;
                }
            }
            0xC9 => self.regs.pc = self.pop(bus),
            _ if op & 0xC7 == 0xC0 => {
                if self.condition(y) {
                    self.regs.pc = self.pop(bus);
                }
            }
            _ if op & 0xC7 == 0xC7 => {
                self.push(bus, self.regs.pc);
                self.regs.pc = u16::from(y) * 8;
            }
            0xC1 | 0xD1 | 0xE1 | 0xF1 => {
                let value = self.pop(bus);
                self.regs.set(RP2[p], value);
            }
            0xC5 | 0xD5 | 0xE5 | 0xF5 => {
                let value = self.regs.get(RP2[p]);
                self.push(bus, value);
            }
            0xD3 => {
                let port = self.fetch_byte(bus);
                let a = self.a();
                bus.output(u16::from_le_bytes([port, a]), a);
            }
            0xDB => {
                let port = self.fetch_byte(bus);
                let value = bus.input(u16::from_le_bytes([port, self.a()]));
                self.set_a(value);
            }
            0xF3 => {
                self.iff1 = false;
                self.iff2 = false;
            }
            0xFB => {
                self.iff1 = true;
                self.iff2 = true;
            }
            0xF9 => self.regs.sp = self.regs.hl,
            0x2F => {
                let a = !self.a();
                self.set_a(a);
                let f = self.f() | Flag::H as u8 | Flag::N as u8;
                self.set_f(f);
            }
            0x37 => {
                let f = (self.f() & !(Flag::H as u8 | Flag::N as u8)) | Flag::C as u8;
                self.set_f(f);
            }
            0x3F => {
                let carry = self.flag(Flag::C);
                let mut f = self.f() & !(Flag::H as u8 | Flag::N as u8 | Flag::C as u8);
                if carry {
                    f |= Flag::H as u8;
                } else {
                    f |= Flag::C as u8;
                }
                self.set_f(f);
            }
            _ => return Err(self.unsupported(pc, &[op])),
        }
        Ok(())
    }

    fn execute_ed(&mut self, bus: &mut impl Bus, pc: u16) -> Result<(), CpuError> {
        let op = self.fetch_byte(bus);
        self.bump_r();
        let y = (op >> 3) & 0x07;
        match op {
            0x46 | 0x66 => self.regs.im = 0,
            0x56 | 0x76 => self.regs.im = 1,
            0x5E | 0x7E => self.regs.im = 2,
            0x47 => self.regs.i = self.a(),
            0x4F => self.regs.r = self.a(),
            0x57 | 0x5F => {
                let value = if op == 0x57 { self.regs.i } else { self.regs.r };
                self.set_a(value);
                let mut f = sz_flags(value) | (self.f() & Flag::C as u8);
                if self.iff2 {
                    f |= Flag::PV as u8;
                }
                self.set_f(f);
            }
            0x45 | 0x4D => {
                self.regs.pc = self.pop(bus);
                self.iff1 = self.iff2;
            }
            _ if op & 0xC7 == 0x40 && y != 6 => {
                let value = bus.input(self.regs.bc);
                self.set_r8(bus, y, value);
                let mut f = sz_flags(value) | (self.f() & Flag::C as u8);
                if parity(value) {
                    f |= Flag::PV as u8;
                }
                self.set_f(f);
            }
            _ if op & 0xC7 == 0x41 && y != 6 => {
                let value = self.get_r8(bus, y);
                bus.output(self.regs.bc, value);
            }
            0x43 | 0x53 | 0x73 => {
                let address = self.fetch_word(bus);
                Self::write_word(bus, address, self.regs.get(RP[usize::from(y >> 1)]));
            }
            0x4B | 0x5B | 0x7B => {
                let address = self.fetch_word(bus);
                let value = Self::read_word(bus, address);
                self.regs.set(RP[usize::from(y >> 1)], value);
            }
            // LDI, LDD, LDIR, LDDR
            0xA0 | 0xA8 | 0xB0 | 0xB8 => {
                let value = bus.read(self.regs.hl);
                bus.write(self.regs.de, value);
                let delta: i16 = if op & 0x08 == 0 { 1 } else { -1 };
                self.regs.hl = self.regs.hl.wrapping_add_signed(delta);
                self.regs.de = self.regs.de.wrapping_add_signed(delta);
                self.regs.bc = self.regs.bc.wrapping_sub(1);
                let mut f = self.f() & (Flag::S as u8 | Flag::Z as u8 | Flag::C as u8);
                if self.regs.bc != 0 {
                    f |= Flag::PV as u8;
                }
                self.set_f(f);
                if op & 0x10 != 0 && self.regs.bc != 0 {
                    self.regs.pc = pc;
                }
            }
            // NEXTREG reg,value / NEXTREG reg,A
            0x91 | 0x92 => {
                let register = self.fetch_byte(bus);
                let value = if op == 0x91 { self.fetch_byte(bus) } else { self.a() };
                bus.output(NEXTREG_SELECT, register);
                bus.output(NEXTREG_DATA, value);
            }
            _ => return Err(self.unsupported(pc, &[0xED, op])),
        }
        Ok(())
    }

    fn index(&self, mode: IndexMode) -> u16 {
        match mode {
            IndexMode::IX => self.regs.ix,
            IndexMode::IY => self.regs.iy,
        }
    }

    fn set_index(&mut self, mode: IndexMode, value: u16) {
        match mode {
            IndexMode::IX => self.regs.ix = value,
            IndexMode::IY => self.regs.iy = value,
        }
    }

    fn displaced(&mut self, bus: &mut impl Bus, mode: IndexMode) -> u16 {
        let offset = self.fetch_byte(bus) as i8;
        self.index(mode).wrapping_add_signed(i16::from(offset))
    }

    fn execute_index(&mut self, bus: &mut impl Bus, pc: u16, mode: IndexMode) -> Result<(), CpuError> {
        let prefix = if mode == IndexMode::IX { 0xDD } else { 0xFD };
        let op = self.fetch_byte(bus);
        self.bump_r();
        let y = (op >> 3) & 0x07;
        let z = op & 0x07;
        match op {
            0x21 => {
                let value = self.fetch_word(bus);
                self.set_index(mode, value);
            }
            0x22 => {
                let address = self.fetch_word(bus);
                Self::write_word(bus, address, self.index(mode));
            }
            0x2A => {
                let address = self.fetch_word(bus);
                let value = Self::read_word(bus, address);
                self.set_index(mode, value);
            }
            0x23 => self.set_index(mode, self.index(mode).wrapping_add(1)),
            0x2B => self.set_index(mode, self.index(mode).wrapping_sub(1)),
            0x09 | 0x19 | 0x29 | 0x39 => {
                let right = if op == 0x29 { self.index(mode) } else { self.regs.get(RP[usize::from(y >> 1)]) };
                let value = self.add16(self.index(mode), right);
                self.set_index(mode, value);
            }
            0x36 => {
                let address = self.displaced(bus, mode);
                let value = self.fetch_byte(bus);
                bus.write(address, value);
            }
            0x34 | 0x35 => {
                let address = self.displaced(bus, mode);
                let value = bus.read(address);
                let result = if op == 0x34 { self.inc8(value) } else { self.dec8(value) };
                bus.write(address, result);
            }
            _ if op & 0xC7 == 0x46 && y != 6 => {
                let address = self.displaced(bus, mode);
                let value = bus.read(address);
                self.regs.set(R8[usize::from(y)], u16::from(value));
            }
            0x70..=0x77 if z != 6 => {
                let address = self.displaced(bus, mode);
                let value = self.regs.get(R8[usize::from(z)]) as u8;
                bus.write(address, value);
            }
            _ if op & 0xC7 == 0x86 => {
                let address = self.displaced(bus, mode);
                let value = bus.read(address);
                self.alu(y, value);
            }
            0xE1 => {
                let value = self.pop(bus);
                self.set_index(mode, value);
            }
            0xE5 => {
                let value = self.index(mode);
                self.push(bus, value);
            }
            0xE9 => self.regs.pc = self.index(mode),
            0xF9 => self.regs.sp = self.index(mode),
            _ => return Err(self.unsupported(pc, &[prefix, op])),
        }
        Ok(())
    }
}
