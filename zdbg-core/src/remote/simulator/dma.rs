//! zxnDMA controller.
//!
//! The controller is configured through a single write port. Each byte is
//! interpreted according to the position inside the current command
//! sequence: the first byte selects a write register (WR0-WR6) and tells which
//! follow-up bytes to expect, the follow-up bytes fill in the fields.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DmaError {
    #[error("DMA command 0x{0:02X} is not implemented")]
    NotImplemented(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferDirection {
    AToB,
    BToA,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PortMedium {
    Memory,
    Io,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AddressStepping {
    Decrement,
    Increment,
    Fixed,
}

impl AddressStepping {
    fn apply(self, address: u16) -> u16 {
        match self {
            Self::Decrement => address.wrapping_sub(1),
            Self::Increment => address.wrapping_add(1),
            Self::Fixed => address,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferMode {
    Continuous,
    Burst,
}

/// Cycle length after reset or a port timing reset.
pub const DEFAULT_CYCLE_LENGTH: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortConfig {
    pub medium: PortMedium,
    pub stepping: AddressStepping,
    pub cycle_length: u8,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            medium: PortMedium::Memory,
            stepping: AddressStepping::Increment,
            cycle_length: DEFAULT_CYCLE_LENGTH,
        }
    }
}

/// The programmable state of the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DmaRegisterFile {
    pub direction: TransferDirection,
    pub port_a_start: u16,
    pub port_b_start: u16,
    pub block_length: u16,
    pub port_a: PortConfig,
    pub port_b: PortConfig,
    pub prescalar: u8,
    pub mode: TransferMode,
    pub auto_restart: bool,
    pub read_mask: u8,
    pub enabled: bool,
}

impl Default for DmaRegisterFile {
    fn default() -> Self {
        Self {
            direction: TransferDirection::AToB,
            port_a_start: 0,
            port_b_start: 0,
            block_length: 0,
            port_a: PortConfig::default(),
            port_b: PortConfig::default(),
            prescalar: 0,
            mode: TransferMode::Continuous,
            auto_restart: false,
            read_mask: 0x7F,
            enabled: false,
        }
    }
}

/// Which write register the current sequence belongs to.
///
/// WR3 and WR5 are complete in their dispatch byte and never hold a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SequenceRegister {
    AwaitingDispatch,
    Wr0,
    Wr1,
    Wr2,
    Wr4,
    Wr6,
}

/// Position inside a multi-byte write sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DecodeSequenceState {
    pub register: SequenceRegister,
    /// Follow-up bytes still expected, one bit per role.
    pub mask: u8,
}

impl DecodeSequenceState {
    const fn idle() -> Self {
        Self { register: SequenceRegister::AwaitingDispatch, mask: 0 }
    }

    pub fn is_awaiting_dispatch(&self) -> bool {
        self.register == SequenceRegister::AwaitingDispatch
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    PortAStartLow,
    PortAStartHigh,
    BlockLengthLow,
    BlockLengthHigh,
    PortATiming,
    PortBTiming,
    Prescalar,
    PortBStartLow,
    PortBStartHigh,
    ReadMask,
}

// Follow-up roles per register, in the order the bytes arrive.
const WR0_ROLES: &[(u8, Role)] = &[
    (0x08, Role::PortAStartLow),
    (0x10, Role::PortAStartHigh),
    (0x20, Role::BlockLengthLow),
    (0x40, Role::BlockLengthHigh),
];
const WR1_ROLES: &[(u8, Role)] = &[(0x40, Role::PortATiming)];
const WR2_ROLES: &[(u8, Role)] = &[(0x40, Role::PortBTiming), (0x20, Role::Prescalar)];
const WR4_ROLES: &[(u8, Role)] = &[(0x04, Role::PortBStartLow), (0x08, Role::PortBStartHigh)];
const WR6_ROLES: &[(u8, Role)] = &[(0x01, Role::ReadMask)];

/// WR6 command bytes.
pub mod command {
    pub const RESET: u8 = 0xC3;
    pub const RESET_PORT_A_TIMING: u8 = 0xC7;
    pub const RESET_PORT_B_TIMING: u8 = 0xCB;
    pub const READ_STATUS_BYTE: u8 = 0xBF;
    pub const REINITIALIZE_STATUS_BYTE: u8 = 0x8B;
    pub const INITIALIZE_READ_SEQUENCE: u8 = 0xA7;
    pub const LOAD: u8 = 0xCF;
    pub const CONTINUE: u8 = 0xD3;
    pub const ENABLE_DMA: u8 = 0x87;
    pub const DISABLE_DMA: u8 = 0x83;
    pub const READ_MASK_FOLLOWS: u8 = 0xBB;
}

/// Result of a port write that the machine has to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaAction {
    None,
    /// The DMA was enabled, run the transfer.
    Transfer,
}

/// Memory and I/O access used to perform transfers.
pub trait DmaBus {
    fn dma_read_memory(&mut self, address: u16) -> u8;
    fn dma_write_memory(&mut self, address: u16, value: u8);
    fn dma_read_port(&mut self, port: u16) -> u8;
    fn dma_write_port(&mut self, port: u16, value: u8);
}

fn set_low(word: &mut u16, value: u8) {
    *word = (*word & 0xFF00) | u16::from(value);
}

fn set_high(word: &mut u16, value: u8) {
    *word = (*word & 0x00FF) | (u16::from(value) << 8);
}

fn port_config(byte: u8, previous: PortConfig) -> PortConfig {
    let stepping = if byte & 0x20 != 0 {
        AddressStepping::Fixed
    } else if byte & 0x10 != 0 {
        AddressStepping::Increment
    } else {
        AddressStepping::Decrement
    };
    let medium = if byte & 0x08 != 0 { PortMedium::Io } else { PortMedium::Memory };
    PortConfig { medium, stepping, cycle_length: previous.cycle_length }
}

fn cycle_length(byte: u8, previous: u8) -> u8 {
    match byte & 0x03 {
        0b00 => 4,
        0b01 => 3,
        0b10 => 2,
        _ => previous,
    }
}

/// The simulated DMA controller.
///
/// Driven synchronously by the CPU loop; it is the only mutator.
#[derive(Debug, Clone, Default)]
pub struct ZxnDma {
    regs: DmaRegisterFile,
    state: DecodeSequenceState,
    source: u16,
    destination: u16,
    transferred: u16,
    end_of_block: bool,
}

impl Default for DecodeSequenceState {
    fn default() -> Self {
        Self::idle()
    }
}

impl ZxnDma {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registers(&self) -> &DmaRegisterFile {
        &self.regs
    }

    pub fn state(&self) -> DecodeSequenceState {
        self.state
    }

    /// Bytes moved by the last transfer.
    pub fn transferred(&self) -> u16 {
        self.transferred
    }

    /// Status byte: bit 5 clear once the end of a block was reached, bit 0
    /// set once a byte has been transferred.
    pub fn status(&self) -> u8 {
        let mut status = 0b0001_1010;
        if !self.end_of_block {
            status |= 0x20;
        }
        if self.transferred > 0 {
            status |= 0x01;
        }
        status
    }

    /// Consume one byte written to the control port.
    pub fn write(&mut self, value: u8) -> Result<DmaAction, DmaError> {
        match self.state.register {
            SequenceRegister::AwaitingDispatch => self.dispatch(value),
            SequenceRegister::Wr0 => self.follow_up(WR0_ROLES, value),
            SequenceRegister::Wr1 => self.follow_up(WR1_ROLES, value),
            SequenceRegister::Wr2 => self.follow_up(WR2_ROLES, value),
            SequenceRegister::Wr4 => self.follow_up(WR4_ROLES, value),
            SequenceRegister::Wr6 => self.follow_up(WR6_ROLES, value),
        }
    }

    fn begin(&mut self, register: SequenceRegister, mask: u8) {
        self.state = if mask == 0 {
            DecodeSequenceState::idle()
        } else {
            DecodeSequenceState { register, mask }
        };
    }

    fn dispatch(&mut self, value: u8) -> Result<DmaAction, DmaError> {
        if value & 0x80 != 0 {
            match value & 0x03 {
                0b00 => Ok(self.write_wr3(value)),
                0b01 => {
                    self.write_wr4(value);
                    Ok(DmaAction::None)
                }
                0b10 => {
                    self.write_wr5(value);
                    Ok(DmaAction::None)
                }
                _ => self.write_wr6(value),
            }
        } else if value & 0x03 == 0 {
            if value & 0x04 != 0 {
                self.regs.port_a = port_config(value, self.regs.port_a);
                self.begin(SequenceRegister::Wr1, value & 0x40);
            } else {
                self.regs.port_b = port_config(value, self.regs.port_b);
                self.begin(SequenceRegister::Wr2, value & 0x40);
            }
            Ok(DmaAction::None)
        } else {
            self.regs.direction =
                if value & 0x04 != 0 { TransferDirection::AToB } else { TransferDirection::BToA };
            self.begin(SequenceRegister::Wr0, value & 0x78);
            Ok(DmaAction::None)
        }
    }

    fn write_wr3(&mut self, value: u8) -> DmaAction {
        self.state = DecodeSequenceState::idle();
        self.regs.enabled = value & 0x40 != 0;
        if self.regs.enabled {
            DmaAction::Transfer
        } else {
            DmaAction::None
        }
    }

    fn write_wr4(&mut self, value: u8) {
        match (value >> 5) & 0x03 {
            0b00 | 0b01 => self.regs.mode = TransferMode::Continuous,
            0b10 => self.regs.mode = TransferMode::Burst,
            _ => log::debug!("DMA: reserved transfer mode ignored"),
        }
        // Bit 4 (interrupt control follows) is unsupported, its byte aborts the sequence.
        self.begin(SequenceRegister::Wr4, value & 0x1C);
    }

    fn write_wr5(&mut self, value: u8) {
        self.state = DecodeSequenceState::idle();
        self.regs.auto_restart = value & 0x20 != 0;
    }

    fn write_wr6(&mut self, value: u8) -> Result<DmaAction, DmaError> {
        self.state = DecodeSequenceState::idle();
        match value {
            command::RESET => {
                self.regs.port_a.cycle_length = DEFAULT_CYCLE_LENGTH;
                self.regs.port_b.cycle_length = DEFAULT_CYCLE_LENGTH;
                self.regs.prescalar = 0;
                self.regs.auto_restart = false;
                self.regs.read_mask = 0x7F;
                self.regs.enabled = false;
                self.end_of_block = false;
            }
            command::RESET_PORT_A_TIMING => self.regs.port_a.cycle_length = DEFAULT_CYCLE_LENGTH,
            command::RESET_PORT_B_TIMING => self.regs.port_b.cycle_length = DEFAULT_CYCLE_LENGTH,
            command::LOAD => self.load(),
            command::CONTINUE => {
                self.transferred = 0;
                self.end_of_block = false;
            }
            command::ENABLE_DMA => {
                self.regs.enabled = true;
                return Ok(DmaAction::Transfer);
            }
            command::DISABLE_DMA => self.regs.enabled = false,
            command::READ_MASK_FOLLOWS => self.begin(SequenceRegister::Wr6, 0x01),
            command::READ_STATUS_BYTE
            | command::REINITIALIZE_STATUS_BYTE
            | command::INITIALIZE_READ_SEQUENCE => return Err(DmaError::NotImplemented(value)),
            other => return Err(DmaError::NotImplemented(other)),
        }
        Ok(DmaAction::None)
    }

    fn follow_up(&mut self, roles: &[(u8, Role)], value: u8) -> Result<DmaAction, DmaError> {
        let Some(&(bit, role)) = roles.iter().find(|(bit, _)| self.state.mask & bit != 0) else {
            log::debug!("DMA: unexpected byte 0x{value:02X}, sequence aborted");
            self.state = DecodeSequenceState::idle();
            return Ok(DmaAction::None);
        };
        self.state.mask &= !bit;

        match role {
            Role::PortAStartLow => set_low(&mut self.regs.port_a_start, value),
            Role::PortAStartHigh => set_high(&mut self.regs.port_a_start, value),
            Role::BlockLengthLow => set_low(&mut self.regs.block_length, value),
            Role::BlockLengthHigh => set_high(&mut self.regs.block_length, value),
            Role::PortATiming => {
                self.regs.port_a.cycle_length = cycle_length(value, self.regs.port_a.cycle_length);
            }
            Role::PortBTiming => {
                self.regs.port_b.cycle_length = cycle_length(value, self.regs.port_b.cycle_length);
                self.state.mask |= value & 0x20;
            }
            Role::Prescalar => self.regs.prescalar = value,
            Role::PortBStartLow => set_low(&mut self.regs.port_b_start, value),
            Role::PortBStartHigh => set_high(&mut self.regs.port_b_start, value),
            Role::ReadMask => self.regs.read_mask = value & 0x7F,
        }

        if self.state.mask == 0 {
            self.state = DecodeSequenceState::idle();
        }
        Ok(DmaAction::None)
    }

    fn load(&mut self) {
        let (source, destination) = match self.regs.direction {
            TransferDirection::AToB => (self.regs.port_a_start, self.regs.port_b_start),
            TransferDirection::BToA => (self.regs.port_b_start, self.regs.port_a_start),
        };
        self.source = source;
        self.destination = destination;
        self.transferred = 0;
        self.end_of_block = false;
    }

    /// Move one block. With auto-restart the address counters are reloaded
    /// and the controller stays enabled, otherwise it disables itself.
    pub fn transfer(&mut self, bus: &mut impl DmaBus) {
        if !self.regs.enabled {
            return;
        }
        let (src_port, dst_port) = match self.regs.direction {
            TransferDirection::AToB => (self.regs.port_a, self.regs.port_b),
            TransferDirection::BToA => (self.regs.port_b, self.regs.port_a),
        };
        log::debug!(
            "DMA: {} bytes from 0x{:04X} to 0x{:04X} ({:?})",
            self.regs.block_length,
            self.source,
            self.destination,
            self.regs.mode
        );
        self.transferred = 0;
        while self.transferred < self.regs.block_length {
            let value = match src_port.medium {
                PortMedium::Memory => bus.dma_read_memory(self.source),
                PortMedium::Io => bus.dma_read_port(self.source),
            };
            match dst_port.medium {
                PortMedium::Memory => bus.dma_write_memory(self.destination, value),
                PortMedium::Io => bus.dma_write_port(self.destination, value),
            }
            self.source = src_port.stepping.apply(self.source);
            self.destination = dst_port.stepping.apply(self.destination);
            self.transferred += 1;
        }
        self.end_of_block = true;
        if self.regs.auto_restart {
            self.load();
        } else {
            self.regs.enabled = false;
        }
    }
}
