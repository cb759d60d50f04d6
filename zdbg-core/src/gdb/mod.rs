//! GDB Remote Serial Protocol codec.
//!
//! Packet framing and checksums, target description validation and stop
//! reply parsing for GDB stubs such as MAME's.

pub mod packet;
pub mod stop_reply;
pub mod target;

pub use packet::{checksum, frame, read_packet, BREAK_SIGNAL};
pub use stop_reply::parse_stop_reply;
pub use target::{parse_xml, GdbRegister, RegisterLayout};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GdbError {
    #[error("No architecture found in the target description.")]
    NoArchitecture,
    #[error("Architecture '{0}' is not supported. Please select a Z80 driver/ROM.")]
    WrongArchitecture(String),
    #[error("Invalid target description: {0}")]
    InvalidXml(String),
    #[error("No break address found.")]
    NoBreakAddress,
    #[error("Malformed stop reply: '{0}'")]
    MalformedStopReply(String),
    #[error("Checksum mismatch: expected {expected}, received {received}")]
    ChecksumMismatch { expected: String, received: String },
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),
    #[error("Register '{0}' missing from the register layout")]
    MissingRegister(String),
}

/// Decode a little-endian hex value of one or two bytes, e.g. `"FE12"` is `0x12FE`.
pub fn decode_le16(text: &str) -> Option<u16> {
    let bytes = hex::decode(text).ok()?;
    match bytes.as_slice() {
        [low] => Some(u16::from(*low)),
        [low, high] => Some(u16::from_le_bytes([*low, *high])),
        _ => None,
    }
}

/// Encode a value as little-endian hex of `bytes` bytes.
pub fn encode_le(value: u16, bytes: usize) -> String {
    hex::encode(&value.to_le_bytes()[..bytes.clamp(1, 2)])
}
