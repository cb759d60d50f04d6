//! Decoder for the ASCII register status line.
//!
//! A status line is a run of whitespace separated `KEY=HEX` tokens, e.g.
//! `PC=80cf SP=83f3 ... AF'=0044 ... I=3f R=4b IM1 ... MMU=80000005...`.
//! The token order is fixed for a session, so the offset of each value is
//! located once and reused for every later line.

use super::RegisterSet;
use crate::memory::{MemoryModel, SlotLayout};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The key is not part of the line grammar. Indicates a backend/version mismatch.
    #[error("Register '{0}' not found in status line. The emulator version is probably not supported.")]
    MissingRegister(&'static str),
    #[error("Invalid value for '{field}': '{text}'")]
    InvalidValue { field: &'static str, text: String },
}

/// Fields of the status line whose offsets are memoized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusField {
    Pc,
    Sp,
    Af,
    Bc,
    De,
    Hl,
    Ix,
    Iy,
    Af2,
    Bc2,
    De2,
    Hl2,
    I,
    R,
    Im,
    Mmu,
}

const FIELD_COUNT: usize = 16;

impl StatusField {
    fn key(self) -> &'static str {
        match self {
            Self::Pc => "PC=",
            Self::Sp => "SP=",
            Self::Af => "AF=",
            Self::Bc => "BC=",
            Self::De => "DE=",
            Self::Hl => "HL=",
            Self::Ix => "IX=",
            Self::Iy => "IY=",
            Self::Af2 => "AF'=",
            Self::Bc2 => "BC'=",
            Self::De2 => "DE'=",
            Self::Hl2 => "HL'=",
            Self::I => "I=",
            Self::R => "R=",
            Self::Im => "IM",
            Self::Mmu => "MMU=",
        }
    }

    fn name(self) -> &'static str {
        self.key().trim_end_matches('=')
    }
}

/// Locate the start of the value for `field`. Keys only match at the start of
/// a token, so `R=` never matches inside `MEMPTR=`.
fn locate(line: &str, field: StatusField) -> Option<usize> {
    let key = field.key();
    let bytes = line.as_bytes();
    line.match_indices(key).map(|(idx, _)| idx).find(|&idx| {
        let token_start = idx == 0 || bytes[idx - 1].is_ascii_whitespace();
        let value_start = idx + key.len();
        match field {
            StatusField::Im => token_start && bytes.get(value_start).is_some_and(u8::is_ascii_digit),
            _ => token_start,
        }
    }).map(|idx| idx + key.len())
}

/// Parses status lines into `RegisterSet`s for one fixed line grammar.
///
/// A decoder must not be reused after the backend's line grammar changes
/// (for example when the memory model switches); construct a new one.
#[derive(Debug)]
pub struct RegisterLineDecoder {
    layout: SlotLayout,
    offsets: [Option<usize>; FIELD_COUNT],
}

impl RegisterLineDecoder {
    pub fn new(model: MemoryModel) -> Self {
        Self { layout: model.slot_layout(), offsets: [None; FIELD_COUNT] }
    }

    pub fn slot_layout(&self) -> SlotLayout {
        self.layout
    }

    /// Offset of the value for `field`, if it has been located already.
    pub fn cached_offset(&self, field: StatusField) -> Option<usize> {
        self.offsets[field as usize]
    }

    fn offset(&mut self, field: StatusField, line: &str) -> Result<usize, DecodeError> {
        if let Some(offset) = self.offsets[field as usize] {
            return Ok(offset);
        }
        let offset = locate(line, field).ok_or(DecodeError::MissingRegister(field.name()))?;
        log::debug!("Status field {} located at offset {offset}", field.name());
        self.offsets[field as usize] = Some(offset);
        Ok(offset)
    }

    fn slice<'a>(
        &mut self,
        field: StatusField,
        line: &'a str,
        len: usize,
    ) -> Result<&'a str, DecodeError> {
        let offset = self.offset(field, line)?;
        line.get(offset..offset + len).ok_or_else(|| DecodeError::InvalidValue {
            field: field.name(),
            text: line.get(offset..).unwrap_or_default().to_string(),
        })
    }

    fn parse_hex(&mut self, field: StatusField, line: &str, len: usize) -> Result<u16, DecodeError> {
        let text = self.slice(field, line, len)?;
        u16::from_str_radix(text, 16)
            .map_err(|_| DecodeError::InvalidValue { field: field.name(), text: text.to_string() })
    }

    fn parse_word(&mut self, field: StatusField, line: &str) -> Result<u16, DecodeError> {
        self.parse_hex(field, line, 4)
    }

    fn parse_byte(&mut self, field: StatusField, line: &str) -> Result<u8, DecodeError> {
        self.parse_hex(field, line, 2).map(|v| v as u8)
    }

    pub fn parse_pc(&mut self, line: &str) -> Result<u16, DecodeError> {
        self.parse_word(StatusField::Pc, line)
    }

    pub fn parse_sp(&mut self, line: &str) -> Result<u16, DecodeError> {
        self.parse_word(StatusField::Sp, line)
    }

    pub fn parse_af(&mut self, line: &str) -> Result<u16, DecodeError> {
        self.parse_word(StatusField::Af, line)
    }

    pub fn parse_bc(&mut self, line: &str) -> Result<u16, DecodeError> {
        self.parse_word(StatusField::Bc, line)
    }

    pub fn parse_de(&mut self, line: &str) -> Result<u16, DecodeError> {
        self.parse_word(StatusField::De, line)
    }

    pub fn parse_hl(&mut self, line: &str) -> Result<u16, DecodeError> {
        self.parse_word(StatusField::Hl, line)
    }

    pub fn parse_ix(&mut self, line: &str) -> Result<u16, DecodeError> {
        self.parse_word(StatusField::Ix, line)
    }

    pub fn parse_iy(&mut self, line: &str) -> Result<u16, DecodeError> {
        self.parse_word(StatusField::Iy, line)
    }

    pub fn parse_af2(&mut self, line: &str) -> Result<u16, DecodeError> {
        self.parse_word(StatusField::Af2, line)
    }

    pub fn parse_bc2(&mut self, line: &str) -> Result<u16, DecodeError> {
        self.parse_word(StatusField::Bc2, line)
    }

    pub fn parse_de2(&mut self, line: &str) -> Result<u16, DecodeError> {
        self.parse_word(StatusField::De2, line)
    }

    pub fn parse_hl2(&mut self, line: &str) -> Result<u16, DecodeError> {
        self.parse_word(StatusField::Hl2, line)
    }

    pub fn parse_i(&mut self, line: &str) -> Result<u8, DecodeError> {
        self.parse_byte(StatusField::I, line)
    }

    pub fn parse_r(&mut self, line: &str) -> Result<u8, DecodeError> {
        self.parse_byte(StatusField::R, line)
    }

    /// Interrupt mode, the single decimal digit following `IM`.
    pub fn parse_im(&mut self, line: &str) -> Result<u8, DecodeError> {
        let text = self.slice(StatusField::Im, line, 1)?;
        match text.as_bytes()[0] {
            digit @ b'0'..=b'2' => Ok(digit - b'0'),
            _ => Err(DecodeError::InvalidValue { field: "IM", text: text.to_string() }),
        }
    }

    /// Slot/bank vector, interpreted according to the memory model chosen at construction.
    pub fn parse_slots(&mut self, line: &str) -> Result<Vec<u8>, DecodeError> {
        match self.layout {
            SlotLayout::Unknown => Ok(vec![0]),
            SlotLayout::Fixed2 => Ok(vec![0, 1]),
            SlotLayout::Fixed3 => Ok(vec![0, 1, 2]),
            SlotLayout::Banked { slots, rom_base } => {
                let text = self.slice(StatusField::Mmu, line, slots * 4)?;
                decode_mmu(text, rom_base)
            }
        }
    }

    /// Decode a complete register set. Either every field decodes or nothing is returned.
    pub fn decode(&mut self, line: &str) -> Result<RegisterSet, DecodeError> {
        Ok(RegisterSet {
            pc: self.parse_pc(line)?,
            sp: self.parse_sp(line)?,
            af: self.parse_af(line)?,
            bc: self.parse_bc(line)?,
            de: self.parse_de(line)?,
            hl: self.parse_hl(line)?,
            ix: self.parse_ix(line)?,
            iy: self.parse_iy(line)?,
            af2: self.parse_af2(line)?,
            bc2: self.parse_bc2(line)?,
            de2: self.parse_de2(line)?,
            hl2: self.parse_hl2(line)?,
            i: self.parse_i(line)?,
            r: self.parse_r(line)?,
            im: self.parse_im(line)?,
            slots: self.parse_slots(line)?,
        })
    }
}

/// Each slot is four hex digits. Bit 15 marks a ROM page, the low byte is the page number.
fn decode_mmu(text: &str, rom_base: u8) -> Result<Vec<u8>, DecodeError> {
    text.as_bytes()
        .chunks(4)
        .map(|chunk| {
            let digits = std::str::from_utf8(chunk).unwrap_or_default();
            let value = u16::from_str_radix(digits, 16).map_err(|_| DecodeError::InvalidValue {
                field: "MMU",
                text: digits.to_string(),
            })?;
            let page = (value & 0xFF) as u8;
            Ok(if value & 0x8000 != 0 { rom_base.wrapping_add(page) } else { page })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE_48K: &str = "PC=80cf SP=83f3 AF=005c BC=0000 HL=1234 DE=0006 IX=ffff IY=5c3a \
        AF'=0044 BC'=174b HL'=107f DE'=0007 I=3f R=4b  F=-Z-H3P-- F'=-Z---P-- MEMPTR=0000 IM1 IFF-- VPS: 0 ";

    const LINE_128K: &str = "PC=c000 SP=ff00 AF=0000 BC=0000 HL=0000 DE=0000 IX=0000 IY=0000 \
        AF'=0000 BC'=0000 HL'=0000 DE'=0000 I=00 R=00  F=-------- F'=-------- MEMPTR=0000 IM2 IFF12 VPS: 0 MMU=8001000500020007";

    #[test]
    fn test_decode_complete_set() {
        let mut decoder = RegisterLineDecoder::new(MemoryModel::Zx48k);
        let regs = decoder.decode(LINE_48K).unwrap();
        assert_eq!(regs.pc, 0x80CF);
        assert_eq!(regs.sp, 0x83F3);
        assert_eq!(regs.af, 0x005C);
        assert_eq!(regs.hl, 0x1234);
        assert_eq!(regs.de, 0x0006);
        assert_eq!(regs.af2, 0x0044);
        assert_eq!(regs.bc2, 0x174B);
        assert_eq!(regs.hl2, 0x107F);
        assert_eq!(regs.de2, 0x0007);
        assert_eq!(regs.i, 0x3F);
        assert_eq!(regs.r, 0x4B);
        assert_eq!(regs.im, 1);
        assert_eq!(regs.slots, vec![0, 1]);
    }

    #[test]
    fn test_field_is_stable_and_offset_cached() {
        let mut decoder = RegisterLineDecoder::new(MemoryModel::Unknown);
        assert_eq!(decoder.cached_offset(StatusField::Sp), None);
        let first = decoder.parse_sp(LINE_48K).unwrap();
        let offset = decoder.cached_offset(StatusField::Sp).unwrap();
        assert_eq!(offset, 11);
        let second = decoder.parse_sp(LINE_48K).unwrap();
        assert_eq!(first, second);
        assert_eq!(decoder.cached_offset(StatusField::Sp), Some(offset));
    }

    #[test]
    fn test_cached_offset_is_not_recomputed() {
        let mut decoder = RegisterLineDecoder::new(MemoryModel::Unknown);
        assert_eq!(decoder.parse_pc("PC=1234 SP=0000").unwrap(), 0x1234);
        // Same offset is sliced even though the key moved.
        assert_eq!(decoder.parse_pc("SP=1234 PC=5678").unwrap(), 0x1234);
    }

    #[test]
    fn test_r_does_not_match_inside_other_keys() {
        let mut decoder = RegisterLineDecoder::new(MemoryModel::Unknown);
        assert_eq!(decoder.parse_r("MEMPTR=0000 R=4b").unwrap(), 0x4B);
        assert_eq!(decoder.parse_af("AF'=1243 AF=0102").unwrap(), 0x0102);
        assert_eq!(decoder.parse_af2("AF'=1243 AF=0102").unwrap(), 0x1243);
    }

    #[test]
    fn test_missing_key_is_fatal() {
        let mut decoder = RegisterLineDecoder::new(MemoryModel::Zx48k);
        let err = decoder.decode("PC=0000 SP=0000").unwrap_err();
        assert_eq!(err, DecodeError::MissingRegister("AF"));
        assert!(err.to_string().contains("not found"));
        assert_eq!(decoder.parse_im("PC=0000 IMX").unwrap_err(), DecodeError::MissingRegister("IM"));
    }

    #[test]
    fn test_invalid_hex_is_reported() {
        let mut decoder = RegisterLineDecoder::new(MemoryModel::Unknown);
        let err = decoder.parse_pc("PC=zz00").unwrap_err();
        assert!(matches!(err, DecodeError::InvalidValue { field: "PC", .. }));
        let err = decoder.parse_sp("SP=12").unwrap_err();
        assert!(matches!(err, DecodeError::InvalidValue { field: "SP", .. }));
    }

    #[test]
    fn test_slot_variants() {
        let mut unknown = RegisterLineDecoder::new(MemoryModel::Unknown);
        assert_eq!(unknown.parse_slots(LINE_128K).unwrap(), vec![0]);

        let mut fixed2 = RegisterLineDecoder::new(MemoryModel::Zx48k);
        assert_eq!(fixed2.parse_slots(LINE_128K).unwrap(), vec![0, 1]);

        let mut fixed3 = RegisterLineDecoder::new(MemoryModel::Zx16k);
        assert_eq!(fixed3.parse_slots(LINE_128K).unwrap(), vec![0, 1, 2]);

        let mut banked = RegisterLineDecoder::new(MemoryModel::Zx128k);
        assert_eq!(banked.parse_slots(LINE_128K).unwrap(), vec![9, 5, 2, 7]);
        assert_eq!(banked.decode(LINE_128K).unwrap().im, 2);
    }

    #[test]
    fn test_banked_model_requires_mmu() {
        let mut banked = RegisterLineDecoder::new(MemoryModel::ZxNext);
        assert_eq!(banked.parse_slots(LINE_48K).unwrap_err(), DecodeError::MissingRegister("MMU"));
    }

    #[test]
    fn test_next_rom_pages() {
        let mut banked = RegisterLineDecoder::new(MemoryModel::ZxNext);
        let line = "MMU=80008001000a000b0004000500000001";
        assert_eq!(banked.parse_slots(line).unwrap(), vec![0xFC, 0xFD, 10, 11, 4, 5, 0, 1]);
    }
}
