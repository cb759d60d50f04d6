//! Target description handling.

use super::{decode_le16, GdbError};
use crate::registers::{RegisterSet, Z80Register};

/// One register as announced by the target description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GdbRegister {
    pub name: String,
    pub bitsize: u16,
    pub regnum: usize,
}

/// Registers of the target, ordered by register number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterLayout {
    regs: Vec<GdbRegister>,
}

const REQUIRED: [Z80Register; 12] = [
    Z80Register::PC,
    Z80Register::SP,
    Z80Register::AF,
    Z80Register::BC,
    Z80Register::DE,
    Z80Register::HL,
    Z80Register::IX,
    Z80Register::IY,
    Z80Register::AF2,
    Z80Register::BC2,
    Z80Register::DE2,
    Z80Register::HL2,
];

impl RegisterLayout {
    pub fn new(mut regs: Vec<GdbRegister>) -> Self {
        regs.sort_by_key(|r| r.regnum);
        Self { regs }
    }

    /// The register order of MAME's Z80 stub.
    pub fn mame_default() -> Self {
        let names = ["af", "bc", "de", "hl", "af'", "bc'", "de'", "hl'", "ix", "iy", "sp", "pc"];
        Self::new(
            names
                .iter()
                .enumerate()
                .map(|(regnum, name)| GdbRegister { name: (*name).to_string(), bitsize: 16, regnum })
                .collect(),
        )
    }

    pub fn registers(&self) -> &[GdbRegister] {
        &self.regs
    }

    pub fn by_number(&self, regnum: usize) -> Option<&GdbRegister> {
        self.regs.iter().find(|r| r.regnum == regnum)
    }

    pub fn find(&self, reg: Z80Register) -> Option<&GdbRegister> {
        self.regs.iter().find(|r| r.name.parse::<Z80Register>().ok() == Some(reg))
    }

    pub fn pc_regnum(&self) -> Option<usize> {
        self.find(Z80Register::PC).map(|r| r.regnum)
    }

    /// Decode the reply to a `g` packet. Values are little-endian.
    pub fn decode_registers(&self, reply: &str) -> Result<RegisterSet, GdbError> {
        let mut regs = RegisterSet { slots: vec![0], ..Default::default() };
        let mut offset = 0;
        for gdb_reg in &self.regs {
            let len = usize::from(gdb_reg.bitsize / 4);
            let text = reply.get(offset..offset + len).ok_or_else(|| {
                GdbError::MalformedPacket(format!("register block too short for '{}'", gdb_reg.name))
            })?;
            offset += len;
            let Ok(reg) = gdb_reg.name.parse::<Z80Register>() else {
                continue;
            };
            let value = if text.starts_with('x') {
                0
            } else {
                decode_le16(text).ok_or_else(|| {
                    GdbError::MalformedPacket(format!("invalid value '{text}' for '{}'", gdb_reg.name))
                })?
            };
            regs.set(reg, value);
        }
        if let Some(missing) = REQUIRED.iter().find(|reg| self.find(**reg).is_none()) {
            return Err(GdbError::MissingRegister(missing.name().to_string()));
        }
        Ok(regs)
    }
}

impl Default for RegisterLayout {
    fn default() -> Self {
        Self::mame_default()
    }
}

/// Validate a target description and extract the register layout.
///
/// The architecture must be `z80`. Without `<reg>` elements the MAME
/// register order is assumed.
pub fn parse_xml(xml: &str) -> Result<RegisterLayout, GdbError> {
    // MAME's description starts with a DOCTYPE referring to gdb-target.dtd.
    let options = roxmltree::ParsingOptions { allow_dtd: true, ..Default::default() };
    let doc = roxmltree::Document::parse_with_options(xml, options).map_err(|e| GdbError::InvalidXml(e.to_string()))?;

    let arch = doc
        .descendants()
        .find(|n| n.has_tag_name("architecture"))
        .ok_or(GdbError::NoArchitecture)?;
    let value = arch.text().unwrap_or_default().trim();
    if value != "z80" {
        return Err(GdbError::WrongArchitecture(value.to_string()));
    }

    let mut regs = Vec::new();
    let mut next_regnum = 0;
    for node in doc.descendants().filter(|n| n.has_tag_name("reg")) {
        let name = node
            .attribute("name")
            .ok_or_else(|| GdbError::InvalidXml("<reg> without a name".to_string()))?;
        let bitsize = node.attribute("bitsize").and_then(|s| s.parse().ok()).unwrap_or(16);
        let regnum = node.attribute("regnum").and_then(|s| s.parse().ok()).unwrap_or(next_regnum);
        next_regnum = regnum + 1;
        regs.push(GdbRegister { name: name.to_string(), bitsize, regnum });
    }

    if regs.is_empty() {
        log::debug!("Target description has no registers, using the MAME layout");
        return Ok(RegisterLayout::mame_default());
    }
    Ok(RegisterLayout::new(regs))
}
