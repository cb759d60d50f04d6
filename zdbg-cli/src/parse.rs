//! Parsing of numbers, addresses and byte strings given on the command line.
//!
//! Numbers are hexadecimal, with an optional `0x`, `$` or `h` decoration.

use anyhow::{bail, Context as _, Result};
use zdbg_core::{LongAddress, WatchKind, Watchpoint};

pub fn parse_hex(s: &str) -> Result<u16> {
    let trimmed = s.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .or_else(|| trimmed.strip_prefix('$'))
        .or_else(|| trimmed.strip_suffix(['h', 'H']))
        .unwrap_or(trimmed);
    u16::from_str_radix(digits, 16).with_context(|| format!("Invalid hex number '{s}'"))
}

/// `ADDR` or `ADDR@BANK` for an address in a specific bank.
pub fn parse_address(s: &str) -> Result<LongAddress> {
    match s.split_once('@') {
        Some((address, bank)) => {
            let bank: u8 = bank.parse().with_context(|| format!("Invalid bank in '{s}'"))?;
            Ok(LongAddress::banked(parse_hex(address)?, bank))
        }
        None => Ok(LongAddress::plain(parse_hex(s)?)),
    }
}

pub fn parse_hex_bytes(s: &str) -> Result<Vec<u8>> {
    let s = s.trim_start_matches("0x");
    hex::decode(s).with_context(|| format!("Invalid hex data '{s}'"))
}

/// `ADDR[:LEN]`, the length defaulting to one byte.
pub fn parse_watch(s: &str, kind: WatchKind) -> Result<Watchpoint> {
    let (address, size) = match s.split_once(':') {
        Some((address, size)) => (parse_hex(address)?, parse_hex(size)?),
        None => (parse_hex(s)?, 1),
    };
    if size == 0 {
        bail!("Watchpoint size must not be zero");
    }
    Ok(Watchpoint::new(address, size, kind))
}

pub fn parse_watch_kind(s: &str) -> Result<WatchKind> {
    match s {
        "read" | "r" => Ok(WatchKind::Read),
        "write" | "w" => Ok(WatchKind::Write),
        "access" | "rw" => Ok(WatchKind::Access),
        other => bail!("Unknown watchpoint kind '{other}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_notations() {
        assert_eq!(parse_hex("8000").unwrap(), 0x8000);
        assert_eq!(parse_hex("0x1f").unwrap(), 0x1F);
        assert_eq!(parse_hex("$C000").unwrap(), 0xC000);
        assert_eq!(parse_hex("4000h").unwrap(), 0x4000);
        assert!(parse_hex("10000").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_banked_address() {
        assert_eq!(parse_address("C000@5").unwrap(), LongAddress::banked(0xC000, 5));
        assert_eq!(parse_address("8000").unwrap(), LongAddress::plain(0x8000));
        assert!(parse_address("8000@x").is_err());
    }

    #[test]
    fn test_watch_argument() {
        assert_eq!(parse_watch("4000:10", WatchKind::Read).unwrap(), Watchpoint::new(0x4000, 0x10, WatchKind::Read));
        assert_eq!(parse_watch("4000", WatchKind::Write).unwrap(), Watchpoint::new(0x4000, 1, WatchKind::Write));
        assert!(parse_watch("4000:0", WatchKind::Write).is_err());
    }

    #[test]
    fn test_hex_bytes() {
        assert_eq!(parse_hex_bytes("0x3E11").unwrap(), vec![0x3E, 0x11]);
        assert!(parse_hex_bytes("3E1").is_err());
    }
}
