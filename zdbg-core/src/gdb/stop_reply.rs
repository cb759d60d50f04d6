//! Stop reply parsing.
//!
//! Format: `T<signal>(<key>:<value>;)+`. A key is either a hex register number
//! or one of the watchpoint tokens `watch`, `rwatch` and `awatch`.

use super::{decode_le16, GdbError, RegisterLayout};
use crate::debug::{StopReason, StopReply, WatchKind};
use nom::bytes::complete::{take_while, take_while1, take_while_m_n};
use nom::character::complete::char;
use nom::combinator::{all_consuming, map_res};
use nom::multi::many1;
use nom::sequence::{preceded, separated_pair, terminated};
use nom::{IResult, Parser};

const SIGINT: u8 = 0x02;

fn signal(input: &str) -> IResult<&str, u8> {
    preceded(
        char('T'),
        map_res(take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()), |s| u8::from_str_radix(s, 16)),
    )
    .parse(input)
}

fn field(input: &str) -> IResult<&str, (&str, &str)> {
    terminated(
        separated_pair(take_while1(|c: char| c != ':' && c != ';'), char(':'), take_while(|c: char| c != ';')),
        char(';'),
    )
    .parse(input)
}

/// Watchpoint token to access kind. `watch` reports a write, `rwatch` a read
/// and `awatch` any access.
fn watch_kind(key: &str) -> Option<WatchKind> {
    match key {
        "watch" => Some(WatchKind::Write),
        "rwatch" => Some(WatchKind::Read),
        "awatch" => Some(WatchKind::Access),
        _ => None,
    }
}

/// Parse a stop reply. The PC is located via the register layout; a
/// watchpoint field replaces it as the stop location. A reply without a PC
/// value is an error.
pub fn parse_stop_reply(reply: &str, layout: &RegisterLayout) -> Result<StopReply, GdbError> {
    let (_, (signo, fields)) = all_consuming((signal, many1(field)))
        .parse(reply)
        .map_err(|_| GdbError::MalformedStopReply(reply.to_string()))?;

    let pc_regnum = layout.pc_regnum();
    let mut pc = None;
    let mut watch = None;
    for (key, value) in fields {
        let malformed = || GdbError::MalformedStopReply(reply.to_string());
        if let Some(kind) = watch_kind(key) {
            watch = Some((kind, decode_le16(value).ok_or_else(malformed)?));
        } else if let Ok(regnum) = usize::from_str_radix(key, 16) {
            if Some(regnum) == pc_regnum {
                pc = Some(decode_le16(value).ok_or_else(malformed)?);
            }
        }
    }

    let pc = pc.ok_or(GdbError::NoBreakAddress)?;
    Ok(match watch {
        Some((kind, address)) => StopReply::new(kind.stop_reason(), address),
        None if signo == SIGINT => StopReply::new(StopReason::Paused, pc),
        None => StopReply::new(StopReason::BreakpointHit, pc),
    })
}
