//! Line commands of the interactive shell.

use crate::parse::{parse_address, parse_hex, parse_hex_bytes, parse_watch, parse_watch_kind};
use anyhow::{bail, Context as _, Result};
use zdbg_core::{BreakpointRequest, DebugCommand, StepKind, WatchKind, Z80Register};

pub const HELP: &str = "\
c | continue             resume execution
p | pause                interrupt a running target
s | step                 step into
n | next                 step over
finish                   step out
r | regs                 show registers
set REG VALUE            write a register
x ADDR [LEN]             read memory (LEN defaults to 10h)
w ADDR HEX               write memory
b ADDR [if CONDITION]    set a breakpoint, ADDR may be ADDR@BANK
log ADDR TEXT            set a log point, {REG} is replaced by its value
d ID                     delete a breakpoint
bl                       list breakpoints
watch|rwatch|awatch ADDR[:LEN]
                         write, read or access watchpoint
unwatch ADDR[:LEN] [read|write|access]
q | quit                 disconnect and exit";

#[derive(Debug, PartialEq, Eq)]
pub enum ShellCommand {
    Debug(DebugCommand),
    Help,
    Quit,
}

fn arg<'a>(words: &[&'a str], index: usize, what: &str) -> Result<&'a str> {
    words.get(index).copied().with_context(|| format!("Missing {what}"))
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<ShellCommand>> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some(&verb) = words.first() else {
        return Ok(None);
    };
    let rest = |from: usize| words.get(from..).map(|w| w.join(" ")).unwrap_or_default();

    let command = match verb {
        "c" | "continue" => DebugCommand::Resume,
        "p" | "pause" => DebugCommand::Pause,
        "s" | "step" => DebugCommand::Step(StepKind::Into),
        "n" | "next" => DebugCommand::Step(StepKind::Over),
        "finish" => DebugCommand::Step(StepKind::Out),
        "r" | "regs" => DebugCommand::ReadRegisters,
        "set" => {
            let register: Z80Register = arg(&words, 1, "register")?.parse().map_err(anyhow::Error::msg)?;
            DebugCommand::WriteRegister(register, parse_hex(arg(&words, 2, "value")?)?)
        }
        "x" => {
            let size = words.get(2).map(|s| parse_hex(s)).transpose()?.unwrap_or(0x10);
            DebugCommand::ReadMemory(parse_hex(arg(&words, 1, "address")?)?, size)
        }
        "w" => DebugCommand::WriteMemory(
            parse_hex(arg(&words, 1, "address")?)?,
            parse_hex_bytes(arg(&words, 2, "data")?)?,
        ),
        "b" | "break" => {
            let mut request = BreakpointRequest::at(parse_address(arg(&words, 1, "address")?)?);
            match words.get(2) {
                Some(&"if") if words.len() > 3 => request = request.with_condition(rest(3)),
                Some(other) => bail!("Expected 'if CONDITION', found '{other}'"),
                None => {}
            }
            DebugCommand::SetBreakpoint(request)
        }
        "log" => {
            let address = parse_address(arg(&words, 1, "address")?)?;
            arg(&words, 2, "log text")?;
            DebugCommand::SetBreakpoint(BreakpointRequest::at(address).with_log(rest(2)))
        }
        "d" | "delete" => {
            let id = arg(&words, 1, "breakpoint id")?;
            DebugCommand::ClearBreakpoint(id.parse().with_context(|| format!("Invalid breakpoint id '{id}'"))?)
        }
        "bl" | "breakpoints" => DebugCommand::ListBreakpoints,
        "watch" | "rwatch" | "awatch" => {
            let kind = match verb {
                "rwatch" => WatchKind::Read,
                "awatch" => WatchKind::Access,
                _ => WatchKind::Write,
            };
            DebugCommand::SetWatchpoint(parse_watch(arg(&words, 1, "address")?, kind)?)
        }
        "unwatch" => {
            let kind = words.get(2).map(|s| parse_watch_kind(s)).transpose()?.unwrap_or(WatchKind::Write);
            DebugCommand::ClearWatchpoint(parse_watch(arg(&words, 1, "address")?, kind)?)
        }
        "h" | "help" | "?" => return Ok(Some(ShellCommand::Help)),
        "q" | "quit" | "exit" => return Ok(Some(ShellCommand::Quit)),
        other => bail!("Unknown command '{other}', try 'help'"),
    };
    Ok(Some(ShellCommand::Debug(command)))
}
