//! Rendering of session events for the terminal.

use std::fmt::Write as _;
use zdbg_core::{Breakpoint, DebugEvent};

/// Classic hex dump, 16 bytes per line.
pub fn hex_dump(address: u16, data: &[u8]) -> String {
    let mut out = String::new();
    for (i, chunk) in data.chunks(16).enumerate() {
        let line_address = address.wrapping_add((i * 16) as u16);
        let bytes: Vec<String> = chunk.iter().map(|b| format!("{b:02X}")).collect();
        let ascii: String =
            chunk.iter().map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' }).collect();
        let _ = writeln!(out, "{line_address:04X}: {:<47}  {ascii}", bytes.join(" "));
    }
    out.truncate(out.trim_end().len());
    out
}

fn describe_breakpoint(bp: &Breakpoint) -> String {
    let mut text = format!("#{} {}", bp.id, bp.address);
    if let Some(condition) = &bp.condition {
        let _ = write!(text, " if {condition}");
    }
    if let Some(log) = &bp.log {
        let _ = write!(text, " log \"{log}\"");
    }
    text
}

/// Human readable form of an event.
pub fn render(event: &DebugEvent) -> String {
    match event {
        DebugEvent::Resumed => "Running".to_string(),
        DebugEvent::Stopped(stop) => format!("Stopped: {} at 0x{:04X}", stop.reason, stop.address),
        DebugEvent::Registers(regs) => {
            let slots: Vec<String> = regs.slots.iter().map(u8::to_string).collect();
            format!("{regs}\nSlots: {}", slots.join(" "))
        }
        DebugEvent::MemoryData(address, data) => hex_dump(*address, data),
        DebugEvent::Breakpoints(list) if list.is_empty() => "No breakpoints".to_string(),
        DebugEvent::Breakpoints(list) => list.iter().map(describe_breakpoint).collect::<Vec<_>>().join("\n"),
        DebugEvent::Coverage(addresses) => format!("Executed {} addresses", addresses.len()),
        DebugEvent::Log(message) => format!("Log: {message}"),
        DebugEvent::Warning(message) => format!("Warning: {message}"),
        DebugEvent::Error(message) => format!("Error: {message}"),
        DebugEvent::Disconnected => "Disconnected".to_string(),
    }
}

pub fn print_event(event: &DebugEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => log::error!("Failed to serialize event: {e}"),
        }
    } else {
        println!("{}", render(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zdbg_core::{BreakpointRequest, LongAddress, StopReason, StopReply};

    #[test]
    fn test_hex_dump() {
        let data: Vec<u8> = (0x41..0x41 + 18).collect();
        let dump = hex_dump(0x8000, &data);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("8000: 41 42 43"));
        assert!(lines[0].ends_with("ABCDEFGHIJKLMNOP"));
        assert_eq!(lines[1], format!("8010: {:<47}  QR", "51 52"));
    }

    #[test]
    fn test_render_stop() {
        let event = DebugEvent::Stopped(StopReply::new(StopReason::WatchpointWrite, 0x4000));
        assert_eq!(render(&event), "Stopped: watchpoint write at 0x4000");
    }

    #[test]
    fn test_render_breakpoints() {
        let request = BreakpointRequest::at(LongAddress::banked(0xC000, 3)).with_condition("A == 1");
        let bp = Breakpoint {
            id: 2,
            address: request.address,
            condition: request.condition,
            log: None,
            temporary: false,
        };
        assert_eq!(render(&DebugEvent::Breakpoints(vec![bp])), "#2 0xC000@3 if A == 1");
        assert_eq!(render(&DebugEvent::Breakpoints(Vec::new())), "No breakpoints");
    }
}
