//! Instruction analysis for step-over and step-out on backends that only
//! support single instruction steps.

/// Bytes of code needed at PC to decide how to step over.
pub const LOOKAHEAD: u16 = 4;

/// If the instruction at `pc` returns to the following instruction
/// (calls, restarts, `DJNZ`, repeating block instructions, `HALT`), the address
/// to run to. `None` means a single step is enough.
pub fn step_over_target(pc: u16, code: &[u8]) -> Option<u16> {
    let opcode = *code.first()?;
    let length = match opcode {
        0xCD | 0xC4 | 0xCC | 0xD4 | 0xDC | 0xE4 | 0xEC | 0xF4 | 0xFC => 3,
        op if op & 0xC7 == 0xC7 => 1,
        0x10 => 2,
        0x76 => 1,
        0xED => match code.get(1)? {
            0xB0..=0xB3 | 0xB8..=0xBB => 2,
            _ => return None,
        },
        _ => return None,
    };
    Some(pc.wrapping_add(length))
}

/// Return address stored little-endian at the top of the stack.
pub fn return_address(stack: &[u8]) -> Option<u16> {
    match stack {
        [low, high, ..] => Some(u16::from_le_bytes([*low, *high])),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calls_are_stepped_over() {
        assert_eq!(step_over_target(0x8000, &[0xCD, 0x00, 0x90]), Some(0x8003));
        assert_eq!(step_over_target(0x8000, &[0xC4, 0x00, 0x90]), Some(0x8003));
        assert_eq!(step_over_target(0x8000, &[0xFF]), Some(0x8001));
        assert_eq!(step_over_target(0x8000, &[0x10, 0xFE]), Some(0x8002));
        assert_eq!(step_over_target(0xFFFF, &[0xED, 0xB0]), Some(0x0001));
    }

    #[test]
    fn test_plain_instructions_are_single_stepped() {
        assert_eq!(step_over_target(0x8000, &[0x00]), None);
        assert_eq!(step_over_target(0x8000, &[0xC3, 0x00, 0x90]), None);
        assert_eq!(step_over_target(0x8000, &[0xED, 0x47]), None);
        assert_eq!(step_over_target(0x8000, &[0xED]), None);
        assert_eq!(step_over_target(0x8000, &[]), None);
    }

    #[test]
    fn test_return_address() {
        assert_eq!(return_address(&[0x34, 0x12]), Some(0x1234));
        assert_eq!(return_address(&[0x34]), None);
    }
}
