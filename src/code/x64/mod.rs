//! x86_64 jump encodings

use iced_x86::{Code, IcedError, Instruction};

use super::Architecture;

/// Length of `jmp rel32`
pub const JMP_REL32_LEN: usize = 5;
/// Length of `jmp [rip+0]` followed by the absolute target
pub const JMP_ABS_LEN: usize = 14;

/// The x86_64 architecture
#[derive(Debug, Default, Clone, Copy)]
pub struct X64;

impl Architecture for X64 {
    const BITNESS: u32 = 64;
    const MAX_INSTRUCTION_LEN: usize = 15;
    const FILL: u8 = 0xcc;

    fn jump(from: usize, to: usize) -> Vec<u8> {
        match jmp_rel32(from, to) {
            Some(code) => code.to_vec(),
            None => jmp_abs(to).to_vec(),
        }
    }

    fn resume(target: usize) -> Result<Instruction, IcedError> {
        Instruction::with_branch(Code::Jmp_rel32_64, target as u64)
    }
}

/// Generates a relative jump located at `from` to `to`, if the displacement fits in 32 bits
pub fn jmp_rel32(from: usize, to: usize) -> Option<[u8; JMP_REL32_LEN]> {
    let next = from.wrapping_add(JMP_REL32_LEN) as i64;
    let displacement = i32::try_from((to as i64).wrapping_sub(next)).ok()?;

    let mut code = [0u8; JMP_REL32_LEN];
    code[0] = 0xe9;
    code[1..].copy_from_slice(&displacement.to_le_bytes());
    Some(code)
}

/// Generates an absolute jump to a specified address and returns bytecode
pub fn jmp_abs(target: usize) -> [u8; JMP_ABS_LEN] {
    let mut code = [0u8; JMP_ABS_LEN];
    // jmp [rip + 0], the target follows the instruction
    code[..6].copy_from_slice(&[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]);
    code[6..].copy_from_slice(&(target as u64).to_le_bytes());
    code
}
