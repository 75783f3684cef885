//! Prologue relocation.
//!
//! A detour overwrites the first instructions of its target. Those instructions are decoded,
//! re-encoded at the trampoline's address and followed by a jump back into the target, so calling
//! the trampoline behaves like calling the unpatched function.

use std::marker::PhantomData;
use std::ops::Range;
use std::slice;

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, FlowControl, IcedError, Instruction, InstructionBlock,
};
use tracing::trace;

use crate::alloc::{self, ExecutableMemory};
use crate::code::Architecture;
use crate::error::HookError;

/// Worst-case length of a single relocated instruction. Short branches may be rewritten into a
/// near branch plus an absolute jump.
const MAX_RELOCATED_LEN: usize = 32;

/// Whole instructions taken from the start of a function
#[derive(Debug, Clone)]
pub struct Prologue<A: Architecture> {
    /// Address of the first instruction
    address: usize,
    /// Decoded instructions, with their original instruction pointers
    instructions: Vec<Instruction>,
    /// Total length of the instructions
    len: usize,
    /// Placeholder for architecture
    _arch: PhantomData<A>,
}

impl<A: Architecture> Prologue<A> {
    /// Decodes the fewest whole instructions at `address` whose length is at least `required`
    ///
    /// # Safety
    ///
    /// `address` must be readable for `required + MAX_INSTRUCTION_LEN - 1` bytes
    pub unsafe fn decode(address: usize, required: usize) -> Result<Self, HookError> {
        // the last instruction needed may start on the last byte of the patch
        let window = slice::from_raw_parts(
            address as *const u8,
            required + A::MAX_INSTRUCTION_LEN - 1,
        );
        let mut decoder = A::decoder(window, address as u64);

        let mut instructions = Vec::new();
        let mut len = 0;
        while len < required {
            let instruction = decoder.decode();
            if instruction.is_invalid() {
                return Err(HookError::RelocationFailed {
                    address,
                    reason: format!("undecodable instruction at {:#x}", instruction.ip()),
                });
            }
            len += instruction.len();
            instructions.push(instruction);

            // nothing after a return or an unconditional jump belongs to this function
            if ends_function(&instruction) && len < required {
                return Err(HookError::TargetTooSmall {
                    address,
                    required,
                    available: len,
                });
            }
        }

        let prologue = Self {
            address,
            instructions,
            len,
            _arch: PhantomData,
        };
        prologue.check_internal_branches()?;
        Ok(prologue)
    }

    /// Address of the first stolen instruction
    pub fn address(&self) -> usize {
        self.address
    }

    /// Length in bytes of the stolen instructions
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no instruction was decoded
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// The stolen instructions
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Address range that the patch will overwrite
    fn stolen(&self) -> Range<u64> {
        self.address as u64..(self.address + self.len) as u64
    }

    /// A branch into the stolen bytes would land inside the patch once it is written
    fn check_internal_branches(&self) -> Result<(), HookError> {
        let stolen = self.stolen();
        let inner = self.instructions.iter().find(|i| {
            matches!(
                i.flow_control(),
                FlowControl::ConditionalBranch | FlowControl::UnconditionalBranch
            ) && stolen.contains(&i.near_branch_target())
        });
        match inner {
            Some(branch) => Err(HookError::RelocationFailed {
                address: self.address,
                reason: format!(
                    "branch at {:#x} targets the patched range",
                    branch.ip()
                ),
            }),
            None => Ok(()),
        }
    }
}

/// Returns true if execution never falls through past `instruction`
fn ends_function(instruction: &Instruction) -> bool {
    matches!(
        instruction.flow_control(),
        FlowControl::Return
            | FlowControl::UnconditionalBranch
            | FlowControl::IndirectBranch
            | FlowControl::Interrupt
    )
}

/// Executable copy of a relocated prologue followed by a jump back into the target
pub struct Trampoline {
    /// Memory holding the relocated code
    memory: ExecutableMemory,
    /// Length of the generated code
    len: usize,
}

impl Trampoline {
    /// Relocates `prologue` into fresh executable memory close to it
    pub fn build<A: Architecture>(prologue: &Prologue<A>) -> Result<Self, HookError> {
        let origin = prologue.address();
        let capacity = prologue.instructions().len() * MAX_RELOCATED_LEN + MAX_RELOCATED_LEN;
        let mut memory = alloc::allocate_executable(origin, capacity)
            .map_err(|source| HookError::TrampolineAllocationFailed { origin, source })?;

        let relocation_failed = |e: IcedError| HookError::RelocationFailed {
            address: origin,
            reason: e.to_string(),
        };

        let mut instructions = prologue.instructions().to_vec();
        instructions.push(A::resume(origin + prologue.len()).map_err(relocation_failed)?);

        let block = InstructionBlock::new(&instructions, memory.address() as u64);
        let code = BlockEncoder::encode(A::BITNESS, block, BlockEncoderOptions::NONE)
            .map_err(relocation_failed)?
            .code_buffer;

        if code.len() > memory.len() {
            return Err(HookError::RelocationFailed {
                address: origin,
                reason: format!(
                    "relocated prologue needs {} bytes, {} reserved",
                    code.len(),
                    memory.len()
                ),
            });
        }
        memory[..code.len()].copy_from_slice(&code);
        memory[code.len()..].fill(A::FILL);

        trace!(
            function = format_args!("{origin:#x}"),
            trampoline = format_args!("{:#x}", memory.address()),
            stolen = prologue.len(),
            relocated = code.len(),
            "built trampoline"
        );

        Ok(Self {
            memory,
            len: code.len(),
        })
    }

    /// Address of the trampoline, callable as the original function
    pub fn address(&self) -> usize {
        self.memory.address()
    }

    /// Generated code
    pub fn code(&self) -> &[u8] {
        &self.memory[..self.len]
    }
}
