//! # Code
//!
//! Machine code helpers for the architectures we can patch

use iced_x86::{Decoder, DecoderOptions, IcedError, Instruction};

pub mod x64;

/// Helper functions for an architecture
pub trait Architecture {
    /// Bitness handed to the decoder and block encoder
    const BITNESS: u32;
    /// Maximum length of a single instruction
    const MAX_INSTRUCTION_LEN: usize;
    /// Byte used to fill the tail of a patch that ends mid-instruction
    const FILL: u8;

    /// Encodes the shortest unconditional jump placed at `from` that reaches `to`
    fn jump(from: usize, to: usize) -> Vec<u8>;

    /// Branch from a trampoline back into its target; the block encoder picks its final form
    fn resume(target: usize) -> Result<Instruction, IcedError>;

    /// Creates an instruction decoder for `data`, which is located at `ip`
    fn decoder(data: &[u8], ip: u64) -> Decoder<'_> {
        Decoder::with_ip(Self::BITNESS, data, ip, DecoderOptions::NONE)
    }
}
