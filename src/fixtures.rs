//! Hand-assembled functions for tests
//!
//! Each function is copied into executable memory taken from the proximity allocator, close to a
//! chosen address, so jumps between it and Rust test code stay in `rel32` range.

use crate::alloc::{self, ExecutableMemory};

/// `add(a, b) -> a + b` with a frame pointer prologue and padding
#[cfg(not(windows))]
pub const ADD: &[u8] = &[
    0x55, // push rbp
    0x48, 0x89, 0xe5, // mov rbp, rsp
    0x89, 0xf8, // mov eax, edi
    0x01, 0xf0, // add eax, esi
    0x0f, 0x1f, 0x44, 0x00, 0x00, // nop
    0x0f, 0x1f, 0x44, 0x00, 0x00, // nop
    0x5d, // pop rbp
    0xc3, // ret
];
/// `add(a, b) -> a + b` with a frame pointer prologue and padding
#[cfg(windows)]
pub const ADD: &[u8] = &[
    0x55, // push rbp
    0x48, 0x89, 0xe5, // mov rbp, rsp
    0x89, 0xc8, // mov eax, ecx
    0x01, 0xd0, // add eax, edx
    0x0f, 0x1f, 0x44, 0x00, 0x00, // nop
    0x0f, 0x1f, 0x44, 0x00, 0x00, // nop
    0x5d, // pop rbp
    0xc3, // ret
];

/// `add(a, b)` in four bytes, too short for a jump
#[cfg(not(windows))]
pub const TINY: &[u8] = &[0x8d, 0x04, 0x37, 0xc3]; // lea eax, [rdi + rsi]; ret
/// `add(a, b)` in four bytes, too short for a jump
#[cfg(windows)]
pub const TINY: &[u8] = &[0x8d, 0x04, 0x11, 0xc3]; // lea eax, [rcx + rdx]; ret

/// `Counter::get(this, a) -> this.value + a`
#[cfg(not(windows))]
pub const METHOD: &[u8] = &[
    0x8b, 0x07, // mov eax, [rdi]
    0x01, 0xf0, // add eax, esi
    0x0f, 0x1f, 0x44, 0x00, 0x00, // nop
    0x0f, 0x1f, 0x44, 0x00, 0x00, // nop
    0xc3, // ret
];
/// `Counter::get(this, a) -> this.value + a`
#[cfg(windows)]
pub const METHOD: &[u8] = &[
    0x8b, 0x01, // mov eax, [rcx]
    0x01, 0xd0, // add eax, edx
    0x0f, 0x1f, 0x44, 0x00, 0x00, // nop
    0x0f, 0x1f, 0x44, 0x00, 0x00, // nop
    0xc3, // ret
];

/// `make(out, v) -> out` storing `v` into the caller's result slot
#[cfg(not(windows))]
pub const RVO: &[u8] = &[
    0x89, 0x37, // mov [rdi], esi
    0x48, 0x89, 0xf8, // mov rax, rdi
    0x0f, 0x1f, 0x44, 0x00, 0x00, // nop
    0x0f, 0x1f, 0x44, 0x00, 0x00, // nop
    0xc3, // ret
];
/// `make(out, v) -> out` storing `v` into the caller's result slot
#[cfg(windows)]
pub const RVO: &[u8] = &[
    0x89, 0x11, // mov [rcx], edx
    0x48, 0x89, 0xc8, // mov rax, rcx
    0x0f, 0x1f, 0x44, 0x00, 0x00, // nop
    0x0f, 0x1f, 0x44, 0x00, 0x00, // nop
    0xc3, // ret
];

/// Offset of the data word read by [`load_global`]
const GLOBAL_OFFSET: usize = 32;

/// `load(a) -> GLOBAL + a`, where `GLOBAL` holds `value` and is read RIP-relative
pub fn load_global(value: i32) -> Vec<u8> {
    let disp = (GLOBAL_OFFSET - 6) as i32;

    let mut code = vec![0x8b, 0x05]; // mov eax, [rip + disp]
    code.extend_from_slice(&disp.to_le_bytes());
    if cfg!(windows) {
        code.extend_from_slice(&[0x01, 0xc8]); // add eax, ecx
    } else {
        code.extend_from_slice(&[0x01, 0xf8]); // add eax, edi
    }
    code.extend_from_slice(&[0x0f, 0x1f, 0x44, 0x00, 0x00]);
    code.extend_from_slice(&[0x0f, 0x1f, 0x44, 0x00, 0x00]);
    code.push(0xc3);

    code.resize(GLOBAL_OFFSET, 0xcc);
    code.extend_from_slice(&value.to_le_bytes());
    code
}

/// Signature of [`ADD`] and [`TINY`]
pub type AddFn = extern "C" fn(i32, i32) -> i32;
/// Signature of [`load_global`]
pub type LoadFn = extern "C" fn(i32) -> i32;

/// Receiver layout read by [`METHOD`]
#[repr(C)]
#[derive(Debug)]
pub struct Counter {
    pub value: i32,
}

/// Machine code copied into executable memory
pub struct Assembled {
    /// Memory holding the code, followed by `int3` padding the decoder may read into
    memory: ExecutableMemory,
}

impl Assembled {
    /// Trailing bytes past the code, so decoding never runs off the allocation
    const PADDING: usize = 32;

    /// Copies `code` into executable memory within jump range of `near`
    pub fn new(near: usize, code: &[u8]) -> Self {
        let mut memory = alloc::allocate_executable(near, code.len() + Self::PADDING)
            .expect("no executable memory near test code");
        memory[..code.len()].copy_from_slice(code);
        memory[code.len()..].fill(0xcc);
        Self { memory }
    }

    /// Address of the first instruction
    pub fn address(&self) -> usize {
        self.memory.address()
    }

    /// Current bytes of the code, patches included
    pub fn bytes(&self, len: usize) -> Vec<u8> {
        self.memory[..len].to_vec()
    }
}
