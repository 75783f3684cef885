//! # Alloc
//!
//! Executable memory for trampolines. Trampolines replay relocated instructions, so they have to
//! live within [`DETOUR_RANGE`] of the code they were taken from for RIP-relative operands to stay
//! encodable.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use lazy_static::lazy_static;

use self::proximity::{Allocation, ProximityAllocator, ProximityError};

pub mod proximity;

/// The furthest distance between a target and its trampoline (2 GiB).
pub const DETOUR_RANGE: usize = 0x8000_0000;

/// A thread-safe memory pool for allocating chunks close to addresses.
#[derive(Clone)]
pub struct ThreadAllocator(Arc<Mutex<ProximityAllocator>>);

impl ThreadAllocator {
    /// Creates a new proximity memory allocator.
    pub fn new(max_distance: usize) -> Self {
        ThreadAllocator(Arc::new(Mutex::new(ProximityAllocator::new(max_distance))))
    }

    /// Locks the pool, recovering it if a previous holder panicked
    fn lock(&self) -> MutexGuard<'_, ProximityAllocator> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocates read-, write- & executable memory close to `origin`.
    pub fn allocate(&self, origin: usize, size: usize) -> Result<ExecutableMemory, ProximityError> {
        self.lock()
            .allocate(origin, size)
            .map(|data| ExecutableMemory {
                allocator: self.clone(),
                data: Some(data),
            })
    }
}

/// A handle for allocated proximity memory.
pub struct ExecutableMemory {
    /// Proximity allocator for the executable code to reside
    allocator: ThreadAllocator,
    /// Actual allocation where the executable code resides. `Option` so it can be released before the pool is checked
    data: Option<Allocation>,
}

// SAFETY: the allocation is owned exclusively by this handle and the pool is behind a mutex
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

impl ExecutableMemory {
    /// Address of the first byte of the allocation
    pub fn address(&self) -> usize {
        self.as_ptr() as usize
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            // the pool is checked while `data` is still counted as live
            self.allocator.lock().release(&data);
        }
    }
}

impl Deref for ExecutableMemory {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data.as_deref().unwrap_or_default()
    }
}

impl DerefMut for ExecutableMemory {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or_default()
    }
}

lazy_static! {
    /// Pool shared by every trampoline in the process
    static ref POOL: ThreadAllocator = ThreadAllocator::new(DETOUR_RANGE);
}

/// Allocates an executable buffer within [`DETOUR_RANGE`] of `origin`. Its contents are whatever
/// the pool last held there.
pub fn allocate_executable(origin: usize, size: usize) -> Result<ExecutableMemory, ProximityError> {
    POOL.allocate(origin, size)
}
