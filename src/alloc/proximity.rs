//! Proximity allocator: maps RWX pools close to an origin and carves trampolines out of them
//!
//! Adapted from detour-rs: https://github.com/darfink/detour-rs

// detour-rs - A cross-platform detour library written in Rust
// Copyright (C) 2017 Elliott Linder.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
//
// ===============================================================================
//
// minhook-rs - A minimalist x86/x86-64 hooking library for Rust
// Copyright (C) 2015 Jascha Neutelings.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::ops::Range;
use std::slice;

use slice_pool::sync::{SliceBox, SlicePool};
use thiserror::Error;
use tracing::trace;

/// A chunk of executable memory handed out by a [`ProximityAllocator`]
pub type Allocation = SliceBox<u8>;

/// Failures to find memory near an origin
#[derive(Debug, Error)]
pub enum ProximityError {
    /// Every free page within reach of the origin was tried
    #[error("no free memory within reach of the origin")]
    OutOfMemory,
    /// The kernel refused a mapping for another reason than lack of memory
    #[error("unable to map trampoline pool: {0}")]
    MmapError(mmap::MapError),
    /// The address space could not be inspected
    #[error("unable to query the address space: {0}")]
    RegionError(#[from] region::Error),
}

/// One RWX mapping and the trampolines carved out of it
struct Pool {
    /// Allocator over the mapping
    slices: SlicePool<u8>,
    /// Addresses covered by the mapping
    span: Range<usize>,
    /// Allocations handed out and not yet released
    live: usize,
}

impl Pool {
    /// Maps `size` bytes at exactly `address`
    ///
    /// `MapAddr` maps with `MAP_FIXED`, which replaces anything already mapped there. Callers
    /// check with [`is_unmapped`] first.
    fn map(address: usize, size: usize) -> Result<Self, ProximityError> {
        let options = [
            mmap::MapOption::MapReadable,
            mmap::MapOption::MapWritable,
            mmap::MapOption::MapExecutable,
            mmap::MapOption::MapAddr(address as *const u8),
        ];
        let map = mmap::MemoryMap::new(size, &options).map_err(|error| match error {
            mmap::MapError::ErrNoMem => ProximityError::OutOfMemory,
            error => ProximityError::MmapError(error),
        })?;
        let start = map.data() as usize;
        let span = start..start + map.len();
        Ok(Self {
            slices: SlicePool::new(Mapping(map)),
            span,
            live: 0,
        })
    }

    /// Whether the whole mapping lies inside `window`
    fn within(&self, window: &Range<usize>) -> bool {
        window.start <= self.span.start && self.span.end <= window.end
    }

    /// Carves `size` bytes out of the mapping
    fn take(&mut self, size: usize) -> Option<Allocation> {
        let allocation = self.slices.alloc(size)?;
        self.live += 1;
        Some(allocation)
    }
}

/// Lets a [`mmap::MemoryMap`] back a [`SlicePool`]
struct Mapping(mmap::MemoryMap);

impl AsRef<[u8]> for Mapping {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: the map is valid for `len` bytes until it is dropped
        unsafe { slice::from_raw_parts(self.0.data(), self.0.len()) }
    }
}

impl AsMut<[u8]> for Mapping {
    fn as_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and the pool hands out disjoint slices
        unsafe { slice::from_raw_parts_mut(self.0.data(), self.0.len()) }
    }
}

// SAFETY: the mapping is owned by the pool and only reached through it
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// Hands out executable memory within `max_distance` of a requested origin
pub struct ProximityAllocator {
    /// Furthest a pool may start or end from the origin it was mapped for
    max_distance: usize,
    /// Mapped pools, searched in mapping order
    pools: Vec<Pool>,
}

impl ProximityAllocator {
    /// Creates an allocator whose pools stay within `max_distance` of their origin
    pub fn new(max_distance: usize) -> Self {
        Self {
            max_distance,
            pools: Vec::new(),
        }
    }

    /// Addresses a pool for `origin` may cover
    fn window(&self, origin: usize) -> Range<usize> {
        origin.saturating_sub(self.max_distance)..origin.saturating_add(self.max_distance)
    }

    /// Allocates `size` bytes of RWX memory within reach of `origin`
    pub fn allocate(&mut self, origin: usize, size: usize) -> Result<Allocation, ProximityError> {
        let window = self.window(origin);
        if let Some(allocation) = self
            .pools
            .iter_mut()
            .filter(|pool| pool.within(&window))
            .find_map(|pool| pool.take(size))
        {
            return Ok(allocation);
        }

        let mut pool = Self::map_near(origin, &window, size)?;
        let allocation = pool.take(size).ok_or(ProximityError::OutOfMemory)?;
        trace!(origin, pool = pool.span.start, len = pool.span.len(), "mapped trampoline pool");
        self.pools.push(pool);
        Ok(allocation)
    }

    /// Forgets `allocation`, unmapping its pool once nothing else lives in it. The mapping
    /// itself outlives the pool entry until the last [`Allocation`] of it is dropped.
    pub fn release(&mut self, allocation: &Allocation) {
        let address = allocation.as_ptr() as usize;
        let Some(index) = self
            .pools
            .iter()
            .position(|pool| pool.span.contains(&address))
        else {
            return;
        };

        let pool = &mut self.pools[index];
        pool.live = pool.live.saturating_sub(1);
        if pool.live == 0 {
            let pool = self.pools.swap_remove(index);
            trace!(pool = pool.span.start, "released trampoline pool");
        }
    }

    /// Maps a new pool on the first free page in `window`, looking above `origin` before below
    /// it since macOS refuses mappings under the executable
    fn map_near(origin: usize, window: &Range<usize>, size: usize) -> Result<Pool, ProximityError> {
        let page_size = region::page::size();
        let size = size.div_ceil(page_size).max(1) * page_size;

        let above = FreePages::new(origin, window.clone(), Direction::Up);
        let below = FreePages::new(origin, window.clone(), Direction::Down);
        for candidate in above.chain(below) {
            let candidate = candidate?;
            // only the first page is known to be free
            let fits = candidate
                .checked_add(size)
                .is_some_and(|end| end <= window.end && is_unmapped(candidate, size));
            if !fits {
                continue;
            }
            let Ok(pool) = Pool::map(candidate, size) else {
                continue;
            };
            if pool.within(window) {
                return Ok(pool);
            }
        }
        Err(ProximityError::OutOfMemory)
    }
}

/// Returns true if no page of `address..address + size` is mapped
fn is_unmapped(address: usize, size: usize) -> bool {
    match region::query_range(address as *const u8, size) {
        Ok(mut mapped) => mapped.next().is_none(),
        Err(region::Error::UnmappedRegion) => true,
        Err(_) => false,
    }
}

/// Which way a [`FreePages`] walk moves from its origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Towards higher addresses
    Up,
    /// Towards lower addresses
    Down,
}

/// Walks the address space from an origin, yielding unmapped pages inside a window
struct FreePages {
    /// Next address to inspect
    cursor: usize,
    /// Bounds of the walk
    window: Range<usize>,
    /// Walk direction
    direction: Direction,
}

impl FreePages {
    /// Starts a walk at `origin`
    fn new(origin: usize, window: Range<usize>, direction: Direction) -> Self {
        Self {
            cursor: origin,
            window,
            direction,
        }
    }

    /// The page after `address` in walk order
    fn advance(&self, address: usize, page_size: usize) -> usize {
        match self.direction {
            Direction::Up => address.saturating_add(page_size),
            Direction::Down => address.saturating_sub(page_size),
        }
    }
}

impl Iterator for FreePages {
    type Item = Result<usize, region::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let page_size = region::page::size();
        while self.cursor != 0 && self.window.contains(&self.cursor) {
            let address = self.cursor;
            match region::query(address as *const u8) {
                // skip the whole mapping in one step
                Ok(mapped) => {
                    let mapped = mapped.as_range();
                    self.cursor = match self.direction {
                        Direction::Up => mapped.end,
                        Direction::Down => mapped.start.saturating_sub(page_size),
                    };
                }
                Err(region::Error::UnmappedRegion) => {
                    self.cursor = self.advance(address, page_size);
                    return Some(Ok(address - address % page_size));
                }
                Err(error) => {
                    self.cursor = self.advance(address, page_size);
                    return Some(Err(error));
                }
            }
        }
        None
    }
}
