//! Plain byte patches, for memory that is already writable

use std::convert::Infallible;
use std::ptr;
use std::slice;

use super::{PatchGuard, Patcher};

/// Copies patch bytes over the target and saves what was there. Never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytePatcher;

impl BytePatcher {
    /// Creates a new [`BytePatcher`]
    pub const fn new() -> Self {
        Self
    }
}

unsafe impl Patcher for BytePatcher {
    type Error = Infallible;
    type Guard = BytePatchGuard;

    unsafe fn patch(&self, location: *mut u8, patch: &[u8]) -> Result<Self::Guard, Self::Error> {
        let saved = slice::from_raw_parts(location, patch.len()).into();
        ptr::copy_nonoverlapping(patch.as_ptr(), location, patch.len());
        Ok(BytePatchGuard { saved, location })
    }
}

/// Saved bytes of an applied [`BytePatcher`] patch, written back on drop
#[derive(Debug)]
pub struct BytePatchGuard {
    /// Bytes that were overwritten
    saved: Box<[u8]>,
    /// Start of the patch
    location: *mut u8,
}

// SAFETY: the location is only written on drop, under the contract of `Patcher::patch`
unsafe impl Send for BytePatchGuard {}
unsafe impl Sync for BytePatchGuard {}

unsafe impl PatchGuard for BytePatchGuard {
    fn original(&self) -> &[u8] {
        &self.saved
    }
}

impl Drop for BytePatchGuard {
    fn drop(&mut self) {
        // SAFETY: `location` was valid for `saved.len()` bytes when patched, and the patcher's
        // caller keeps it writable for as long as the guard lives
        unsafe { ptr::copy_nonoverlapping(self.saved.as_ptr(), self.location, self.saved.len()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Only the patched bytes change, and they come back when the guard goes away
    fn test_patch_restores() {
        let mut prologue = [0x55u8, 0x48, 0x89, 0xe5, 0xc3];
        let start = prologue.as_mut_ptr();

        let guard = unsafe { BytePatcher::new().patch(start.add(1), &[0xcc, 0xcc]).unwrap() };
        assert_eq!(guard.original(), [0x48, 0x89]);
        assert_eq!(
            unsafe { slice::from_raw_parts(start, 5) },
            [0x55, 0xcc, 0xcc, 0xe5, 0xc3]
        );

        guard.restore();
        assert_eq!(prologue, [0x55, 0x48, 0x89, 0xe5, 0xc3]);
    }
}
