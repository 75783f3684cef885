//! # Patcher
//!
//! Writing bytes over live memory and putting the old bytes back

pub mod byte;
pub mod mem;

/// Overwrites memory and remembers what it replaced
///
/// # Safety
///
/// Implementors document which memory they can write and must restore it exactly through their
/// guard
pub unsafe trait Patcher {
    /// Failure to apply a patch. Use [`std::convert::Infallible`] for patchers that cannot fail.
    type Error;
    /// Holds the replaced bytes and restores them when dropped
    type Guard: PatchGuard;

    /// Writes `patch` at `target`
    ///
    /// # Safety
    ///
    /// `target` must be valid for `patch.len()` bytes as required by the implementor, and no
    /// other thread may be executing or reading those bytes while they change
    unsafe fn patch(&self, target: *mut u8, patch: &[u8]) -> Result<Self::Guard, Self::Error>;
}

/// An applied patch
///
/// # Safety
///
/// Dropping the guard must restore the replaced bytes, whether or not `restore` was called
pub unsafe trait PatchGuard: Sized {
    /// Bytes that were at the location before the patch
    fn original(&self) -> &[u8];

    /// Restores the replaced bytes now
    fn restore(self) {
        // dropping does the work
    }
}
