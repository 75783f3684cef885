//! # Hook
//!
//! Redirecting a function's callers to a replacement

pub mod detour;
pub mod trampoline;

/// Redirects execution from one function to another
///
/// # Safety
///
/// Implementors must leave the source callable through their guard for as long as the guard lives
/// and undo every change once it is gone
pub unsafe trait Hook {
    /// Failure to apply the hook
    type Error;
    /// Applied hook, removed when dropped
    type Guard: HookGuard;

    /// Sends calls of `source` to `destination`
    ///
    /// # Safety
    ///
    /// - `source` must be the start of a function and `destination` a function with the same
    ///   calling convention
    /// - no other thread may be executing the bytes of `source` that get replaced
    unsafe fn hook(
        &self,
        source: *const u8,
        destination: *const u8,
    ) -> Result<Self::Guard, Self::Error>;
}

/// An applied hook
///
/// # Safety
///
/// Dropping the guard must remove the hook whether or not `unhook` was called
pub unsafe trait HookGuard: Sized {
    /// Removes the hook now
    fn unhook(self) {
        // dropping does the work
    }
}
