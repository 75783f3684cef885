//! Patches for pages the loader mapped without write access, such as the host binary's code

use std::convert::Infallible;

use region::Protection;
use thiserror::Error;
use tracing::warn;

use super::{PatchGuard, Patcher};

/// Errors of a [`PermissionWrapper`]
#[derive(Debug, Error)]
pub enum PermissionError<E> {
    /// The pages could not be unprotected
    #[error("unable to change page protection: {0}")]
    ProtectionError(#[from] region::Error),
    /// The wrapped patcher failed
    #[error("{0}")]
    CustomError(E),
}

impl From<Infallible> for PermissionError<Infallible> {
    fn from(e: Infallible) -> Self {
        Self::CustomError(e)
    }
}

/// Runs a patcher with the target pages temporarily readable, writable and executable. Their
/// previous protection is put back once the write is done, both when patching and when the guard
/// restores.
///
/// # Safety
///
/// Only the `patch.len()` bytes at the target are unprotected, so the wrapped patcher must not
/// write outside of them. The target must not be memory that Rust code holds references to.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissionWrapper<P: Patcher> {
    /// Wrapped patcher
    patcher: P,
}

impl<P: Patcher> PermissionWrapper<P> {
    /// Wraps `patcher`
    pub const fn new(patcher: P) -> Self {
        Self { patcher }
    }
}

/// Casts away constness of a patch target.
///
/// # Safety
///
/// The pointer stays read-only as far as the page tables are concerned; only pass it to a
/// [`PermissionWrapper`].
pub unsafe fn to_mut<T>(ptr: *const T) -> *mut T {
    ptr as _
}

unsafe impl<P> Patcher for PermissionWrapper<P>
where
    P: Patcher,
    PermissionError<P::Error>: From<P::Error>,
{
    type Error = PermissionError<P::Error>;
    type Guard = PermissionWrapperGuard<P::Guard>;

    unsafe fn patch(&self, location: *mut u8, patch: &[u8]) -> Result<Self::Guard, Self::Error> {
        // keep execute rights: the page may hold code that other threads are running
        let _unprotected = region::protect_with_handle(location, patch.len(), Protection::all())?;
        let guard = self.patcher.patch(location, patch)?;
        Ok(PermissionWrapperGuard {
            guard: Some(guard),
            location,
            len: patch.len(),
        })
    }
}

/// Guard of a [`PermissionWrapper`] patch
#[derive(Debug)]
pub struct PermissionWrapperGuard<G: PatchGuard> {
    /// Guard of the wrapped patcher, taken on drop
    guard: Option<G>,
    /// Start of the patch
    location: *const u8,
    /// Length of the patch
    len: usize,
}

// SAFETY: the location is only written on drop, see `BytePatchGuard`
unsafe impl<G: PatchGuard + Send> Send for PermissionWrapperGuard<G> {}
unsafe impl<G: PatchGuard + Sync> Sync for PermissionWrapperGuard<G> {}

unsafe impl<G: PatchGuard> PatchGuard for PermissionWrapperGuard<G> {
    fn original(&self) -> &[u8] {
        self.guard.as_ref().map(G::original).unwrap_or_default()
    }
}

impl<G: PatchGuard> Drop for PermissionWrapperGuard<G> {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        match unsafe { region::protect_with_handle(self.location, self.len, Protection::all()) } {
            Ok(_unprotected) => guard.restore(),
            Err(error) => {
                // writing to a protected page would fault, leave the patch applied
                warn!(location = ?self.location, %error, "unable to unprotect patch, leaving it applied");
                std::mem::forget(guard);
            }
        }
    }
}
