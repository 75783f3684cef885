//! # Original
//!
//! Calling the implementation a hook replaced. A hooked target answers with its trampoline, a
//! target that was never hooked with its own address, so replacement code can forward
//! unconditionally.

use crate::error::HookError;
use crate::registry::Registry;
use crate::resolve::{self, Resolver, Target};
use crate::signature::{RawFn, Signature};

/// Address that behaves like the unhooked `target`
pub fn original_address<S: Signature>(
    target: &Target<S>,
    resolver: &Resolver<'_>,
    registry: &Registry,
) -> Result<usize, HookError> {
    let id = resolver.resolve(target)?;
    Ok(registry.original(id.address).unwrap_or(id.address))
}

/// Original implementation of `target`, or the resolution error
///
/// # Safety
///
/// `target` must be declared with the signature of the function it resolves to
pub unsafe fn try_get_original<S: Signature>(
    target: &Target<S>,
) -> Result<S::Original, HookError> {
    let address = original_address(target, &resolve::resolver(), Registry::global())?;
    Ok(<S::Original as RawFn>::from_address(address))
}

/// Original implementation of `target`, called with the receiver made explicit
///
/// # Safety
///
/// `target` must be declared with the signature of the function it resolves to
///
/// # Panics
///
/// Panics if `target` does not resolve
pub unsafe fn get_original<S: Signature>(target: &Target<S>) -> S::Original {
    match try_get_original(target) {
        Ok(original) => original,
        Err(error) => panic!("{error}"),
    }
}

/// Like [`try_get_original`], for functions returning through caller-provided storage
///
/// # Safety
///
/// `target` must be declared with the signature of the function it resolves to, and that
/// function must return its result through a hidden pointer
pub unsafe fn try_get_original_rvo<S: Signature>(
    target: &Target<S>,
) -> Result<S::OriginalRvo, HookError> {
    let address = original_address(target, &resolve::resolver(), Registry::global())?;
    Ok(<S::OriginalRvo as RawFn>::from_address(address))
}

/// Like [`get_original`], for functions returning through caller-provided storage
///
/// The storage pointer comes right after the receiver (first for free functions), and the
/// original returns it.
///
/// # Safety
///
/// See [`try_get_original_rvo`]
///
/// # Panics
///
/// Panics if `target` does not resolve
pub unsafe fn get_original_rvo<S: Signature>(target: &Target<S>) -> S::OriginalRvo {
    match try_get_original_rvo(target) {
        Ok(original) => original,
        Err(error) => panic!("{error}"),
    }
}
