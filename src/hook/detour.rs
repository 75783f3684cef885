//! # Detour Hook
//!
//! This hook type overwrites the start of a function with a jump to the replacement and keeps the
//! overwritten instructions in a trampoline, so the replacement can still call the original

use std::marker::PhantomData;

use tracing::debug;

use crate::code::x64::X64;
use crate::code::Architecture;
use crate::error::HookError;
use crate::patcher::byte::{BytePatchGuard, BytePatcher};
use crate::patcher::mem::{to_mut, PermissionWrapper, PermissionWrapperGuard};
use crate::patcher::{PatchGuard, Patcher};

use super::trampoline::{Prologue, Trampoline};
use super::{Hook, HookGuard};

/// Patcher for code pages, which are not writable outside of a patch
static CODE_PATCHER: PermissionWrapper<BytePatcher> = PermissionWrapper::new(BytePatcher::new());

/// Inline detour with a relocated trampoline
#[derive(Debug, Default, Clone, Copy)]
pub struct DetourHook<A: Architecture = X64> {
    /// Placeholder for architecture
    _arch: PhantomData<A>,
}

impl<A: Architecture> DetourHook<A> {
    /// Creates a new detour hook
    pub const fn new() -> Self {
        Self { _arch: PhantomData }
    }
}

impl<A: Architecture> DetourHook<A> {
    /// Builds the trampoline for a detour of `source` without patching anything yet
    ///
    /// The trampoline is callable as soon as this returns, so it can be published before
    /// [`PreparedDetour::apply`] sends callers of `source` to `destination`.
    ///
    /// # Safety
    ///
    /// See [`Hook::hook`]
    pub unsafe fn prepare(
        &self,
        source: *const u8,
        destination: *const u8,
    ) -> Result<PreparedDetour, HookError> {
        let target = source as usize;
        let mut patch = A::jump(target, destination as usize);

        let prologue = Prologue::<A>::decode(target, patch.len())?;
        let trampoline = Trampoline::build(&prologue)?;

        // the last stolen instruction may end past the jump, never leave half of it behind
        patch.resize(prologue.len(), A::FILL);
        Ok(PreparedDetour {
            target,
            destination: destination as usize,
            patch,
            trampoline,
        })
    }
}

unsafe impl<A: Architecture> Hook for DetourHook<A> {
    type Error = HookError;
    type Guard = DetourGuard;

    unsafe fn hook(
        &self,
        source: *const u8,
        destination: *const u8,
    ) -> Result<Self::Guard, Self::Error> {
        self.prepare(source, destination)?.apply()
    }
}

/// A detour whose trampoline is built but whose target is not patched yet
pub struct PreparedDetour {
    /// Function to patch
    target: usize,
    /// Replacement the patch jumps to
    destination: usize,
    /// Jump padded to whole instructions
    patch: Vec<u8>,
    /// Relocated prologue
    trampoline: Trampoline,
}

impl PreparedDetour {
    /// Address that behaves like the unpatched function
    pub fn trampoline(&self) -> usize {
        self.trampoline.address()
    }

    /// Writes the jump over the target. Dropping the returned guard removes it again.
    ///
    /// The page protection calls made here run with the trampoline already complete, so a
    /// replacement reached through them can forward to it.
    ///
    /// # Safety
    ///
    /// No other thread may be executing the bytes of the target that get replaced
    pub unsafe fn apply(self) -> Result<DetourGuard, HookError> {
        let Self {
            target,
            destination,
            patch,
            trampoline,
        } = self;
        let guard = CODE_PATCHER
            .patch(to_mut(target as *const u8), &patch)
            .map_err(|e| HookError::from_permission(target, e))?;

        debug!(
            function = format_args!("{target:#x}"),
            replacement = format_args!("{destination:#x}"),
            trampoline = format_args!("{:#x}", trampoline.address()),
            patched = patch.len(),
            "detour applied"
        );

        Ok(DetourGuard {
            target,
            patch: guard,
            trampoline,
        })
    }
}

/// Guard for an applied detour
///
/// Dropping the guard writes the saved bytes back and then frees the trampoline. No thread may be
/// executing either region at that point.
pub struct DetourGuard {
    /// Patched function
    target: usize,
    /// Jump patch. Declared before `trampoline` so the target is restored before the trampoline is freed
    patch: PermissionWrapperGuard<BytePatchGuard>,
    /// Relocated prologue
    trampoline: Trampoline,
}

impl DetourGuard {
    /// Address of the patched function
    pub fn target(&self) -> usize {
        self.target
    }

    /// Address that behaves like the unpatched function
    pub fn trampoline(&self) -> usize {
        self.trampoline.address()
    }

    /// Bytes the patch replaced
    pub fn original_bytes(&self) -> &[u8] {
        self.patch.original()
    }

    /// Writes the saved bytes back but keeps the trampoline alive, for callers that still have to
    /// unpublish it before it is freed
    pub fn restore(self) -> Trampoline {
        let Self {
            patch, trampoline, ..
        } = self;
        patch.restore();
        trampoline
    }
}

unsafe impl HookGuard for DetourGuard {}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::fixtures::{self, AddFn, Assembled};

    static DOUBLED_ORIGINAL: AtomicUsize = AtomicUsize::new(0);
    static DOUBLED_CALLS: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn doubled(a: i32, b: i32) -> i32 {
        DOUBLED_CALLS.fetch_add(1, Ordering::SeqCst);
        let original: AddFn =
            unsafe { std::mem::transmute(DOUBLED_ORIGINAL.load(Ordering::SeqCst)) };
        original(a, b) * 2
    }

    extern "C" fn constant(_: i32, _: i32) -> i32 {
        -1
    }

    #[test]
    /// add(3, 4) goes through the replacement while hooked and is back to normal after
    fn test_detour_redirects_and_restores() {
        let code = Assembled::new(doubled as usize, fixtures::ADD);
        let add: AddFn = unsafe { std::mem::transmute(code.address()) };
        assert_eq!(add(3, 4), 7);

        let guard = unsafe {
            DetourHook::<X64>::new()
                .hook(code.address() as _, doubled as _)
                .unwrap()
        };
        DOUBLED_ORIGINAL.store(guard.trampoline(), Ordering::SeqCst);

        assert_eq!(add(3, 4), 14);
        assert_eq!(DOUBLED_CALLS.load(Ordering::SeqCst), 1);

        guard.unhook();
        assert_eq!(add(3, 4), 7);
        assert_eq!(DOUBLED_CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    /// The patch covers whole instructions and removing it restores every byte
    fn test_detour_restores_bytes() {
        let code = Assembled::new(constant as usize, fixtures::ADD);
        let guard = unsafe {
            DetourHook::<X64>::new()
                .hook(code.address() as _, constant as _)
                .unwrap()
        };

        assert_eq!(guard.target(), code.address());
        assert_eq!(guard.original_bytes(), &fixtures::ADD[..6]);
        let patched = code.bytes(6);
        assert_eq!(patched[0], 0xe9);
        assert_eq!(patched[5], X64::FILL);

        drop(guard);
        assert_eq!(code.bytes(fixtures::ADD.len()), fixtures::ADD);
    }

    #[test]
    /// A target can be hooked again once its previous detour is gone
    fn test_detour_rehook() {
        let code = Assembled::new(constant as usize, fixtures::ADD);
        let add: AddFn = unsafe { std::mem::transmute(code.address()) };
        let hook = DetourHook::<X64>::new();

        for _ in 0..2 {
            let guard = unsafe { hook.hook(code.address() as _, constant as _).unwrap() };
            assert_eq!(add(1, 2), -1);

            let original: AddFn = unsafe { std::mem::transmute(guard.trampoline()) };
            assert_eq!(original(1, 2), 3);
            drop(guard);
        }
        assert_eq!(add(1, 2), 3);
    }

    #[test]
    /// Functions shorter than the jump are left untouched
    fn test_detour_too_small() {
        let code = Assembled::new(constant as usize, fixtures::TINY);
        let error = unsafe {
            DetourHook::<X64>::new()
                .hook(code.address() as _, constant as _)
                .err()
                .unwrap()
        };

        assert_eq!(error.code(), crate::error::ErrorCode::TargetTooSmall);
        assert_eq!(code.bytes(fixtures::TINY.len()), fixtures::TINY);
    }

    #[test]
    /// A prepared detour has a working trampoline while the target is still untouched
    fn test_prepare_then_apply() {
        let code = Assembled::new(constant as usize, fixtures::ADD);
        let add: AddFn = unsafe { std::mem::transmute(code.address()) };

        let prepared = unsafe {
            DetourHook::<X64>::new()
                .prepare(code.address() as _, constant as _)
                .unwrap()
        };
        let original: AddFn = unsafe { std::mem::transmute(prepared.trampoline()) };
        assert_eq!(code.bytes(fixtures::ADD.len()), fixtures::ADD);
        assert_eq!(original(2, 2), 4);

        let guard = unsafe { prepared.apply().unwrap() };
        assert_eq!(add(2, 2), -1);
        assert_eq!(original(2, 2), 4);

        let trampoline = guard.restore();
        assert_eq!(code.bytes(fixtures::ADD.len()), fixtures::ADD);
        assert_eq!(original(2, 2), 4);
        drop(trampoline);
        assert_eq!(add(2, 2), 4);
    }
}
