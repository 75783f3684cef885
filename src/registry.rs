//! # Registry
//!
//! Process-wide record of every detour. The registry owns the detour guards, enforces one detour
//! per target address, and answers "where is the original" for replacement code at call time.
//!
//! Call-time lookups never take a lock: trampolines are published in a lock-free map before the
//! target is patched, and unpublished only after its bytes are restored. The bookkeeping lock is
//! never held while code is patched, so a replacement for a function the patcher itself calls
//! (`mprotect`, the allocator, a logging sink) can forward to its original during installation.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crossbeam_skiplist::SkipMap;
use lazy_static::lazy_static;
use tracing::debug;

use crate::code::x64::X64;
use crate::error::HookError;
use crate::hook::detour::{DetourGuard, DetourHook};
use crate::resolve::TargetId;

/// Lifecycle state of a hook record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    /// The detour is applied
    Installed,
    /// The detour was removed and its bytes restored
    Uninstalled,
}

/// What the registry knows about one detour
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookRecord {
    /// Name of the hook
    pub name: &'static str,
    /// Hooked function
    pub target: TargetId,
    /// Address the target jumps to
    pub replacement: usize,
    /// Address behaving like the unpatched target
    pub trampoline: usize,
    /// Bytes replaced by the patch
    pub original_bytes: Box<[u8]>,
    /// Lifecycle state
    pub state: HookState,
}

/// An applied detour
struct ActiveHook {
    /// Public record
    record: HookRecord,
    /// Guard that undoes the patch
    guard: DetourGuard,
}

/// Bookkeeping behind the registry lock
#[derive(Default)]
struct Book {
    /// Applied detours keyed by target address
    hooks: HashMap<usize, ActiveHook>,
    /// Addresses being patched right now
    pending: HashSet<usize>,
    /// Set once the install phase is over
    frozen: bool,
}

/// Map from target address to its active detour
pub struct Registry {
    /// Detours and reservations
    book: RwLock<Book>,
    /// Trampolines by target address, read by replacement code
    originals: SkipMap<usize, usize>,
}

lazy_static! {
    /// Registry used by [`crate::install`] and [`crate::get_original`]
    static ref GLOBAL: Registry = Registry::new();
}

impl Registry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self {
            book: RwLock::new(Book::default()),
            originals: SkipMap::new(),
        }
    }

    /// Process-wide registry
    pub fn global() -> &'static Registry {
        &GLOBAL
    }

    /// Shared access; a panic while holding the lock does not invalidate the book
    fn read(&self) -> RwLockReadGuard<'_, Book> {
        self.book.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Exclusive access
    fn write(&self) -> RwLockWriteGuard<'_, Book> {
        self.book.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Detours `target` to `replacement`
    ///
    /// The address is reserved under the lock, then patched without it. A detour that was
    /// admitted before [`Registry::freeze`] still completes.
    ///
    /// # Safety
    ///
    /// `target.address` must be the start of a function and `replacement` a function with the same
    /// calling shape. No other thread may be executing the start of the target.
    pub unsafe fn install_detour(
        &self,
        name: &'static str,
        target: TargetId,
        replacement: usize,
    ) -> Result<HookRecord, HookError> {
        let address = target.address;
        {
            let mut book = self.write();
            if book.frozen {
                return Err(HookError::RegistryFrozen { target: name });
            }
            if book.hooks.contains_key(&address) || !book.pending.insert(address) {
                return Err(HookError::AlreadyHooked { address });
            }
        }

        let applied = self.apply(address, replacement);

        let mut book = self.write();
        book.pending.remove(&address);
        let guard = applied?;
        let record = HookRecord {
            name,
            target,
            replacement,
            trampoline: guard.trampoline(),
            original_bytes: guard.original_bytes().into(),
            state: HookState::Installed,
        };
        book.hooks.insert(
            address,
            ActiveHook {
                record: record.clone(),
                guard,
            },
        );
        drop(book);

        debug!(
            hook = name,
            address = format_args!("{address:#x}"),
            "installed detour"
        );
        Ok(record)
    }

    /// Builds the trampoline, publishes it and patches the target
    unsafe fn apply(&self, address: usize, replacement: usize) -> Result<DetourGuard, HookError> {
        let prepared =
            DetourHook::<X64>::new().prepare(address as *const u8, replacement as *const u8)?;
        self.originals.insert(address, prepared.trampoline());
        prepared.apply().inspect_err(|_| {
            self.originals.remove(&address);
        })
    }

    /// Removes the detour at `address`, restoring the original bytes
    ///
    /// The trampoline stays published until the bytes are back, so a replacement reached while
    /// restoring still finds its original.
    ///
    /// # Safety
    ///
    /// No thread may be executing the patched bytes or the trampoline, nor call the original
    /// through a previously fetched trampoline address afterwards
    pub unsafe fn uninstall(&self, address: usize) -> Option<HookRecord> {
        let ActiveHook { mut record, guard } = self.write().hooks.remove(&address)?;

        let trampoline = guard.restore();
        self.originals.remove(&address);
        drop(trampoline);

        record.state = HookState::Uninstalled;
        debug!(
            hook = record.name,
            address = format_args!("{address:#x}"),
            "removed detour"
        );
        Some(record)
    }

    /// Trampoline of the detour at `address`, if any. Never blocks.
    pub fn original(&self, address: usize) -> Option<usize> {
        self.originals.get(&address).map(|entry| *entry.value())
    }

    /// Record of the detour at `address`, if any
    pub fn record(&self, address: usize) -> Option<HookRecord> {
        self.read()
            .hooks
            .get(&address)
            .map(|hook| hook.record.clone())
    }

    /// Records of every active detour
    pub fn records(&self) -> Vec<HookRecord> {
        self.read()
            .hooks
            .values()
            .map(|hook| hook.record.clone())
            .collect()
    }

    /// Number of active detours
    pub fn len(&self) -> usize {
        self.read().hooks.len()
    }

    /// Returns true if no detour is active
    pub fn is_empty(&self) -> bool {
        self.read().hooks.is_empty()
    }

    /// Stops accepting new detours. Uninstalling stays possible.
    pub fn freeze(&self) {
        self.write().frozen = true;
    }

    /// Returns true once [`Registry::freeze`] was called
    pub fn is_frozen(&self) -> bool {
        self.read().frozen
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::fixtures::{self, AddFn, Assembled};
    use crate::signature::Receiver;

    extern "C" fn negated(a: i32, b: i32) -> i32 {
        -(a + b)
    }

    extern "C" fn zero(_: i32, _: i32) -> i32 {
        0
    }

    fn free(address: usize) -> TargetId {
        TargetId {
            address,
            receiver: Receiver::None,
        }
    }

    #[test]
    /// A second detour on the same address fails and leaves the first one working
    fn test_already_hooked() {
        let registry = Registry::new();
        let code = Assembled::new(negated as usize, fixtures::ADD);
        let add: AddFn = unsafe { std::mem::transmute(code.address()) };

        let record = unsafe {
            registry
                .install_detour("first", free(code.address()), negated as usize)
                .unwrap()
        };
        assert_eq!(record.state, HookState::Installed);
        assert_eq!(record.original_bytes.as_ref(), &fixtures::ADD[..6]);

        let error = unsafe {
            registry
                .install_detour("second", free(code.address()), zero as usize)
                .unwrap_err()
        };
        assert_eq!(error.code(), ErrorCode::AlreadyHooked);

        assert_eq!(add(3, 4), -7);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.record(code.address()).unwrap().name, "first");

        unsafe { registry.uninstall(code.address()) };
    }

    #[test]
    /// Uninstalling restores the bytes, and the address can then be hooked afresh
    fn test_uninstall_and_reinstall() {
        let registry = Registry::new();
        let code = Assembled::new(negated as usize, fixtures::ADD);
        let add: AddFn = unsafe { std::mem::transmute(code.address()) };

        let installed = unsafe {
            registry
                .install_detour("negated", free(code.address()), negated as usize)
                .unwrap()
        };
        let original: AddFn = unsafe { std::mem::transmute(installed.trampoline) };
        assert_eq!(registry.original(code.address()), Some(installed.trampoline));
        assert_eq!(original(3, 4), 7);
        assert_eq!(add(3, 4), -7);

        let removed = unsafe { registry.uninstall(code.address()).unwrap() };
        assert_eq!(removed.state, HookState::Uninstalled);
        assert_eq!(code.bytes(fixtures::ADD.len()), fixtures::ADD);
        assert_eq!(add(3, 4), 7);
        assert!(registry.is_empty());
        assert_eq!(registry.original(code.address()), None);
        assert!(unsafe { registry.uninstall(code.address()) }.is_none());

        unsafe {
            registry
                .install_detour("zero", free(code.address()), zero as usize)
                .unwrap()
        };
        assert_eq!(add(3, 4), 0);
        unsafe { registry.uninstall(code.address()) };
        assert_eq!(add(3, 4), 7);
    }

    #[test]
    /// A frozen registry refuses new detours but still removes existing ones
    fn test_frozen() {
        let registry = Registry::new();
        let code = Assembled::new(zero as usize, fixtures::ADD);
        let add: AddFn = unsafe { std::mem::transmute(code.address()) };

        unsafe {
            registry
                .install_detour("zero", free(code.address()), zero as usize)
                .unwrap()
        };
        registry.freeze();
        assert!(registry.is_frozen());

        let other = Assembled::new(zero as usize, fixtures::ADD);
        let error = unsafe {
            registry
                .install_detour("late", free(other.address()), zero as usize)
                .unwrap_err()
        };
        assert_eq!(error.code(), ErrorCode::RegistryFrozen);

        assert!(unsafe { registry.uninstall(code.address()) }.is_some());
        assert_eq!(add(1, 1), 2);
    }

    #[test]
    /// Failed installs leave no record behind
    fn test_failed_install_not_recorded() {
        let registry = Registry::new();
        let code = Assembled::new(zero as usize, fixtures::TINY);

        let error = unsafe {
            registry
                .install_detour("tiny", free(code.address()), zero as usize)
                .unwrap_err()
        };
        assert_eq!(error.code(), ErrorCode::TargetTooSmall);
        assert!(registry.records().is_empty());
    }

    #[test]
    /// Replacement code finds its original even while the bookkeeping lock is taken
    fn test_original_does_not_wait_for_writer() {
        let registry = Registry::new();
        let code = Assembled::new(negated as usize, fixtures::ADD);

        let record = unsafe {
            registry
                .install_detour("negated", free(code.address()), negated as usize)
                .unwrap()
        };

        let book = registry.write();
        assert_eq!(registry.original(code.address()), Some(record.trampoline));
        let original: AddFn = unsafe { std::mem::transmute(record.trampoline) };
        assert_eq!(original(3, 4), 7);
        drop(book);

        unsafe { registry.uninstall(code.address()) };
        assert_eq!(registry.original(code.address()), None);
    }

    #[test]
    /// Once `freeze` has returned, no install can slip through
    fn test_freeze_racing_installs() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let registry = Registry::new();
        let frozen = AtomicBool::new(false);
        let functions: Vec<_> = (0..8)
            .map(|_| Assembled::new(zero as usize, fixtures::ADD))
            .collect();

        let outcomes: Vec<_> = std::thread::scope(|scope| {
            let workers: Vec<_> = functions
                .iter()
                .map(|code| {
                    let registry = &registry;
                    let frozen = &frozen;
                    scope.spawn(move || {
                        let after_freeze = frozen.load(Ordering::SeqCst);
                        let result = unsafe {
                            registry.install_detour("racer", free(code.address()), zero as usize)
                        };
                        (after_freeze, result.map_err(|e| e.code()))
                    })
                })
                .collect();

            registry.freeze();
            frozen.store(true, Ordering::SeqCst);
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        let mut installed = 0;
        for (after_freeze, result) in outcomes {
            match result {
                Ok(_) => {
                    assert!(!after_freeze);
                    installed += 1;
                }
                Err(code) => assert_eq!(code, ErrorCode::RegistryFrozen),
            }
        }
        assert_eq!(registry.len(), installed);

        for code in &functions {
            unsafe { registry.uninstall(code.address()) };
            let add: AddFn = unsafe { std::mem::transmute(code.address()) };
            assert_eq!(add(2, 3), 5);
        }
    }
}
