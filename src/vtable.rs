//! # Virtual Table Shadow
//!
//! Hooks virtual methods without touching code or the binary's read-only tables. A
//! [`ShadowTable`] is an owned copy of a class's dispatch table with some slots replaced;
//! installing it swaps the table pointer at the start of a receiver for a pointer into the copy.
//! Receivers keep their original table until they are installed individually, so a shadow can be
//! applied to one object or to every object of a class.

use std::any::TypeId;
use std::collections::HashMap;
use std::ffi::c_void;
use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use lazy_static::lazy_static;
use tracing::debug;

use crate::error::HookError;
use crate::signature::RawFn;

/// Itanium ABI entries stored in front of the first method slot
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TableHeader {
    /// Offset from this sub-object to the start of the complete object
    pub offset_to_top: isize,
    /// Pointer to the class's `std::type_info`
    pub type_info: *const c_void,
}

crate::assert_layout!(TableHeader, windows = 16, other = 16);

/// Slots copied from in front of the table pointer. MSVC keeps nothing there that dispatch needs.
#[cfg(windows)]
pub const HEADER_SLOTS: usize = 0;
/// Slots copied from in front of the table pointer
#[cfg(not(windows))]
pub const HEADER_SLOTS: usize = mem::size_of::<TableHeader>() / mem::size_of::<usize>();

lazy_static! {
    /// First table observed per receiver type
    static ref ORIGINAL_TABLES: Mutex<HashMap<TypeId, usize>> = Mutex::new(HashMap::new());
}

/// Genuine table for `T`. The first table seen for a type is remembered, so receivers that already
/// carry a shadow still lead back to the binary's own table.
fn original_table<T: 'static>(observed: *const usize) -> *const usize {
    let mut tables = ORIGINAL_TABLES.lock().unwrap_or_else(|e| e.into_inner());
    *tables
        .entry(TypeId::of::<T>())
        .or_insert(observed as usize) as *const usize
}

/// Copy of the dispatch table of `T`, holding `SLOTS` methods
///
/// # Safety
///
/// Receivers installed with [`ShadowTable::install`] point into the copy, and dropping the shadow
/// does not give them their table back. Uninstall every receiver before the shadow goes away, or
/// use [`ShadowTable::leak`] for shadows that live as long as the process.
pub struct ShadowTable<T, const SLOTS: usize> {
    /// Header followed by the method slots
    slots: Box<[AtomicUsize]>,
    /// First method slot of the table the copy was taken from
    original: *const usize,
    /// Placeholder for receiver type
    _receiver: PhantomData<fn(*mut T)>,
}

// SAFETY: `original` points into the binary's read-only tables, which are never written
unsafe impl<T, const SLOTS: usize> Send for ShadowTable<T, SLOTS> {}
unsafe impl<T, const SLOTS: usize> Sync for ShadowTable<T, SLOTS> {}

impl<T: 'static, const SLOTS: usize> ShadowTable<T, SLOTS> {
    /// Copies the table of `receiver`
    ///
    /// # Safety
    ///
    /// `receiver` must point to a live object whose first field is its table pointer, and the table
    /// must hold at least `SLOTS` methods
    pub unsafe fn new(receiver: *const T) -> Self {
        let observed = *(receiver as *const *const usize);
        Self::from_table(original_table::<T>(observed))
    }
}

impl<T, const SLOTS: usize> ShadowTable<T, SLOTS> {
    /// Copies the table whose first method slot is at `table`
    ///
    /// # Safety
    ///
    /// `table` must be preceded by [`HEADER_SLOTS`] header entries and followed by at least `SLOTS`
    /// method slots
    pub unsafe fn from_table(table: *const usize) -> Self {
        const { assert!(SLOTS > 0, "a shadow table needs at least one slot") };

        let start = table.sub(HEADER_SLOTS);
        let slots = (0..HEADER_SLOTS + SLOTS)
            .map(|i| AtomicUsize::new(start.add(i).read()))
            .collect();
        debug!(
            table = ?table,
            slots = SLOTS,
            header = HEADER_SLOTS,
            "copied dispatch table"
        );

        Self {
            slots,
            original: table,
            _receiver: PhantomData,
        }
    }

    /// Keeps the shadow alive for the rest of the process, so installed receivers can never be
    /// left with a dangling table
    pub fn leak(self) -> &'static Self
    where
        T: 'static,
    {
        Box::leak(Box::new(self))
    }

    /// Number of method slots
    pub const fn len(&self) -> usize {
        SLOTS
    }

    /// Always false, empty tables are rejected at build time
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Address receivers point at while the shadow is installed
    pub fn table(&self) -> *const usize {
        self.slots[HEADER_SLOTS..].as_ptr() as *const usize
    }

    /// First method slot of the genuine table
    pub fn original_table(&self) -> *const usize {
        self.original
    }

    /// Header entries copied from in front of the genuine table
    pub fn header(&self) -> Vec<usize> {
        self.slots[..HEADER_SLOTS]
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .collect()
    }

    /// Checks `index` against the declared slot count
    fn check(index: usize) -> Result<(), HookError> {
        if index < SLOTS {
            Ok(())
        } else {
            Err(HookError::ShadowTableIndexOutOfRange { index, len: SLOTS })
        }
    }

    /// Points slot `INDEX` at `replacement` and returns the method it replaced
    pub fn hook<const INDEX: usize>(&self, replacement: usize) -> usize {
        const { assert!(INDEX < SLOTS, "slot index is past the end of the table") };
        self.replace(INDEX, replacement)
    }

    /// Points slot `index` at `replacement` and returns the method it replaced
    pub fn try_hook(&self, index: usize, replacement: usize) -> Result<usize, HookError> {
        Self::check(index)?;
        Ok(self.replace(index, replacement))
    }

    /// Puts the genuine method back into slot `index`
    pub fn unhook(&self, index: usize) -> Result<(), HookError> {
        let original = self.original(index)?;
        self.replace(index, original);
        Ok(())
    }

    /// Writes a slot of the copy
    fn replace(&self, index: usize, method: usize) -> usize {
        let previous = self.slots[HEADER_SLOTS + index].swap(method, Ordering::AcqRel);
        debug!(
            slot = index,
            method = format_args!("{method:#x}"),
            previous = format_args!("{previous:#x}"),
            "replaced shadow slot"
        );
        previous
    }

    /// Current method in slot `index` of the copy
    pub fn get(&self, index: usize) -> Result<usize, HookError> {
        Self::check(index)?;
        Ok(self.slots[HEADER_SLOTS + index].load(Ordering::Acquire))
    }

    /// Genuine method in slot `index`
    pub fn original(&self, index: usize) -> Result<usize, HookError> {
        Self::check(index)?;
        // SAFETY: `from_table` requires `SLOTS` readable slots after `original`
        Ok(unsafe { self.original.add(index).read() })
    }

    /// Genuine method in slot `index` as a callable function
    ///
    /// # Safety
    ///
    /// `F` must match the calling shape of the method, with the receiver first
    pub unsafe fn original_fn<F: RawFn>(&self, index: usize) -> Result<F, HookError> {
        self.original(index).map(|address| F::from_address(address))
    }

    /// Swaps the table pointer of `receiver` for the shadow
    ///
    /// # Safety
    ///
    /// `receiver` must point to a live object of the class this table was copied from, and the
    /// shadow must outlive every call dispatched through it
    ///
    /// # Panics
    ///
    /// Panics if `receiver` is not pointer aligned
    pub unsafe fn install(&self, receiver: *mut T) {
        Self::table_pointer(receiver).store(self.table() as usize, Ordering::Release);
    }

    /// Gives `receiver` its genuine table back
    ///
    /// # Safety
    ///
    /// See [`ShadowTable::install`]
    pub unsafe fn uninstall(&self, receiver: *mut T) {
        Self::table_pointer(receiver).store(self.original as usize, Ordering::Release);
    }

    /// Returns true if `receiver` dispatches through this shadow
    ///
    /// # Safety
    ///
    /// See [`ShadowTable::install`]
    pub unsafe fn is_installed(&self, receiver: *const T) -> bool {
        Self::table_pointer(receiver as *mut T).load(Ordering::Acquire) == self.table() as usize
    }

    /// Table pointer of `receiver`, swapped with one aligned store
    unsafe fn table_pointer<'a>(receiver: *mut T) -> &'a AtomicUsize {
        assert!(
            receiver as usize % mem::align_of::<AtomicUsize>() == 0,
            "receiver {receiver:p} is not pointer aligned"
        );
        &*(receiver as *const AtomicUsize)
    }
}
