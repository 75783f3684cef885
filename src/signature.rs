//! # Signature
//!
//! Calling shapes of hookable functions. A [`Signature`] names the function as it is declared
//! (a free function, or a method with an implicit receiver) and maps it to the raw `extern "C"`
//! shapes used to call the original: the receiver becomes an explicit first parameter, and the RVO
//! shape adds a result-storage pointer right after it.

use std::marker::PhantomData;

/// How a function receives its object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Receiver {
    /// Free function
    None,
    /// Method on a mutable receiver
    Mut,
    /// Method on a const receiver
    Const,
}

/// Raw function pointers that can be rebuilt from a code address
///
/// # Safety
///
/// Implementors must be pointer-sized function pointers
pub unsafe trait RawFn: Copy + 'static {
    /// Reinterprets `address` as this function pointer type
    ///
    /// # Safety
    ///
    /// `address` must point to code that follows this calling shape
    unsafe fn from_address(address: usize) -> Self;

    /// Address of the function
    fn address(self) -> usize;
}

/// A declared hookable function
pub trait Signature: 'static {
    /// Receiver kind of the declaration
    const RECEIVER: Receiver;
    /// Shape used to call the original implementation
    type Original: RawFn;
    /// Shape used to call an original that returns its result through caller-provided storage
    type OriginalRvo: RawFn;
}

/// Method of `C` with the non-receiver signature `F`, for example `Method<Level, fn(i32) -> bool>`
pub struct Method<C, F>(PhantomData<(fn() -> *mut C, F)>);

/// Method of `C` called on a const receiver
pub struct ConstMethod<C, F>(PhantomData<(fn() -> *const C, F)>);

macro_rules! impl_raw_fn {
    ($($arg:ident),*) => {
        unsafe impl<Ret: 'static, $($arg: 'static),*> RawFn for extern "C" fn($($arg),*) -> Ret {
            unsafe fn from_address(address: usize) -> Self {
                std::mem::transmute(address as *const ())
            }

            fn address(self) -> usize {
                self as usize
            }
        }

        unsafe impl<Ret: 'static, $($arg: 'static),*> RawFn for unsafe extern "C" fn($($arg),*) -> Ret {
            unsafe fn from_address(address: usize) -> Self {
                std::mem::transmute(address as *const ())
            }

            fn address(self) -> usize {
                self as usize
            }
        }
    };
}

impl_raw_fn!();
impl_raw_fn!(A0);
impl_raw_fn!(A0, A1);
impl_raw_fn!(A0, A1, A2);
impl_raw_fn!(A0, A1, A2, A3);
impl_raw_fn!(A0, A1, A2, A3, A4);
impl_raw_fn!(A0, A1, A2, A3, A4, A5);
impl_raw_fn!(A0, A1, A2, A3, A4, A5, A6);
impl_raw_fn!(A0, A1, A2, A3, A4, A5, A6, A7);
impl_raw_fn!(A0, A1, A2, A3, A4, A5, A6, A7, A8);
impl_raw_fn!(A0, A1, A2, A3, A4, A5, A6, A7, A8, A9);

macro_rules! impl_signature {
    ($($arg:ident),*) => {
        impl<Ret: 'static, $($arg: 'static),*> Signature for extern "C" fn($($arg),*) -> Ret {
            const RECEIVER: Receiver = Receiver::None;
            type Original = Self;
            type OriginalRvo = extern "C" fn(*mut Ret, $($arg),*) -> *mut Ret;
        }

        impl<Ret: 'static, $($arg: 'static),*> Signature for unsafe extern "C" fn($($arg),*) -> Ret {
            const RECEIVER: Receiver = Receiver::None;
            type Original = Self;
            type OriginalRvo = unsafe extern "C" fn(*mut Ret, $($arg),*) -> *mut Ret;
        }

        impl<Class: 'static, Ret: 'static, $($arg: 'static),*> Signature for Method<Class, fn($($arg),*) -> Ret> {
            const RECEIVER: Receiver = Receiver::Mut;
            type Original = extern "C" fn(*mut Class, $($arg),*) -> Ret;
            type OriginalRvo = extern "C" fn(*mut Class, *mut Ret, $($arg),*) -> *mut Ret;
        }

        impl<Class: 'static, Ret: 'static, $($arg: 'static),*> Signature for ConstMethod<Class, fn($($arg),*) -> Ret> {
            const RECEIVER: Receiver = Receiver::Const;
            type Original = extern "C" fn(*const Class, $($arg),*) -> Ret;
            type OriginalRvo = extern "C" fn(*const Class, *mut Ret, $($arg),*) -> *mut Ret;
        }
    };
}

impl_signature!();
impl_signature!(A0);
impl_signature!(A0, A1);
impl_signature!(A0, A1, A2);
impl_signature!(A0, A1, A2, A3);
impl_signature!(A0, A1, A2, A3, A4);
impl_signature!(A0, A1, A2, A3, A4, A5);
impl_signature!(A0, A1, A2, A3, A4, A5, A6);
impl_signature!(A0, A1, A2, A3, A4, A5, A6, A7);
