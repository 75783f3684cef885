#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

#[cfg(not(target_arch = "x86_64"))]
compile_error!("rehook only patches x86_64 code");

pub mod alloc;
pub mod code;
pub mod config;
pub mod error;
pub mod hook;
pub mod host;
pub mod install;
pub mod layout;
pub mod original;
pub mod patcher;
pub mod registry;
pub mod resolve;
pub mod signature;
pub mod vtable;

#[cfg(test)]
mod fixtures;

pub use crate::config::{Platform, Profile, Profiles};
pub use crate::error::{failures, ErrorCode, Failure, HookError};
pub use crate::host::{Host, ProcessHost};
pub use crate::install::{configure, install, InstallContext, Installer};
pub use crate::original::{get_original, get_original_rvo, try_get_original, try_get_original_rvo};
pub use crate::registry::{HookRecord, HookState, Registry};
pub use crate::resolve::{Locator, MemberPointer, Target, TargetId};
pub use crate::signature::{ConstMethod, Method, Receiver, Signature};
pub use crate::vtable::ShadowTable;

#[doc(hidden)]
pub mod __private {
    pub use linkme;
}

/// Calls the original implementation of a target, with the receiver (if any) first
///
/// # Safety
///
/// The call goes through a function pointer rebuilt from an address, so it must be made in an
/// `unsafe` context: the target must be declared with the signature of the function it resolves
/// to, and the arguments must satisfy that function's contract.
///
/// ```no_run
/// use rehook::{call_original, Target};
///
/// static TICK: Target<extern "C" fn(u32) -> u32> = Target::symbol("tick");
///
/// extern "C" fn tick(ticks: u32) -> u32 {
///     unsafe { call_original!(TICK, ticks) + 1 }
/// }
/// # rehook::register_detour!(TICK_HOOK, TICK, tick);
/// ```
///
/// Outside of `unsafe` the call is rejected:
///
/// ```compile_fail
/// use rehook::{call_original, Target};
///
/// static TICK: Target<extern "C" fn(u32) -> u32> = Target::symbol("tick");
///
/// extern "C" fn tick(ticks: u32) -> u32 {
///     call_original!(TICK, ticks) + 1
/// }
/// ```
#[macro_export]
macro_rules! call_original {
    ($target:expr $(, $arg:expr)* $(,)?) => {{
        let original = $crate::get_original(&$target);
        original($($arg),*)
    }};
}

/// Calls the original implementation of a target that returns through caller-provided storage
///
/// The storage pointer follows the receiver, or comes first for free functions.
///
/// # Safety
///
/// As for [`call_original!`], and the function must really return through a hidden pointer.
///
/// ```compile_fail
/// use rehook::{call_original_rvo, Target};
///
/// static MAKE: Target<extern "C" fn(u32) -> u64> = Target::symbol("make");
///
/// fn make(out: *mut u64) -> *mut u64 {
///     call_original_rvo!(MAKE, out, 1)
/// }
/// ```
#[macro_export]
macro_rules! call_original_rvo {
    ($target:expr $(, $arg:expr)* $(,)?) => {{
        let original = $crate::get_original_rvo(&$target);
        original($($arg),*)
    }};
}

/// Registers a function that runs during [`install`]
///
/// ```no_run
/// use rehook::{register_installer, InstallContext, HookError};
///
/// register_installer!(LOG_START, |_context: &mut InstallContext<'_>| -> Result<(), HookError> {
///     Ok(())
/// });
/// ```
#[macro_export]
macro_rules! register_installer {
    ($name:ident, $install:expr) => {
        #[$crate::__private::linkme::distributed_slice($crate::install::INSTALLERS)]
        #[linkme(crate = $crate::__private::linkme)]
        static $name: $crate::install::Installer =
            $crate::install::Installer::new(stringify!($name), $install);
    };
}

/// Registers a detour of `target` to `replacement`, applied by [`install`]
///
/// The replacement takes the receiver as its first argument. With `rvo`, it takes the result
/// storage pointer right after the receiver and returns it.
#[macro_export]
macro_rules! register_detour {
    ($name:ident, $target:expr, rvo $replacement:expr) => {
        $crate::register_installer!($name, |context| unsafe {
            context.detour_rvo(&$target, $replacement)
        });
    };
    ($name:ident, $target:expr, $replacement:expr) => {
        $crate::register_installer!($name, |context| unsafe {
            context.detour(&$target, $replacement)
        });
    };
}
