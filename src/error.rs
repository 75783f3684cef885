//! # Error
//!
//! Error category shared by every hook, and the process-wide channel that collects
//! installation failures so one pass reports all faulty hooks.

use std::convert::Infallible;
use std::fmt::{self, Display};
use std::sync::Mutex;

use lazy_static::lazy_static;
use thiserror::Error;

use crate::alloc::proximity::ProximityError;
use crate::patcher::mem::PermissionError;
use crate::resolve::ResolveFailure;

/// Named error codes exposed to consumers of the install channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// No code address could be derived from the bound reference
    AddressResolutionFailed,
    /// The target does not hold enough whole instructions for the jump patch
    TargetTooSmall,
    /// The target address already carries a detour
    AlreadyHooked,
    /// No executable memory was available near the target
    TrampolineAllocationFailed,
    /// A shadow table slot index is past the end of the table
    ShadowTableIndexOutOfRange,
    /// The stolen prologue could not be moved into the trampoline
    RelocationFailed,
    /// Page protections could not be changed around a patch
    MemoryProtectionFailed,
    /// No offset profile exists for the running binary
    UnsupportedVersion,
    /// The registry no longer accepts new hooks
    RegistryFrozen,
}

impl ErrorCode {
    /// Stable name of the code
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddressResolutionFailed => "AddressResolutionFailed",
            Self::TargetTooSmall => "TargetTooSmall",
            Self::AlreadyHooked => "AlreadyHooked",
            Self::TrampolineAllocationFailed => "TrampolineAllocationFailed",
            Self::ShadowTableIndexOutOfRange => "ShadowTableIndexOutOfRange",
            Self::RelocationFailed => "RelocationFailed",
            Self::MemoryProtectionFailed => "MemoryProtectionFailed",
            Self::UnsupportedVersion => "UnsupportedVersion",
            Self::RegistryFrozen => "RegistryFrozen",
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors raised while resolving, installing or removing hooks
#[derive(Debug, Error)]
pub enum HookError {
    /// The bound reference did not yield a code address
    #[error("unable to resolve address of `{target}`: {reason}")]
    AddressResolutionFailed {
        /// Name of the target
        target: &'static str,
        /// Why resolution failed
        reason: ResolveFailure,
    },
    /// Not enough bytes before the end of the function to hold the patch
    #[error("target {address:#x} is too small: jump needs {required} bytes, function ends after {available}")]
    TargetTooSmall {
        /// Target address
        address: usize,
        /// Length of the jump patch
        required: usize,
        /// Bytes of whole instructions found before the function ended
        available: usize,
    },
    /// A detour is already installed at this address
    #[error("target {address:#x} is already hooked")]
    AlreadyHooked {
        /// Target address
        address: usize,
    },
    /// The proximity allocator could not place a trampoline
    #[error("unable to allocate trampoline near {origin:#x}: {source}")]
    TrampolineAllocationFailed {
        /// Address the trampoline had to be close to
        origin: usize,
        /// Allocator error
        #[source]
        source: ProximityError,
    },
    /// Slot index past the declared table size
    #[error("slot {index} is out of range for a table of {len} slots")]
    ShadowTableIndexOutOfRange {
        /// Requested slot
        index: usize,
        /// Declared number of method slots
        len: usize,
    },
    /// Instruction decoding or re-encoding failed
    #[error("unable to relocate prologue of {address:#x}: {reason}")]
    RelocationFailed {
        /// Target address
        address: usize,
        /// Decoder or encoder message
        reason: String,
    },
    /// Changing page permissions failed
    #[error("unable to change memory protection at {address:#x}: {source}")]
    MemoryProtectionFailed {
        /// Patched address
        address: usize,
        /// Underlying region error
        #[source]
        source: region::Error,
    },
    /// No offset profile matches the running binary
    #[error("no offset profile for {platform} binary version `{version}`")]
    UnsupportedVersion {
        /// Platform name
        platform: &'static str,
        /// Version reported by the host
        version: String,
    },
    /// Registration attempted after the install phase ended
    #[error("hook registry is frozen, `{target}` cannot be registered")]
    RegistryFrozen {
        /// Name of the rejected target
        target: &'static str,
    },
}

impl HookError {
    /// Category code of this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AddressResolutionFailed { .. } => ErrorCode::AddressResolutionFailed,
            Self::TargetTooSmall { .. } => ErrorCode::TargetTooSmall,
            Self::AlreadyHooked { .. } => ErrorCode::AlreadyHooked,
            Self::TrampolineAllocationFailed { .. } => ErrorCode::TrampolineAllocationFailed,
            Self::ShadowTableIndexOutOfRange { .. } => ErrorCode::ShadowTableIndexOutOfRange,
            Self::RelocationFailed { .. } => ErrorCode::RelocationFailed,
            Self::MemoryProtectionFailed { .. } => ErrorCode::MemoryProtectionFailed,
            Self::UnsupportedVersion { .. } => ErrorCode::UnsupportedVersion,
            Self::RegistryFrozen { .. } => ErrorCode::RegistryFrozen,
        }
    }

    /// Maps a patcher failure at `address` onto the hook error category
    pub(crate) fn from_permission(address: usize, error: PermissionError<Infallible>) -> Self {
        match error {
            PermissionError::ProtectionError(source) => {
                Self::MemoryProtectionFailed { address, source }
            }
            PermissionError::CustomError(never) => match never {},
        }
    }
}

/// One failed hook as recorded in the error channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Name of the hook that failed
    pub hook: &'static str,
    /// Category of the failure
    pub code: ErrorCode,
    /// Rendered error message
    pub message: String,
}

impl Failure {
    /// Records `error` against the hook `hook`
    pub fn new(hook: &'static str, error: &HookError) -> Self {
        Self {
            hook,
            code: error.code(),
            message: error.to_string(),
        }
    }
}

impl Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.code, self.hook, self.message)
    }
}

lazy_static! {
    /// Process-wide error channel filled by [`crate::install`]
    static ref CHANNEL: Mutex<Vec<Failure>> = Mutex::new(Vec::new());
}

/// Appends failures to the process-wide channel
pub(crate) fn publish(failures: impl IntoIterator<Item = Failure>) {
    let mut channel = CHANNEL.lock().unwrap_or_else(|e| e.into_inner());
    channel.extend(failures);
}

/// Snapshot of every failure collected by the install pass
pub fn failures() -> Vec<Failure> {
    CHANNEL.lock().unwrap_or_else(|e| e.into_inner()).clone()
}
