//! # Resolve
//!
//! Turns a bound function reference into the code address that gets hooked.
//!
//! A [`Target`] is declared once, usually as a `static`, and names where its function lives: an
//! absolute address, an exported symbol, an offset taken from the selected [`Profile`], a raw
//! member function pointer, or an address bound at runtime. Resolution results are cached in the
//! target.

use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::sync::OnceLock;

use thiserror::Error;
use tracing::trace;

use crate::config::Profile;
use crate::error::HookError;
use crate::host::{Host, ProcessHost};
use crate::signature::{Receiver, Signature};

/// Why a target did not resolve
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveFailure {
    /// A runtime-bound target was used before [`Target::bind`]
    #[error("address was never bound")]
    Unbound,
    /// The host does not export the symbol
    #[error("symbol `{0}` not found")]
    SymbolNotFound(&'static str),
    /// An offset target was resolved without a selected profile
    #[error("no offset profile selected")]
    NoProfile,
    /// The selected profile has no entry for the key
    #[error("no offset for `{0}` in the selected profile")]
    MissingOffset(&'static str),
    /// The host could not report the module base
    #[error("module base unavailable")]
    ModuleBaseUnavailable,
    /// The member function pointer is null
    #[error("null member function pointer")]
    NullMember,
    /// The member function pointer adjusts `this` (multiple inheritance)
    #[error("member function pointer adjusts the receiver by {0} bytes")]
    AdjustedMember(isize),
}

/// Identity of a hook target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId {
    /// Code address
    pub address: usize,
    /// Receiver kind, so const and non-const overloads stay distinct
    pub receiver: Receiver,
}

/// Raw member function pointer as laid out by the C++ ABI of the hooked binary
///
/// On Itanium, `ptr` is either the function address or one plus the vtable offset of a virtual
/// function, and `adj` is the receiver adjustment. On MSVC the pointer is a code address, possibly
/// of a vcall thunk, followed by a 32-bit adjustment for multiple inheritance.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberPointer {
    /// Function address or virtual offset
    ptr: usize,
    /// Receiver adjustment
    #[cfg(not(windows))]
    adj: isize,
    /// Receiver adjustment
    #[cfg(windows)]
    adj: i32,
}

crate::assert_layout!(MemberPointer, windows = 16, other = 16);

impl MemberPointer {
    /// Member pointer with no receiver adjustment
    pub const fn new(ptr: usize) -> Self {
        Self { ptr, adj: 0 }
    }

    /// Member pointer with an explicit receiver adjustment
    #[cfg(not(windows))]
    pub const fn with_adjustment(ptr: usize, adj: isize) -> Self {
        Self { ptr, adj }
    }

    /// Member pointer with an explicit receiver adjustment
    #[cfg(windows)]
    pub const fn with_adjustment(ptr: usize, adj: i32) -> Self {
        Self { ptr, adj }
    }

    /// Code address the member pointer calls
    ///
    /// # Panics
    ///
    /// Panics on an Itanium virtual member pointer. Virtual functions are hooked through a
    /// [`ShadowTable`](crate::vtable::ShadowTable) instead.
    pub fn address(&self) -> Result<usize, ResolveFailure> {
        if self.ptr == 0 {
            return Err(ResolveFailure::NullMember);
        }
        #[cfg(not(windows))]
        if self.ptr & 1 == 1 {
            panic!(
                "member pointer refers to virtual slot at offset {:#x}, hook it through a shadow table",
                self.ptr - 1
            );
        }
        if self.adj != 0 {
            return Err(ResolveFailure::AdjustedMember(self.adj as isize));
        }
        Ok(self.ptr)
    }
}

/// Where a [`Target`] lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locator {
    /// Absolute code address
    Address(usize),
    /// Exported symbol
    Symbol(&'static str),
    /// Key of an offset from the module base in the selected profile
    Offset(&'static str),
    /// Raw member function pointer
    Member(MemberPointer),
    /// Address supplied at runtime with [`Target::bind`]
    Bound,
}

/// Bound reference to a hookable function with signature `S`
pub struct Target<S: Signature> {
    /// Name used in logs and failure reports
    name: &'static str,
    /// Where the function lives
    locator: Locator,
    /// Cached code address
    resolved: OnceLock<usize>,
    /// Placeholder for the signature
    _signature: PhantomData<fn() -> S>,
}

impl<S: Signature> Target<S> {
    /// Target with a known locator
    pub const fn new(name: &'static str, locator: Locator) -> Self {
        Self {
            name,
            locator,
            resolved: OnceLock::new(),
            _signature: PhantomData,
        }
    }

    /// Function at an absolute address
    pub const fn address(name: &'static str, address: usize) -> Self {
        Self::new(name, Locator::Address(address))
    }

    /// Exported function named `symbol`
    pub const fn symbol(symbol: &'static str) -> Self {
        Self::new(symbol, Locator::Symbol(symbol))
    }

    /// Function at the profile offset stored under `key`
    pub const fn offset(key: &'static str) -> Self {
        Self::new(key, Locator::Offset(key))
    }

    /// Function behind a raw member function pointer
    pub const fn member(name: &'static str, member: MemberPointer) -> Self {
        Self::new(name, Locator::Member(member))
    }

    /// Function whose address is supplied later with [`Target::bind`]
    pub const fn bound(name: &'static str) -> Self {
        Self::new(name, Locator::Bound)
    }

    /// Name of the target
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Where the target lives
    pub fn locator(&self) -> Locator {
        self.locator
    }

    /// Supplies the address of the target. Returns false if it was already resolved.
    pub fn bind(&self, address: usize) -> bool {
        self.resolved.set(address).is_ok()
    }

    /// Cached address, if the target was resolved
    pub fn cached(&self) -> Option<usize> {
        self.resolved.get().copied()
    }

    /// Identity of the target at `address`
    fn id(address: usize) -> TargetId {
        TargetId {
            address,
            receiver: S::RECEIVER,
        }
    }
}

impl<S: Signature> Debug for Target<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("name", &self.name)
            .field("locator", &self.locator)
            .field("resolved", &self.cached())
            .finish()
    }
}

/// Resolves targets against a host and an optional offset profile
#[derive(Clone, Copy)]
pub struct Resolver<'a> {
    /// Loader queries
    host: &'a dyn Host,
    /// Offsets of the running build
    profile: Option<&'a Profile>,
}

impl<'a> Resolver<'a> {
    /// Creates a resolver
    pub fn new(host: &'a dyn Host, profile: Option<&'a Profile>) -> Self {
        Self { host, profile }
    }

    /// Resolves `target`, caching the address on success
    pub fn resolve<S: Signature>(&self, target: &Target<S>) -> Result<TargetId, HookError> {
        if let Some(address) = target.cached() {
            return Ok(Target::<S>::id(address));
        }

        let address = self
            .locate(target)
            .map_err(|reason| HookError::AddressResolutionFailed {
                target: target.name(),
                reason,
            })?;
        trace!(
            hook = target.name(),
            address = format_args!("{address:#x}"),
            "resolved"
        );

        // another thread may have bound it in the meantime, the first address wins
        let address = *target.resolved.get_or_init(|| address);
        Ok(Target::<S>::id(address))
    }

    /// Looks up the address for a locator
    fn locate<S: Signature>(&self, target: &Target<S>) -> Result<usize, ResolveFailure> {
        match target.locator() {
            Locator::Address(address) => Ok(address),
            Locator::Bound => Err(ResolveFailure::Unbound),
            Locator::Symbol(symbol) => self
                .host
                .lookup_symbol(symbol)
                .ok_or(ResolveFailure::SymbolNotFound(symbol)),
            Locator::Offset(key) => {
                let offset = self
                    .profile
                    .ok_or(ResolveFailure::NoProfile)?
                    .offset(key)
                    .ok_or(ResolveFailure::MissingOffset(key))?;
                let base = self
                    .host
                    .module_base()
                    .ok_or(ResolveFailure::ModuleBaseUnavailable)?;
                Ok(base + offset)
            }
            Locator::Member(member) => member.address(),
        }
    }
}

/// Host and profile used by [`crate::install`] and [`crate::get_original`]
struct Environment {
    /// Loader queries
    host: Box<dyn Host>,
    /// Offsets of the running build
    profile: Option<Profile>,
}

/// Process-wide environment, set at most once
static ENVIRONMENT: OnceLock<Environment> = OnceLock::new();

/// Sets the process-wide environment. Returns false if it was already set or already used.
pub(crate) fn set_environment(host: Box<dyn Host>, profile: Option<Profile>) -> bool {
    ENVIRONMENT.set(Environment { host, profile }).is_ok()
}

/// Resolver for the process-wide environment, a plain [`ProcessHost`] unless configured
pub fn resolver() -> Resolver<'static> {
    let environment = ENVIRONMENT.get_or_init(|| Environment {
        host: Box::new(ProcessHost::new()),
        profile: None,
    });
    Resolver::new(environment.host.as_ref(), environment.profile.as_ref())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::Platform;
    use crate::error::ErrorCode;
    use crate::signature::{ConstMethod, Method};

    type Free = extern "C" fn(i32) -> i32;

    /// Host with a fixed base and symbol table
    #[derive(Default)]
    pub struct FakeHost {
        pub base: Option<usize>,
        pub symbols: HashMap<&'static str, usize>,
        pub version: Option<String>,
    }

    impl Host for FakeHost {
        fn module_base(&self) -> Option<usize> {
            self.base
        }

        fn lookup_symbol(&self, name: &str) -> Option<usize> {
            self.symbols.get(name).copied()
        }

        fn binary_version(&self) -> Option<String> {
            self.version.clone()
        }
    }

    fn profile() -> Profile {
        Profile {
            platform: Platform::current(),
            version: "1.0".into(),
            offsets: [("Level::tick".to_owned(), 0x20)].into(),
        }
    }

    fn failure<S: Signature>(resolver: &Resolver, target: &Target<S>) -> ResolveFailure {
        match resolver.resolve(target) {
            Err(HookError::AddressResolutionFailed { reason, .. }) => reason,
            other => panic!("unexpected resolution {other:?}"),
        }
    }

    #[test]
    fn test_resolve_address() {
        let host = FakeHost::default();
        let resolver = Resolver::new(&host, None);
        let target = Target::<Free>::address("fixed", 0x1234);

        let id = resolver.resolve(&target).unwrap();
        assert_eq!(id.address, 0x1234);
        assert_eq!(id.receiver, Receiver::None);
        assert_eq!(target.cached(), Some(0x1234));
    }

    #[test]
    fn test_resolve_symbol() {
        let host = FakeHost {
            symbols: [("tick", 0x5000)].into(),
            ..Default::default()
        };
        let resolver = Resolver::new(&host, None);

        let found = Target::<Free>::symbol("tick");
        assert_eq!(resolver.resolve(&found).unwrap().address, 0x5000);

        let missing = Target::<Free>::symbol("tock");
        assert_eq!(
            failure(&resolver, &missing),
            ResolveFailure::SymbolNotFound("tock")
        );
        assert_eq!(missing.cached(), None);
    }

    #[test]
    fn test_resolve_offset() {
        let host = FakeHost {
            base: Some(0x40_0000),
            ..Default::default()
        };
        let profile = profile();

        let tick = Target::<Method<u8, fn()>>::offset("Level::tick");
        assert_eq!(
            failure(&Resolver::new(&host, None), &tick),
            ResolveFailure::NoProfile
        );

        let resolver = Resolver::new(&host, Some(&profile));
        let id = resolver.resolve(&tick).unwrap();
        assert_eq!(id.address, 0x40_0020);
        assert_eq!(id.receiver, Receiver::Mut);

        let save = Target::<Free>::offset("Level::save");
        assert_eq!(
            failure(&resolver, &save),
            ResolveFailure::MissingOffset("Level::save")
        );

        let baseless = FakeHost::default();
        let tick = Target::<Free>::offset("Level::tick");
        assert_eq!(
            failure(&Resolver::new(&baseless, Some(&profile)), &tick),
            ResolveFailure::ModuleBaseUnavailable
        );
    }

    #[test]
    fn test_resolve_bound() {
        let host = FakeHost::default();
        let resolver = Resolver::new(&host, None);
        let target = Target::<ConstMethod<u8, fn() -> bool>>::bound("late");

        let error = resolver.resolve(&target).unwrap_err();
        assert_eq!(error.code(), ErrorCode::AddressResolutionFailed);

        assert!(target.bind(0x7000));
        assert!(!target.bind(0x8000));
        let id = resolver.resolve(&target).unwrap();
        assert_eq!(id.address, 0x7000);
        assert_eq!(id.receiver, Receiver::Const);
    }

    #[test]
    fn test_resolve_member() {
        let host = FakeHost::default();
        let resolver = Resolver::new(&host, None);

        let direct = Target::<Method<u8, fn()>>::member("direct", MemberPointer::new(0x9000));
        assert_eq!(resolver.resolve(&direct).unwrap().address, 0x9000);

        let adjusted = Target::<Method<u8, fn()>>::member(
            "adjusted",
            MemberPointer::with_adjustment(0x9000, 8),
        );
        assert_eq!(
            failure(&resolver, &adjusted),
            ResolveFailure::AdjustedMember(8)
        );

        let null = Target::<Method<u8, fn()>>::member("null", MemberPointer::new(0));
        assert_eq!(failure(&resolver, &null), ResolveFailure::NullMember);
    }

    #[test]
    #[cfg(not(windows))]
    #[should_panic(expected = "shadow table")]
    /// Virtual member pointers are a contract violation
    fn test_resolve_virtual_member() {
        let _ = MemberPointer::new(0x11).address();
    }
}
