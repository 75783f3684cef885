//! # Install
//!
//! Startup installation. Hooks are declared anywhere in the program with [`register_detour!`] or
//! [`register_installer!`]; the declarations are gathered at link time into [`INSTALLERS`] and
//! applied by one call to [`install`]. Every failure is collected, so a single pass reports all
//! faulty hooks instead of stopping at the first one.
//!
//! [`register_detour!`]: crate::register_detour
//! [`register_installer!`]: crate::register_installer

use std::fmt::{self, Debug};
use std::sync::Once;

use linkme::distributed_slice;
use tracing::{debug, error, info, warn};

use crate::config::{Platform, Profiles};
use crate::error::{self, Failure, HookError};
use crate::host::Host;
use crate::registry::{HookRecord, Registry};
use crate::resolve::{self, Resolver, Target};
use crate::signature::{RawFn, Signature};

/// One statically registered hook
#[derive(Clone, Copy)]
pub struct Installer {
    /// Name reported in logs and failures
    pub name: &'static str,
    /// Applies the hook
    pub install: fn(&mut InstallContext<'_>) -> Result<(), HookError>,
}

impl Installer {
    /// Creates an installer
    pub const fn new(
        name: &'static str,
        install: fn(&mut InstallContext<'_>) -> Result<(), HookError>,
    ) -> Self {
        Self { name, install }
    }
}

impl Debug for Installer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Installer").field("name", &self.name).finish()
    }
}

/// Every hook registered in the program
#[distributed_slice]
pub static INSTALLERS: [Installer] = [..];

/// What an installer can do while it runs
pub struct InstallContext<'a> {
    /// Resolver for targets
    resolver: Resolver<'a>,
    /// Registry receiving the detours
    registry: &'a Registry,
    /// Detours applied by the current installer
    installed: Vec<HookRecord>,
}

impl<'a> InstallContext<'a> {
    /// Creates a context
    pub fn new(resolver: Resolver<'a>, registry: &'a Registry) -> Self {
        Self {
            resolver,
            registry,
            installed: Vec::new(),
        }
    }

    /// Resolver for targets
    pub fn resolver(&self) -> &Resolver<'a> {
        &self.resolver
    }

    /// Detours `target` to `replacement`, which takes the receiver as its first argument
    ///
    /// # Safety
    ///
    /// `target` must be declared with the signature of the function it resolves to
    pub unsafe fn detour<S: Signature>(
        &mut self,
        target: &Target<S>,
        replacement: S::Original,
    ) -> Result<(), HookError> {
        self.detour_address(target, replacement.address())
    }

    /// Detours `target`, a function returning through caller-provided storage
    ///
    /// # Safety
    ///
    /// See [`InstallContext::detour`]
    pub unsafe fn detour_rvo<S: Signature>(
        &mut self,
        target: &Target<S>,
        replacement: S::OriginalRvo,
    ) -> Result<(), HookError> {
        self.detour_address(target, replacement.address())
    }

    /// Resolves and patches
    unsafe fn detour_address<S: Signature>(
        &mut self,
        target: &Target<S>,
        replacement: usize,
    ) -> Result<(), HookError> {
        let id = self.resolver.resolve(target)?;
        let record = self
            .registry
            .install_detour(target.name(), id, replacement)?;
        self.installed.push(record);
        Ok(())
    }
}

/// Outcome of an installation pass
#[derive(Debug, Default)]
pub struct InstallReport {
    /// Detours that were applied
    pub installed: Vec<HookRecord>,
    /// Installers that failed
    pub failures: Vec<Failure>,
}

impl InstallReport {
    /// Returns true if every installer succeeded
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Runs `installers` against `resolver` and `registry`, collecting every failure
pub fn install_with(
    installers: &[Installer],
    resolver: Resolver<'_>,
    registry: &Registry,
) -> InstallReport {
    let mut report = InstallReport::default();

    for installer in installers {
        let mut context = InstallContext::new(resolver, registry);
        match (installer.install)(&mut context) {
            Ok(()) => debug!(hook = installer.name, "hook installed"),
            Err(e) => {
                error!(hook = installer.name, code = %e.code(), "{e}");
                report.failures.push(Failure::new(installer.name, &e));
            }
        }
        report.installed.append(&mut context.installed);
    }

    info!(
        installed = report.installed.len(),
        failed = report.failures.len(),
        "hook installation finished"
    );
    report
}

/// Guards the process-wide installation pass
static INSTALL: Once = Once::new();

/// Installs every registered hook into the process-wide registry, then freezes it
///
/// Runs once; later calls return immediately. Failures are logged and published to
/// [`failures`](crate::failures).
pub fn install() {
    INSTALL.call_once(|| {
        let registry = Registry::global();
        let report = install_with(&INSTALLERS, resolve::resolver(), registry);
        error::publish(report.failures);
        registry.freeze();
    });
}

/// Sets the host and offset profile used by [`install`] and [`crate::get_original`]
///
/// With an empty profile set, only targets that do not need offsets resolve. Otherwise the profile
/// matching the current platform and the host's binary version is selected, and an unknown version
/// is rejected. Must run before the first resolution; later calls keep the first environment.
pub fn configure(host: impl Host + 'static, profiles: &Profiles) -> Result<(), HookError> {
    let profile = if profiles.iter().next().is_none() {
        None
    } else {
        let version = host.binary_version().unwrap_or_default();
        match profiles.select(Platform::current(), &version) {
            Ok(profile) => Some(profile.clone()),
            Err(e) => {
                error!(code = %e.code(), "{e}");
                error::publish([Failure::new("configure", &e)]);
                return Err(e);
            }
        }
    };

    if let Some(profile) = &profile {
        info!(
            platform = %profile.platform,
            version = %profile.version,
            offsets = profile.offsets.len(),
            "selected offset profile"
        );
    }
    if !resolve::set_environment(Box::new(host), profile) {
        warn!("hook environment already in use, keeping it");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::ErrorCode;
    use crate::fixtures::{self, AddFn, Assembled};
    use crate::resolve::tests::FakeHost;

    static ADD: Target<AddFn> = Target::bound("add");
    static UNBOUND: Target<AddFn> = Target::bound("unbound");
    static ADD_ORIGINAL: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn add_doubled(a: i32, b: i32) -> i32 {
        let original: AddFn = unsafe { std::mem::transmute(ADD_ORIGINAL.load(Ordering::SeqCst)) };
        original(a, b) * 2
    }

    fn install_add(context: &mut InstallContext<'_>) -> Result<(), HookError> {
        unsafe { context.detour(&ADD, add_doubled) }
    }

    fn install_unbound(context: &mut InstallContext<'_>) -> Result<(), HookError> {
        unsafe { context.detour(&UNBOUND, add_doubled) }
    }

    #[test]
    /// Every installer runs, failures are collected rather than stopping the pass
    fn test_install_with_collects_failures() {
        let code = Assembled::new(add_doubled as usize, fixtures::ADD);
        assert!(ADD.bind(code.address()));

        let installers = [
            Installer::new("unbound", install_unbound),
            Installer::new("add", install_add),
        ];
        let host = FakeHost::default();
        let registry = Registry::new();
        let report = install_with(&installers, Resolver::new(&host, None), &registry);

        assert!(!report.is_success());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].hook, "unbound");
        assert_eq!(report.failures[0].code, ErrorCode::AddressResolutionFailed);

        assert_eq!(report.installed.len(), 1);
        let record = &report.installed[0];
        assert_eq!(record.name, "add");
        ADD_ORIGINAL.store(record.trampoline, Ordering::SeqCst);

        let add: AddFn = unsafe { std::mem::transmute(code.address()) };
        assert_eq!(add(3, 4), 14);

        unsafe { registry.uninstall(code.address()) };
        assert_eq!(add(3, 4), 7);
    }

    #[test]
    fn test_install_with_empty() {
        let host = FakeHost::default();
        let registry = Registry::new();
        let report = install_with(&[], Resolver::new(&host, None), &registry);
        assert!(report.is_success());
        assert!(report.installed.is_empty());
    }

    #[test]
    /// An unknown binary version is refused before anything resolves
    fn test_configure_unsupported_version() {
        let profiles: Profiles = format!(
            "[[profile]]\nplatform = \"{}\"\nversion = \"2.0\"",
            Platform::current()
        )
        .parse()
        .unwrap();
        let host = FakeHost {
            version: Some("1.0".into()),
            ..Default::default()
        };

        let error = configure(host, &profiles).unwrap_err();
        assert_eq!(error.code(), ErrorCode::UnsupportedVersion);
        assert!(crate::failures()
            .iter()
            .any(|f| f.hook == "configure" && f.code == ErrorCode::UnsupportedVersion));
    }
}
