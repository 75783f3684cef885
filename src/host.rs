//! # Host
//!
//! Queries answered by the process that is being hooked

use std::ffi::CString;

/// Information about the hooked binary
pub trait Host: Send + Sync {
    /// Load address of the main module
    fn module_base(&self) -> Option<usize>;

    /// Address of an exported symbol
    fn lookup_symbol(&self, name: &str) -> Option<usize>;

    /// Version string of the running binary, used to pick an offset profile
    fn binary_version(&self) -> Option<String>;
}

/// [`Host`] backed by the dynamic loader of the current process
#[derive(Debug, Default, Clone)]
pub struct ProcessHost {
    /// Version reported by [`Host::binary_version`]
    version: Option<String>,
}

impl ProcessHost {
    /// Creates a host that does not know the binary version
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a host reporting `version`
    pub fn with_version(version: impl Into<String>) -> Self {
        Self {
            version: Some(version.into()),
        }
    }
}

impl Host for ProcessHost {
    fn module_base(&self) -> Option<usize> {
        sys::module_base()
    }

    fn lookup_symbol(&self, name: &str) -> Option<usize> {
        let name = CString::new(name).ok()?;
        sys::lookup_symbol(&name)
    }

    fn binary_version(&self) -> Option<String> {
        self.version.clone()
    }
}

#[cfg(unix)]
mod sys {
    use std::ffi::{c_int, c_void, CStr};

    #[cfg(target_os = "linux")]
    pub fn module_base() -> Option<usize> {
        /// Stops at the first object, which is the main executable
        unsafe extern "C" fn first(
            info: *mut libc::dl_phdr_info,
            _size: usize,
            data: *mut c_void,
        ) -> c_int {
            *(data as *mut usize) = (*info).dlpi_addr as usize;
            1
        }

        let mut base = 0usize;
        // SAFETY: the callback only writes through `data`, which points at `base`
        unsafe { libc::dl_iterate_phdr(Some(first), &mut base as *mut usize as *mut c_void) };
        // a non-PIE executable is loaded at its link address and reports a bias of zero
        Some(base)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn module_base() -> Option<usize> {
        None
    }

    pub fn lookup_symbol(name: &CStr) -> Option<usize> {
        // SAFETY: `name` is NUL-terminated
        let address = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
        (!address.is_null()).then_some(address as usize)
    }
}

#[cfg(windows)]
mod sys {
    use std::ffi::CStr;
    use std::ptr;

    use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};

    pub fn module_base() -> Option<usize> {
        // SAFETY: a null name asks for the executable of the calling process
        let module = unsafe { GetModuleHandleW(ptr::null()) };
        (!module.is_null()).then_some(module as usize)
    }

    pub fn lookup_symbol(name: &CStr) -> Option<usize> {
        // SAFETY: `name` is NUL-terminated
        unsafe {
            let module = GetModuleHandleW(ptr::null());
            if module.is_null() {
                return None;
            }
            GetProcAddress(module, name.as_ptr() as *const u8).map(|f| f as usize)
        }
    }
}
