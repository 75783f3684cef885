//! # Layout
//!
//! Build-time size checks for records that mirror the hooked binary's ABI

/// Fails the build when `$ty` does not have the expected size on the target platform
///
/// ```
/// #[repr(C)]
/// struct Header {
///     offset_to_top: isize,
///     type_info: *const u8,
/// }
/// rehook::assert_layout!(Header, windows = 16, other = 16);
/// ```
#[macro_export]
macro_rules! assert_layout {
    ($ty:ty, windows = $windows:expr, other = $other:expr) => {
        const _: () = {
            #[cfg(windows)]
            const EXPECTED: usize = $windows;
            #[cfg(not(windows))]
            const EXPECTED: usize = $other;

            assert!(
                ::core::mem::size_of::<$ty>() == EXPECTED,
                concat!("size of `", stringify!($ty), "` does not match the binary's layout")
            );
        };
    };
}

#[cfg(test)]
mod tests {
    #[repr(C)]
    struct Pair {
        a: u32,
        b: u64,
    }
    assert_layout!(Pair, windows = 16, other = 16);

    #[repr(C)]
    struct Long {
        value: std::ffi::c_long,
    }
    // `long` stays 32 bits on Windows
    assert_layout!(Long, windows = 4, other = 8);

    #[test]
    fn test_layout_fields() {
        let pair = Pair { a: 1, b: 2 };
        let long = Long { value: 3 };
        assert_eq!(pair.a as u64 + pair.b + long.value as u64, 6);
    }
}
