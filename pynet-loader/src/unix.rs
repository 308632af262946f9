#![cfg(unix)]
use std::ffi::{c_void, CStr, OsString};
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;

use pynet_common::config::ImageLocator;

pub struct UnixImageLocator;

impl UnixImageLocator {
    fn image_containing(addr: *const c_void) -> Option<PathBuf> {
        let mut dlinfo = MaybeUninit::<libc::Dl_info>::uninit();
        let fname = unsafe {
            if libc::dladdr(addr, dlinfo.as_mut_ptr()) == 0 {
                return None;
            }
            let dlinfo = dlinfo.assume_init();
            if dlinfo.dli_fname.is_null() {
                return None;
            }
            CStr::from_ptr(dlinfo.dli_fname).to_owned()
        };
        let os_str = OsString::from_vec(fname.into_bytes());
        PathBuf::from(os_str).canonicalize().ok()
    }
}

impl ImageLocator for UnixImageLocator {
    fn get_module_path() -> Option<PathBuf> {
        UnixImageLocator::image_containing(UnixImageLocator::image_containing as *const c_void)
    }

    fn get_image_exporting(symbol: &CStr) -> Option<PathBuf> {
        let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, symbol.as_ptr()) };
        if addr.is_null() {
            return None;
        }
        UnixImageLocator::image_containing(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_path() {
        if let Some(path) = UnixImageLocator::get_module_path() {
            assert!(path.is_absolute());
            assert!(path.exists());
        }
        assert!(UnixImageLocator::install_dir().is_some());
    }

    #[test]
    fn test_libc_export() {
        let path = UnixImageLocator::get_image_exporting(c"malloc");
        assert!(path.map_or(false, |p| p.exists()));
        assert_eq!(UnixImageLocator::get_image_exporting(c"pynet_no_such_symbol_anywhere"), None);
    }
}
