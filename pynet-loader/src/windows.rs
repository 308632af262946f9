#![cfg(target_os = "windows")]
use std::ffi::{CStr, OsString};
use std::mem::size_of;
use std::os::windows::ffi::OsStringExt;
use std::path::PathBuf;

use winapi::shared::minwindef::*;
use winapi::shared::ntdef::*;
use winapi::um::libloaderapi::{GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS, GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
                               GetModuleFileNameW, GetModuleHandleExW, GetProcAddress};
use winapi::um::processthreadsapi::GetCurrentProcess;
use winapi::um::psapi::EnumProcessModules;

use pynet_common::config::ImageLocator;

pub struct WindowsImageLocator;

impl WindowsImageLocator {
    fn module_file_name(module_handle: HMODULE) -> Option<PathBuf> {
        let mut v: Vec<u16> = Vec::with_capacity(MAX_PATH);

        unsafe {
            let size =
                GetModuleFileNameW(module_handle, v.as_mut_ptr(), MAX_PATH as DWORD);
            if size == 0 {
                return None
            }
            v.set_len(size as usize);
        }
        let os_str = OsString::from_wide(&v);
        PathBuf::from(os_str).canonicalize().ok()
    }

    fn loaded_modules() -> Vec<HMODULE> {
        let process = unsafe { GetCurrentProcess() };
        let mut modules: Vec<HMODULE> = Vec::new();
        let mut needed: DWORD = 0;
        loop {
            let capacity = modules.len();
            let ok = unsafe {
                EnumProcessModules(process, modules.as_mut_ptr(),
                                   (capacity * size_of::<HMODULE>()) as DWORD, &mut needed)
            };
            if ok == 0 {
                return Vec::new();
            }
            let count = needed as usize / size_of::<HMODULE>();
            if count <= capacity {
                modules.truncate(count);
                return modules;
            }
            modules.resize(count, std::ptr::null_mut());
        }
    }
}

impl ImageLocator for WindowsImageLocator {
    fn get_module_path() -> Option<PathBuf> {
        let mut module_handle: HMODULE = std::ptr::null_mut();
        unsafe {
            if GetModuleHandleExW(
                GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
                WindowsImageLocator::module_file_name as LPCWSTR, &mut module_handle
            ) == 0 {
                return None
            }
        }
        WindowsImageLocator::module_file_name(module_handle)
    }

    fn get_image_exporting(symbol: &CStr) -> Option<PathBuf> {
        WindowsImageLocator::loaded_modules()
            .into_iter()
            .find(|&module| unsafe { !GetProcAddress(module, symbol.as_ptr()).is_null() })
            .and_then(WindowsImageLocator::module_file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_path() {
        let path = WindowsImageLocator::get_module_path().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_kernel32_export() {
        let path = WindowsImageLocator::get_image_exporting(c"GetCurrentProcess").unwrap();
        assert!(path.exists());
        assert_eq!(WindowsImageLocator::get_image_exporting(c"pynet_no_such_symbol_anywhere"), None);
    }
}
