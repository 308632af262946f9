#![cfg(target_os = "windows")]
//! Hosting in the .NET Framework through the `ClrLoader` helper library.

use std::ffi::{c_void, CString};
use std::os::raw::c_char;
use std::path::{Path, PathBuf};
use std::ptr;

use libloading::Library;
use once_cell::sync::OnceCell;
use tracing::debug;

use pynet_common::runtime::{RuntimeDescriptor, RuntimeKind};

use crate::error::NativeError;
use crate::host::{path_cstring, split_entry_point, EntryPoint, LoadedLibrary, RawEntryPoint};

const CLR_LOADER_NAME: &str = "ClrLoader.dll";

type PyclrInitialize = unsafe extern "C" fn();
type PyclrCreateAppdomain = unsafe extern "C" fn(*const c_char, *const c_char) -> *mut c_void;
type PyclrGetFunction = unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char, *const c_char) -> *mut c_void;

struct ClrLoader {
    _library: Library,
    create_appdomain: PyclrCreateAppdomain,
    get_function: PyclrGetFunction,
}

// SAFETY: the pyclr_* exports only touch process-wide CLR state.
unsafe impl Send for ClrLoader {}
unsafe impl Sync for ClrLoader {}

static CLR_LOADER: OnceCell<ClrLoader> = OnceCell::new();

fn clr_loader_candidates(runtime: &RuntimeDescriptor, assembly: &Path) -> Vec<PathBuf> {
    if let Some(path) = runtime.explicit_library_path() {
        return vec![path.to_path_buf()];
    }
    runtime.extra_search_paths().iter()
        .map(|dir| dir.join(CLR_LOADER_NAME))
        .chain(assembly.parent().map(|dir| dir.join(CLR_LOADER_NAME)))
        .collect()
}

unsafe fn symbol<T: Copy>(library: &Library, name: &[u8]) -> Result<T, NativeError> {
    library.get::<T>(name).map(|s| *s).map_err(|e| NativeError::MissingSymbol {
        name: String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name)).into_owned(),
        message: e.to_string(),
    })
}

impl ClrLoader {
    fn open(runtime: &RuntimeDescriptor, assembly: &Path) -> Result<ClrLoader, NativeError> {
        let mut last_error = None;
        for candidate in clr_loader_candidates(runtime, assembly) {
            let library = match unsafe { Library::new(&candidate) } {
                Ok(library) => library,
                Err(e) => {
                    last_error = Some(NativeError::LibraryLoad { path: candidate, message: e.to_string() });
                    continue;
                }
            };
            debug!(clr_loader = %candidate.display(), "opened ClrLoader");

            return unsafe {
                let initialize: PyclrInitialize = symbol(&library, b"pyclr_initialize\0")?;
                initialize();
                Ok(ClrLoader {
                    create_appdomain: symbol(&library, b"pyclr_create_appdomain\0")?,
                    get_function: symbol(&library, b"pyclr_get_function\0")?,
                    _library: library,
                })
            };
        }
        Err(last_error.unwrap_or(NativeError::Runtime {
            runtime: RuntimeKind::DesktopFramework,
            message: format!("{} not found", CLR_LOADER_NAME),
        }))
    }
}

struct NetFxAssembly {
    loader: &'static ClrLoader,
    domain: *mut c_void,
    path: CString,
}

// SAFETY: app domains may be entered from any thread.
unsafe impl Send for NetFxAssembly {}

impl LoadedLibrary for NetFxAssembly {
    fn get_symbol(&self, name: &str) -> Result<EntryPoint<'_>, NativeError> {
        let (type_name, method) = split_entry_point(name)?;
        let missing = |message: String| NativeError::MissingSymbol { name: name.to_string(), message };

        let type_name = CString::new(type_name).map_err(|e| missing(e.to_string()))?;
        let method = CString::new(method).map_err(|e| missing(e.to_string()))?;

        let func = unsafe {
            (self.loader.get_function)(self.domain, self.path.as_ptr(), type_name.as_ptr(), method.as_ptr())
        };
        if func.is_null() {
            return Err(missing(String::from("pyclr_get_function returned null")));
        }

        Ok(unsafe { EntryPoint::from_raw(name, std::mem::transmute::<*mut c_void, RawEntryPoint>(func)) })
    }
}

fn checked_domain(domain: *mut c_void) -> Result<*mut c_void, NativeError> {
    if domain.is_null() {
        return Err(NativeError::Runtime {
            runtime: RuntimeKind::DesktopFramework,
            message: String::from("pyclr_create_appdomain returned no domain"),
        });
    }
    Ok(domain)
}

pub(crate) fn load(runtime: &RuntimeDescriptor, path: &Path) -> Result<Box<dyn LoadedLibrary>, NativeError> {
    let loader = CLR_LOADER.get_or_try_init(|| ClrLoader::open(runtime, path))?;

    let name = CString::new("pythonnet").map_err(|e| NativeError::Runtime {
        runtime: RuntimeKind::DesktopFramework,
        message: e.to_string(),
    })?;
    let config = runtime.config_path().map(path_cstring).transpose()?;
    let domain = checked_domain(unsafe {
        (loader.create_appdomain)(name.as_ptr(), config.as_ref().map_or(ptr::null(), |c| c.as_ptr()))
    })?;
    debug!(assembly = %path.display(), "bridging assembly bound to a new app domain");

    Ok(Box::new(NetFxAssembly { loader, domain, path: path_cstring(path)? }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clr_loader_beside_assembly() {
        let runtime = RuntimeDescriptor::desktop_framework().with_search_path(r"C:\pythonnet\netfx");
        let candidates = clr_loader_candidates(&runtime, Path::new(r"C:\pythonnet\runtime\Python.Runtime.dll"));
        assert_eq!(candidates, vec![
            PathBuf::from(r"C:\pythonnet\netfx\ClrLoader.dll"),
            PathBuf::from(r"C:\pythonnet\runtime\ClrLoader.dll"),
        ]);
    }

    #[test]
    fn test_null_appdomain_is_an_error() {
        let err = checked_domain(ptr::null_mut()).unwrap_err();
        assert!(matches!(err, NativeError::Runtime { runtime: RuntimeKind::DesktopFramework, .. }));

        let mut domain = 0u8;
        let domain = &mut domain as *mut u8 as *mut c_void;
        assert_eq!(checked_domain(domain).unwrap(), domain);
    }
}
