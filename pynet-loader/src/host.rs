//! The seam between the loader and a concrete CLR.
//!
//! A [`RuntimeHost`] turns a descriptor and the path of the bridging assembly
//! into a [`LoadedLibrary`], which resolves entry points by their well-known
//! name. Entry points take a byte buffer and return a status, 0 meaning success.

use std::ffi::{c_void, CString};
use std::path::Path;

use pynet_common::runtime::{RuntimeDescriptor, RuntimeKind};

use crate::error::NativeError;

pub const INITIALIZE_ENTRY_POINT: &str = "Python.Runtime.Loader.Initialize";
pub const SHUTDOWN_ENTRY_POINT: &str = "Python.Runtime.Loader.Shutdown";

/// `int F(IntPtr data, int size)` as exported to native code.
pub type RawEntryPoint = unsafe extern "system" fn(*const c_void, i32) -> i32;

pub trait RuntimeHost: Send + Sync {
    /// Loads the bridging assembly at `path` into the runtime `runtime` describes.
    fn load_library(&self, runtime: &RuntimeDescriptor, path: &Path) -> Result<Box<dyn LoadedLibrary>, NativeError>;
}

pub trait LoadedLibrary: Send {
    fn get_symbol(&self, name: &str) -> Result<EntryPoint<'_>, NativeError>;
}

/// A resolved entry point, valid for as long as the library it came from.
pub struct EntryPoint<'lib> {
    name: String,
    func: Box<dyn Fn(&[u8]) -> i32 + 'lib>,
}

impl<'lib> EntryPoint<'lib> {
    pub fn new(name: impl Into<String>, func: impl Fn(&[u8]) -> i32 + 'lib) -> EntryPoint<'lib> {
        EntryPoint { name: name.into(), func: Box::new(func) }
    }

    /// # Safety
    /// `func` must point at a function with the [`RawEntryPoint`] signature that
    /// stays mapped for `'lib`.
    pub unsafe fn from_raw(name: impl Into<String>, func: RawEntryPoint) -> EntryPoint<'lib> {
        EntryPoint::new(name, move |data: &[u8]| func(data.as_ptr() as *const c_void, data.len() as i32))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn invoke(&self, data: &[u8]) -> i32 {
        (self.func)(data)
    }
}

/// Splits `Namespace.Type.Method` into `("Namespace.Type", "Method")`.
pub fn split_entry_point(name: &str) -> Result<(&str, &str), NativeError> {
    match name.rsplit_once('.') {
        Some((type_name, method)) if !type_name.is_empty() && !method.is_empty() => Ok((type_name, method)),
        _ => Err(NativeError::MissingSymbol {
            name: name.to_string(),
            message: String::from("expected a fully qualified Type.Method name"),
        }),
    }
}

pub(crate) fn path_cstring(path: &Path) -> Result<CString, NativeError> {
    CString::new(path.to_string_lossy().as_bytes()).map_err(|e| NativeError::LibraryLoad {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Hosts the bridge in whichever runtime the descriptor names.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlatformHost;

impl RuntimeHost for PlatformHost {
    fn load_library(&self, runtime: &RuntimeDescriptor, path: &Path) -> Result<Box<dyn LoadedLibrary>, NativeError> {
        match runtime.kind() {
            RuntimeKind::CoreClrLike => {
                #[cfg(feature = "coreclr")]
                {
                    crate::coreclr::load(runtime, path)
                }
                #[cfg(not(feature = "coreclr"))]
                {
                    Err(NativeError::Unsupported(RuntimeKind::CoreClrLike))
                }
            }
            RuntimeKind::Mono => crate::mono::load(runtime, path),
            RuntimeKind::DesktopFramework => {
                #[cfg(windows)]
                {
                    crate::netfx::load(runtime, path)
                }
                #[cfg(not(windows))]
                {
                    Err(NativeError::Unsupported(RuntimeKind::DesktopFramework))
                }
            }
        }
    }
}
