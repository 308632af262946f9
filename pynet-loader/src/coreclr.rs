#![cfg(feature = "coreclr")]
use std::ffi::c_void;
use std::path::Path;
use std::str::FromStr;

use netcorehost::hostfxr::Hostfxr;
use netcorehost::nethost;
use netcorehost::pdcstring::PdCString;
use tracing::debug;

use pynet_common::runtime::{RuntimeDescriptor, RuntimeKind};

use crate::error::NativeError;
use crate::host::{split_entry_point, EntryPoint, LoadedLibrary};

type Resolver = Box<dyn Fn(&str, PdCString, PdCString) -> Result<EntryPoint<'static>, NativeError>>;

struct CoreClrAssembly {
    assembly_name: String,
    resolve: Resolver,
}

// SAFETY: hostfxr and the delegate loader are process-wide and may be used
// from any thread once the runtime is up.
unsafe impl Send for CoreClrAssembly {}

impl LoadedLibrary for CoreClrAssembly {
    fn get_symbol(&self, name: &str) -> Result<EntryPoint<'_>, NativeError> {
        let (type_name, method) = split_entry_point(name)?;
        let qualified = format!("{}, {}", type_name, self.assembly_name);
        (self.resolve)(name, pdcstring(&qualified)?, pdcstring(method)?)
    }
}

fn host_error(e: impl std::fmt::Display) -> NativeError {
    NativeError::Runtime { runtime: RuntimeKind::CoreClrLike, message: e.to_string() }
}

fn pdcstring(s: &str) -> Result<PdCString, NativeError> {
    PdCString::from_str(s).map_err(host_error)
}

pub(crate) fn load(runtime: &RuntimeDescriptor, path: &Path) -> Result<Box<dyn LoadedLibrary>, NativeError> {
    let runtime_config = runtime.config_path().ok_or_else(|| host_error("no runtime configuration file given"))?;

    let hostfxr = if let Some(hostfxr_path) = runtime.explicit_library_path() {
        debug!(hostfxr = %hostfxr_path.display(), "loading hostfxr");
        Hostfxr::load_from_path(hostfxr_path).map_err(|e| NativeError::LibraryLoad {
            path: hostfxr_path.to_path_buf(),
            message: e.to_string(),
        })?
    } else {
        nethost::load_hostfxr().map_err(host_error)?
    };

    // The CLR cannot be torn down again, so everything it hands out lives for the rest of the process.
    let hostfxr: &'static Hostfxr = Box::leak(Box::new(hostfxr));
    let runtime_config: &'static PdCString = Box::leak(Box::new(
        PdCString::from_os_str(runtime_config.as_os_str()).map_err(host_error)?));

    let context = if let Some(dotnet_root) = runtime.extra_search_paths().first() {
        hostfxr.initialize_for_runtime_config_with_dotnet_root(runtime_config,
                                                               PdCString::from_os_str(dotnet_root.as_os_str()).map_err(host_error)?)
    } else {
        hostfxr.initialize_for_runtime_config(runtime_config)
    }.map_err(host_error)?;
    let context = Box::leak(Box::new(context));

    let assembly: &'static PdCString = Box::leak(Box::new(
        PdCString::from_os_str(path.as_os_str()).map_err(host_error)?));
    let loader = context.get_delegate_loader_for_assembly(assembly).map_err(|e| NativeError::LibraryLoad {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let assembly_name = path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    debug!(assembly = %path.display(), "bridging assembly loaded into coreclr");

    let resolve: Resolver = Box::new(move |name: &str, type_name: PdCString, method: PdCString| {
        let func = loader.get_function_pointer_with_default_signature(type_name, method)
            .map_err(|e| NativeError::MissingSymbol { name: name.to_string(), message: e.to_string() })?;
        Ok(EntryPoint::new(name, move |data: &[u8]| unsafe {
            func(data.as_ptr() as *const c_void, data.len() as _)
        }))
    });

    Ok(Box::new(CoreClrAssembly { assembly_name, resolve }))
}
