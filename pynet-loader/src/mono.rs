//! Hosting through the Mono embedding API.
//!
//! libmono is opened with `libloading` and the JIT is started once per
//! process. Entry points are resolved to unmanaged thunks, which take the
//! managed arguments followed by an out-pointer for a thrown exception.

use std::ffi::{c_void, CString};
use std::os::raw::{c_char, c_int};
use std::path::{Path, PathBuf};
use std::ptr;

use libloading::Library;
use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use pynet_common::runtime::{RuntimeDescriptor, RuntimeKind};

use crate::error::NativeError;
use crate::host::{path_cstring, split_entry_point, EntryPoint, LoadedLibrary};

type MonoConfigParse = unsafe extern "C" fn(*const c_char);
type MonoJitInit = unsafe extern "C" fn(*const c_char) -> *mut c_void;
type MonoThreadAttach = unsafe extern "C" fn(*mut c_void) -> *mut c_void;
type MonoDomainAssemblyOpen = unsafe extern "C" fn(*mut c_void, *const c_char) -> *mut c_void;
type MonoAssemblyGetImage = unsafe extern "C" fn(*mut c_void) -> *mut c_void;
type MonoMethodDescNew = unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void;
type MonoMethodDescSearchInImage = unsafe extern "C" fn(*mut c_void, *mut c_void) -> *mut c_void;
type MonoMethodDescFree = unsafe extern "C" fn(*mut c_void);
type MonoMethodGetUnmanagedThunk = unsafe extern "C" fn(*mut c_void) -> *mut c_void;

/// `int F(IntPtr data, int size)` as a Mono thunk.
type Thunk = unsafe extern "C" fn(*const c_void, c_int, *mut *mut c_void) -> c_int;

const DOMAIN_NAME: &[u8] = b"pythonnet\0";

#[cfg(target_os = "windows")]
const LIBMONO_NAMES: &[&str] = &["mono-2.0-sgen.dll", "mono-2.0.dll"];
#[cfg(target_os = "macos")]
const LIBMONO_NAMES: &[&str] = &["libmonosgen-2.0.1.dylib", "libmono-2.0.1.dylib"];
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const LIBMONO_NAMES: &[&str] = &["libmonosgen-2.0.so.1", "libmono-2.0.so.1"];

struct MonoRuntime {
    _library: Library,
    started_with: RuntimeDescriptor,
    domain: *mut c_void,
    thread_attach: MonoThreadAttach,
    domain_assembly_open: MonoDomainAssemblyOpen,
    assembly_get_image: MonoAssemblyGetImage,
    method_desc_new: MonoMethodDescNew,
    method_desc_search_in_image: MonoMethodDescSearchInImage,
    method_desc_free: MonoMethodDescFree,
    method_get_unmanaged_thunk: MonoMethodGetUnmanagedThunk,
}

// SAFETY: the root domain is process-wide; threads attach themselves before calling in.
unsafe impl Send for MonoRuntime {}
unsafe impl Sync for MonoRuntime {}

// mono_jit_init may only run once per process.
static MONO: OnceCell<MonoRuntime> = OnceCell::new();

fn host_error(message: impl Into<String>) -> NativeError {
    NativeError::Runtime { runtime: RuntimeKind::Mono, message: message.into() }
}

unsafe fn symbol<T: Copy>(library: &Library, name: &[u8]) -> Result<T, NativeError> {
    library.get::<T>(name).map(|s| *s).map_err(|e| NativeError::MissingSymbol {
        name: String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name)).into_owned(),
        message: e.to_string(),
    })
}

/// Where libmono may live, most specific first.
fn libmono_candidates(runtime: &RuntimeDescriptor) -> Vec<PathBuf> {
    if let Some(path) = runtime.explicit_library_path() {
        return vec![path.to_path_buf()];
    }
    let mut candidates = Vec::new();
    for dir in runtime.extra_search_paths() {
        candidates.extend(LIBMONO_NAMES.iter().map(|name| dir.join(name)));
    }
    // Bare names go through the system loader's own search.
    candidates.extend(LIBMONO_NAMES.iter().map(PathBuf::from));
    candidates
}

/// Whether `requested` would have started the JIT the same way as `started`.
fn starts_same_jit(started: &RuntimeDescriptor, requested: &RuntimeDescriptor) -> bool {
    libmono_candidates(started) == libmono_candidates(requested)
        && started.config_path() == requested.config_path()
}

fn open_libmono(runtime: &RuntimeDescriptor) -> Result<Library, NativeError> {
    let mut last_error = None;
    for candidate in libmono_candidates(runtime) {
        match unsafe { Library::new(&candidate) } {
            Ok(library) => {
                debug!(libmono = %candidate.display(), "opened libmono");
                return Ok(library);
            }
            Err(e) => {
                debug!(libmono = %candidate.display(), error = %e, "libmono candidate rejected");
                last_error = Some(NativeError::LibraryLoad { path: candidate, message: e.to_string() });
            }
        }
    }
    Err(last_error.unwrap_or_else(|| host_error("no libmono candidates")))
}

impl MonoRuntime {
    fn start(runtime: &RuntimeDescriptor) -> Result<MonoRuntime, NativeError> {
        let library = open_libmono(runtime)?;

        unsafe {
            let config_parse: MonoConfigParse = symbol(&library, b"mono_config_parse\0")?;
            let jit_init: MonoJitInit = symbol(&library, b"mono_jit_init\0")?;

            // A null path makes Mono read its default configuration.
            let config = runtime.config_path().map(path_cstring).transpose()?;
            config_parse(config.as_ref().map_or(ptr::null(), |c| c.as_ptr()));

            let domain = jit_init(DOMAIN_NAME.as_ptr() as *const c_char);
            if domain.is_null() {
                return Err(host_error("mono_jit_init returned no domain"));
            }

            Ok(MonoRuntime {
                started_with: runtime.clone(),
                domain,
                thread_attach: symbol(&library, b"mono_thread_attach\0")?,
                domain_assembly_open: symbol(&library, b"mono_domain_assembly_open\0")?,
                assembly_get_image: symbol(&library, b"mono_assembly_get_image\0")?,
                method_desc_new: symbol(&library, b"mono_method_desc_new\0")?,
                method_desc_search_in_image: symbol(&library, b"mono_method_desc_search_in_image\0")?,
                method_desc_free: symbol(&library, b"mono_method_desc_free\0")?,
                method_get_unmanaged_thunk: symbol(&library, b"mono_method_get_unmanaged_thunk\0")?,
                _library: library,
            })
        }
    }
}

struct MonoAssembly {
    runtime: &'static MonoRuntime,
    image: *mut c_void,
}

// SAFETY: images belong to the process-wide root domain.
unsafe impl Send for MonoAssembly {}

impl LoadedLibrary for MonoAssembly {
    fn get_symbol(&self, name: &str) -> Result<EntryPoint<'_>, NativeError> {
        let (type_name, method) = split_entry_point(name)?;
        let missing = |message: &str| NativeError::MissingSymbol { name: name.to_string(), message: message.to_string() };

        let desc = CString::new(format!("{}:{}", type_name, method)).map_err(|e| missing(&e.to_string()))?;
        let runtime = self.runtime;

        let thunk = unsafe {
            (runtime.thread_attach)(runtime.domain);
            let desc = (runtime.method_desc_new)(desc.as_ptr(), 1);
            if desc.is_null() {
                return Err(missing("invalid method description"));
            }
            let method = (runtime.method_desc_search_in_image)(desc, self.image);
            (runtime.method_desc_free)(desc);
            if method.is_null() {
                return Err(missing("method not found in the bridging assembly"));
            }
            let thunk = (runtime.method_get_unmanaged_thunk)(method);
            if thunk.is_null() {
                return Err(missing("no unmanaged thunk"));
            }
            std::mem::transmute::<*mut c_void, Thunk>(thunk)
        };

        Ok(EntryPoint::new(name, move |data: &[u8]| {
            let mut exception: *mut c_void = ptr::null_mut();
            let status = unsafe {
                (runtime.thread_attach)(runtime.domain);
                thunk(data.as_ptr() as *const c_void, data.len() as c_int, &mut exception)
            };
            if !exception.is_null() {
                warn!("managed exception escaped the entry point");
                return -1;
            }
            status
        }))
    }
}

pub(crate) fn load(runtime: &RuntimeDescriptor, path: &Path) -> Result<Box<dyn LoadedLibrary>, NativeError> {
    let mono = MONO.get_or_try_init(|| MonoRuntime::start(runtime))?;
    if !starts_same_jit(&mono.started_with, runtime) {
        warn!(running = %mono.started_with, requested = %runtime,
              "mono is already running with other settings, reusing it");
    }

    let assembly_path = path_cstring(path)?;
    let image = unsafe {
        (mono.thread_attach)(mono.domain);
        let assembly = (mono.domain_assembly_open)(mono.domain, assembly_path.as_ptr());
        if assembly.is_null() {
            return Err(NativeError::LibraryLoad {
                path: path.to_path_buf(),
                message: String::from("mono_domain_assembly_open failed"),
            });
        }
        (mono.assembly_get_image)(assembly)
    };
    debug!(assembly = %path.display(), "bridging assembly loaded into mono");

    Ok(Box::new(MonoAssembly { runtime: mono, image }))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_explicit_libmono_wins() {
        let runtime = RuntimeDescriptor::mono()
            .with_primary_library_path("/opt/mono/lib/libmonosgen-2.0.so")
            .with_search_path("/ignored");
        assert_eq!(libmono_candidates(&runtime), vec![PathBuf::from("/opt/mono/lib/libmonosgen-2.0.so")]);
    }

    #[test]
    fn test_search_paths_before_system_loader() {
        let runtime = RuntimeDescriptor::mono().with_search_path("/opt/mono/lib");
        let candidates = libmono_candidates(&runtime);
        assert_eq!(candidates.len(), LIBMONO_NAMES.len() * 2);
        assert_eq!(candidates[0], PathBuf::from("/opt/mono/lib").join(LIBMONO_NAMES[0]));
        assert_eq!(candidates[LIBMONO_NAMES.len()], PathBuf::from(LIBMONO_NAMES[0]));
    }

    #[test]
    fn test_other_libmono_is_a_different_jit() {
        let started = RuntimeDescriptor::mono().with_primary_library_path("/opt/mono/lib/libmonosgen-2.0.so");
        assert!(starts_same_jit(&started, &started.clone()));
        assert!(!starts_same_jit(&started, &RuntimeDescriptor::mono()));
        assert!(!starts_same_jit(&started, &started.clone().with_config_path("/etc/mono/config")));
        // Search paths are irrelevant once the library is pinned.
        assert!(starts_same_jit(&started, &started.clone().with_search_path("/usr/lib")));
    }

    #[test]
    fn test_missing_libmono() {
        let runtime = RuntimeDescriptor::mono().with_primary_library_path("/nonexistent/libmono-2.0.so.1");
        assert!(matches!(open_libmono(&runtime), Err(NativeError::LibraryLoad { .. })));
    }
}
