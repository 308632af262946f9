//! C entry points for hosts that are not written in Rust.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int};

use tracing::error;

use crate::error::LoaderError;

fn status(result: Result<(), LoaderError>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "pythonnet loader call failed");
            1
        }
    }
}

/// Selects a runtime by name (`netfx`, `mono`, `coreclr` or `default`).
///
/// # Safety
/// `spec` must be null or point at a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn pynet_select_runtime(spec: *const c_char) -> c_int {
    if spec.is_null() {
        return status(crate::select_runtime_from_env());
    }
    let spec = CStr::from_ptr(spec).to_string_lossy();
    status(crate::loader().select_spec(&spec))
}

#[no_mangle]
pub extern "C" fn pynet_initialize() -> c_int {
    status(crate::initialize())
}

#[no_mangle]
pub extern "C" fn pynet_shutdown() -> c_int {
    status(crate::shutdown())
}
