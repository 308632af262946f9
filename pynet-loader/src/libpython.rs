//! libpython discovery bound to this process.

use std::path::PathBuf;

use pynet_common::config::ImageLocator;
use pynet_common::libpython::LibPythonSearch;
use pynet_common::sysconfig::BuildConfig;

use crate::OsImageLocator;

const PY_GET_VERSION: &std::ffi::CStr = c"Py_GetVersion";

/// The libpython image mapped into this process, if the interpreter links one.
///
/// On Unix a static interpreter build exports the same symbols from the
/// executable, so only shared builds are considered.
pub fn linked_libpython(config: &BuildConfig) -> Option<PathBuf> {
    if cfg!(unix) && !config.enable_shared {
        return None;
    }
    OsImageLocator::get_image_exporting(PY_GET_VERSION)
}

/// A search for the libpython belonging to `config`, including the image
/// already linked into this process.
pub fn search(config: BuildConfig) -> LibPythonSearch {
    LibPythonSearch::new(config).with_linked_probe(Box::new(linked_libpython))
}

/// A search on behalf of another interpreter, trusting the libpython it
/// reported as linked when its configuration was queried.
pub fn search_interpreter(config: BuildConfig) -> LibPythonSearch {
    LibPythonSearch::new(config).with_linked_probe(Box::new(recorded_libpython))
}

fn recorded_libpython(config: &BuildConfig) -> Option<PathBuf> {
    config.linked.clone()
}

pub fn find_libpython(config: BuildConfig) -> Option<PathBuf> {
    search(config).find()
}
