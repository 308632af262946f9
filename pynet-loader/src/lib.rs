//! Loads the pythonnet bridging assembly into a .NET runtime, once per process.
//!
//! A runtime is chosen with [`select_runtime`] (or picked from the platform
//! default at [`initialize`] time), the bridge is initialized with
//! [`initialize`] and torn down with [`shutdown`], which also runs
//! automatically at process exit.

#[cfg(unix)]
mod unix;

#[cfg(target_os = "windows")]
mod windows;

#[cfg(feature = "coreclr")]
mod coreclr;
mod mono;
#[cfg(target_os = "windows")]
mod netfx;

pub mod error;
pub mod ffi;
pub mod hooks;
pub mod host;
pub mod libpython;
pub mod loader;

use std::sync::Arc;

use once_cell::sync::Lazy;

use pynet_common::locator;
use pynet_common::runtime::RuntimeDescriptor;

#[cfg(unix)]
pub use crate::unix::UnixImageLocator as OsImageLocator;

#[cfg(target_os = "windows")]
pub use crate::windows::WindowsImageLocator as OsImageLocator;

pub use crate::error::{LoaderError, NativeError};
pub use crate::hooks::ShutdownHooks;
pub use crate::host::{EntryPoint, LoadedLibrary, PlatformHost, RuntimeHost};
pub use crate::loader::{Loader, Phase, RuntimeInfo};
pub use pynet_common::prelude;

static LOADER: Lazy<Arc<Loader>> = Lazy::new(Loader::for_process);

/// The process-wide loader.
pub fn loader() -> Arc<Loader> {
    LOADER.clone()
}

pub fn select_runtime(descriptor: RuntimeDescriptor) -> Result<(), LoaderError> {
    LOADER.select(descriptor)
}

pub fn select_runtime_from_env() -> Result<(), LoaderError> {
    LOADER.select_from_env()
}

pub fn initialize() -> Result<(), LoaderError> {
    LOADER.initialize()
}

pub fn shutdown() -> Result<(), LoaderError> {
    LOADER.shutdown()
}

pub fn default_runtime_for_platform() -> RuntimeDescriptor {
    locator::default_for_platform()
}

pub fn runtime_info() -> Option<RuntimeInfo> {
    LOADER.runtime_info()
}
