use std::path::PathBuf;

use pynet_common::runtime::{RuntimeDescriptor, RuntimeKind};
use pynet_common::ConfigError;
use thiserror::Error;

/// Failures at the native boundary.
#[derive(Debug, Error)]
pub enum NativeError {
    #[error("could not load {}: {message}", .path.display())]
    LibraryLoad {
        path: PathBuf,
        message: String,
    },
    #[error("failed to load symbol {name}: {message}")]
    MissingSymbol {
        name: String,
        message: String,
    },
    #[error("{runtime} host failure: {message}")]
    Runtime {
        runtime: RuntimeKind,
        message: String,
    },
    #[error("the {0} runtime is not supported on this platform")]
    Unsupported(RuntimeKind),
    #[error("could not determine the loader's installation directory")]
    InstallDir,
    #[error("{entry_point} returned {status}")]
    Status {
        entry_point: String,
        status: i32,
    },
}

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("the runtime {0} has already been loaded")]
    AlreadyInitialized(RuntimeDescriptor),
    #[error("failed to initialize {}: {source}", .path.display())]
    Initialization {
        path: PathBuf,
        #[source]
        source: NativeError,
    },
    #[error("failed to shut down pythonnet: {source}")]
    Shutdown {
        #[source]
        source: NativeError,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}
