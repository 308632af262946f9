pub mod config;
pub mod libpython;
pub mod locator;
pub mod runtime;
pub mod sysconfig;

pub use crate::config::ConfigError;
pub use crate::sysconfig::SysconfigError;

pub mod prelude {
    pub use crate::config::*;
    pub use crate::libpython::{LibPythonSearch, SearchPlatform};
    pub use crate::locator::{candidates_for, default_for_platform, HostOs, HostPlatform};
    pub use crate::runtime::{RuntimeDescriptor, RuntimeKind};
    pub use crate::sysconfig::BuildConfig;
}
