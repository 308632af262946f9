use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::ConfigError;

/// The CLR implementation a descriptor points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeKind {
    /// The Windows-only .NET Framework.
    DesktopFramework,
    Mono,
    /// .NET Core and later, hosted through `hostfxr` and a `.runtimeconfig.json`.
    CoreClrLike,
}

impl RuntimeKind {
    /// The short name used by `PYTHONNET_RUNTIME` and the `PYTHONNET_<RUNTIME>_*` prefixes.
    pub fn spec_name(&self) -> &'static str {
        match self {
            RuntimeKind::DesktopFramework => "netfx",
            RuntimeKind::Mono => "mono",
            RuntimeKind::CoreClrLike => "coreclr",
        }
    }
}

impl Display for RuntimeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.spec_name())
    }
}

impl FromStr for RuntimeKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "netfx" => Ok(RuntimeKind::DesktopFramework),
            "mono" => Ok(RuntimeKind::Mono),
            "coreclr" => Ok(RuntimeKind::CoreClrLike),
            other => Err(ConfigError::UnknownRuntime(other.to_string())),
        }
    }
}

/// An immutable description of which runtime to host and where to find it.
///
/// An empty `primary_library_path` means "search the default locations".
/// Descriptors of different kinds never compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuntimeDescriptor {
    kind: RuntimeKind,
    primary_library_path: PathBuf,
    config_path: Option<PathBuf>,
    extra_search_paths: Vec<PathBuf>,
}

impl RuntimeDescriptor {
    pub fn new(kind: RuntimeKind) -> RuntimeDescriptor {
        RuntimeDescriptor {
            kind,
            primary_library_path: PathBuf::new(),
            config_path: None,
            extra_search_paths: Vec::new(),
        }
    }

    pub fn desktop_framework() -> RuntimeDescriptor {
        RuntimeDescriptor::new(RuntimeKind::DesktopFramework)
    }

    pub fn mono() -> RuntimeDescriptor {
        RuntimeDescriptor::new(RuntimeKind::Mono)
    }

    /// CoreCLR hosting always needs a runtime configuration file.
    pub fn coreclr(runtime_config: impl Into<PathBuf>) -> RuntimeDescriptor {
        RuntimeDescriptor::new(RuntimeKind::CoreClrLike).with_config_path(runtime_config)
    }

    pub fn with_primary_library_path(mut self, path: impl Into<PathBuf>) -> RuntimeDescriptor {
        self.primary_library_path = path.into();
        self
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> RuntimeDescriptor {
        self.config_path = Some(path.into());
        self
    }

    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> RuntimeDescriptor {
        self.extra_search_paths.push(path.into());
        self
    }

    pub fn kind(&self) -> RuntimeKind {
        self.kind
    }

    pub fn primary_library_path(&self) -> &Path {
        &self.primary_library_path
    }

    /// `None` when the primary library should be located by the runtime's default search.
    pub fn explicit_library_path(&self) -> Option<&Path> {
        if self.primary_library_path.as_os_str().is_empty() {
            None
        } else {
            Some(&self.primary_library_path)
        }
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn extra_search_paths(&self) -> &[PathBuf] {
        &self.extra_search_paths
    }
}

impl Display for RuntimeDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(library) = self.explicit_library_path() {
            write!(f, " ({})", library.display())?;
        }
        if let Some(config) = &self.config_path {
            write!(f, " [{}]", config.display())?;
        }
        Ok(())
    }
}
