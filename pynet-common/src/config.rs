use std::env::current_exe;
use std::ffi::{CStr, OsStr, OsString};
use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

use crate::locator;
use crate::runtime::{RuntimeDescriptor, RuntimeKind};

/// Names the runtime to use: `netfx`, `mono`, `coreclr` or `default`.
pub const RUNTIME_VAR: &str = "PYTHONNET_RUNTIME";

/// Path of the libpython the managed side binds to. Read by the managed side itself.
pub const PYDLL_VAR: &str = "PYTHONNET_PYDLL";

const PARAM_PREFIX: &str = "PYTHONNET_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid runtime name: '{0}'")]
    UnknownRuntime(String),
    #[error("the {runtime} runtime requires the '{parameter}' parameter")]
    MissingParameter {
        runtime: RuntimeKind,
        parameter: &'static str,
    },
    #[error("unknown parameter '{parameter}' for the {runtime} runtime")]
    UnknownParameter {
        runtime: RuntimeKind,
        parameter: String,
    },
}

/// Locates images mapped into the current process.
///
/// Implemented per operating system by the loader.
pub trait ImageLocator {
    /// Path of the image that contains the loader code itself.
    fn get_module_path() -> Option<PathBuf>;

    /// Path of an already loaded image exporting `symbol`, without loading anything new.
    fn get_image_exporting(symbol: &CStr) -> Option<PathBuf>;

    /// Directory the loader was installed into.
    ///
    /// Falls back to the executable's directory when the loader is linked statically.
    fn install_dir() -> Option<PathBuf> {
        let module_parent = Self::get_module_path();
        if let Some(Some(dir)) = module_parent.map(|s| s.parent().map(PathBuf::from)) {
            return Some(dir);
        }

        if let Ok(Some(dir)) = current_exe().map(|s| s.parent().map(PathBuf::from)) {
            return Some(dir);
        }

        None
    }
}

/// Settings of the loader that are independent of the chosen runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoaderSettings {
    /// Overrides the directory the bridging assembly is looked up under.
    pub install_dir: Option<PathBuf>,
    /// The libpython handed to the managed side on initialization.
    pub python_library: Option<PathBuf>,
}

impl LoaderSettings {
    /// Argument for the Initialize entry point: an explicitly configured
    /// libpython path as UTF-8, otherwise the empty buffer.
    pub fn initialize_payload(&self) -> Vec<u8> {
        match &self.python_library {
            Some(path) => path.to_string_lossy().into_owned().into_bytes(),
            None => Vec::new(),
        }
    }
}

/// Builds a descriptor the way `PYTHONNET_RUNTIME` would.
///
/// `default` resolves to the platform default before parameters are applied.
pub fn descriptor_from_spec<I, K, V>(spec: &str, params: I) -> Result<RuntimeDescriptor, ConfigError>
    where I: IntoIterator<Item=(K, V)>, K: AsRef<str>, V: AsRef<OsStr> {
    let base = if spec == "default" {
        let default = locator::default_for_platform();
        debug!(runtime = %default.kind(), "resolved default runtime spec");
        default
    } else {
        let kind: RuntimeKind = spec.parse()?;
        locator::candidates_for(kind, None)
            .into_iter()
            .next()
            .unwrap_or_else(|| RuntimeDescriptor::new(kind))
    };

    apply_params(base, params)
}

/// Reads `PYTHONNET_RUNTIME` and the matching `PYTHONNET_<RUNTIME>_*` parameters.
pub fn descriptor_from_vars<I: IntoIterator<Item=(OsString, OsString)>>(vars: I) -> Result<RuntimeDescriptor, ConfigError> {
    let vars: Vec<(OsString, OsString)> = vars.into_iter().collect();

    let spec = vars.iter()
        .find(|(k, _)| k == RUNTIME_VAR)
        .map(|(_, v)| v.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("default"));

    descriptor_from_spec_and_vars(&spec, vars)
}

/// Builds a descriptor for `spec`, taking its parameters from `PYTHONNET_<RUNTIME>_*` variables.
pub fn descriptor_from_spec_and_vars<I: IntoIterator<Item=(OsString, OsString)>>(spec: &str, vars: I) -> Result<RuntimeDescriptor, ConfigError> {
    let kind = if spec == "default" {
        locator::default_for_platform().kind()
    } else {
        spec.parse()?
    };

    descriptor_from_spec(spec, params_from_vars(kind, vars))
}

pub fn descriptor_from_env() -> Result<RuntimeDescriptor, ConfigError> {
    descriptor_from_vars(std::env::vars_os())
}

/// Collects `PYTHONNET_<RUNTIME>_<PARAM>` variables as lower-cased `(param, value)` pairs.
pub fn params_from_vars<I: IntoIterator<Item=(OsString, OsString)>>(kind: RuntimeKind, vars: I) -> Vec<(String, OsString)> {
    let prefix = format!("{}{}_", PARAM_PREFIX, kind.spec_name().to_uppercase());

    vars.into_iter()
        .filter_map(|(k, v)| {
            let k = k.to_str()?;
            let head = k.get(..prefix.len())?;
            if head.eq_ignore_ascii_case(&prefix) {
                Some((k[prefix.len()..].to_lowercase(), v))
            } else {
                None
            }
        })
        .collect()
}

fn apply_params<I, K, V>(mut descriptor: RuntimeDescriptor, params: I) -> Result<RuntimeDescriptor, ConfigError>
    where I: IntoIterator<Item=(K, V)>, K: AsRef<str>, V: AsRef<OsStr> {
    let kind = descriptor.kind();

    for (name, value) in params {
        let value = PathBuf::from(value.as_ref());
        descriptor = match (kind, name.as_ref()) {
            (RuntimeKind::CoreClrLike, "runtime_config") => descriptor.with_config_path(value),
            (RuntimeKind::CoreClrLike, "dotnet_root") => descriptor.with_search_path(value),
            (RuntimeKind::CoreClrLike, "hostfxr") => descriptor.with_primary_library_path(value),
            (RuntimeKind::Mono, "libmono") => descriptor.with_primary_library_path(value),
            (RuntimeKind::Mono, "config_file") => descriptor.with_config_path(value),
            (RuntimeKind::Mono, "assembly_dir") => descriptor.with_search_path(value),
            (RuntimeKind::DesktopFramework, "config_file") => descriptor.with_config_path(value),
            (RuntimeKind::DesktopFramework, "clr_loader") => descriptor.with_primary_library_path(value),
            (_, other) => return Err(ConfigError::UnknownParameter { runtime: kind, parameter: other.to_string() }),
        };
    }

    if kind == RuntimeKind::CoreClrLike && descriptor.config_path().is_none() {
        return Err(ConfigError::MissingParameter { runtime: kind, parameter: "runtime_config" });
    }

    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;
    use std::path::{Path, PathBuf};

    use crate::config::*;
    use crate::locator::default_for_platform;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(OsString, OsString)> {
        pairs.iter().map(|(k, v)| (OsString::from(k), OsString::from(v))).collect()
    }

    #[test]
    fn test_default_without_env() {
        let descriptor = descriptor_from_vars(vars(&[("PATH", "/usr/bin")])).unwrap();
        assert_eq!(descriptor, default_for_platform());
    }

    #[test]
    fn test_coreclr_from_env() {
        let descriptor = descriptor_from_vars(vars(&[
            ("PYTHONNET_RUNTIME", "coreclr"),
            ("PYTHONNET_CORECLR_RUNTIME_CONFIG", "/app/app.runtimeconfig.json"),
            ("pythonnet_coreclr_DOTNET_ROOT", "/usr/share/dotnet"),
            ("PYTHONNET_MONO_LIBMONO", "/ignored"),
        ])).unwrap();
        assert_eq!(descriptor.kind(), RuntimeKind::CoreClrLike);
        assert_eq!(descriptor.config_path(), Some(Path::new("/app/app.runtimeconfig.json")));
        assert_eq!(descriptor.extra_search_paths(), &[PathBuf::from("/usr/share/dotnet")]);
        assert_eq!(descriptor.explicit_library_path(), None);
    }

    #[test]
    fn test_coreclr_requires_runtime_config() {
        let err = descriptor_from_vars(vars(&[("PYTHONNET_RUNTIME", "coreclr")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingParameter { parameter: "runtime_config", .. }));
    }

    #[test]
    fn test_mono_params() {
        let descriptor = descriptor_from_spec("mono", [
            ("libmono", "/opt/mono/lib/libmonosgen-2.0.so"),
            ("config_file", "/etc/mono/config"),
        ]).unwrap();
        assert_eq!(descriptor.explicit_library_path(), Some(Path::new("/opt/mono/lib/libmonosgen-2.0.so")));
        assert_eq!(descriptor.config_path(), Some(Path::new("/etc/mono/config")));
    }

    #[test]
    fn test_unknown_parameter() {
        let err = descriptor_from_spec("netfx", [("domain", "x")]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownParameter { runtime: RuntimeKind::DesktopFramework, parameter } if parameter == "domain"));
    }

    #[test]
    fn test_unknown_runtime() {
        let err = descriptor_from_vars(vars(&[("PYTHONNET_RUNTIME", "java")])).unwrap_err();
        assert_eq!(err.to_string(), "invalid runtime name: 'java'");
    }

    #[test]
    fn test_params_prefix() {
        let params = params_from_vars(RuntimeKind::Mono, vars(&[
            ("PYTHONNET_MONO_LIBMONO", "a"),
            ("PYTHONNET_MONOLITH", "b"),
            ("PYTHONNET_M", "c"),
        ]));
        assert_eq!(params, vec![(String::from("libmono"), OsString::from("a"))]);
    }

    #[test]
    fn test_settings_payload() {
        assert!(LoaderSettings::default().initialize_payload().is_empty());

        let settings = LoaderSettings {
            python_library: Some(PathBuf::from("/usr/lib/libpython3.11.so")),
            ..LoaderSettings::default()
        };
        assert_eq!(settings.initialize_payload(), b"/usr/lib/libpython3.11.so".to_vec());
    }
}
