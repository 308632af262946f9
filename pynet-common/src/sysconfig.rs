//! Build configuration of a Python interpreter, as recorded by `sysconfig`.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

const QUERY_SCRIPT: &str = r#"
import ctypes, ctypes.util, json, os, sys, sysconfig
var = sysconfig.get_config_var

class DlInfo(ctypes.Structure):
    _fields_ = [("dli_fname", ctypes.c_char_p), ("dli_fbase", ctypes.c_void_p),
                ("dli_sname", ctypes.c_char_p), ("dli_saddr", ctypes.c_void_p)]

def linked():
    try:
        if os.name == "nt":
            from ctypes.wintypes import DWORD, HANDLE, LPWSTR
            get_name = ctypes.windll.kernel32.GetModuleFileNameW
            get_name.argtypes = [HANDLE, LPWSTR, DWORD]
            get_name.restype = DWORD
            buf = ctypes.create_unicode_buffer(260)
            get_name(ctypes.pythonapi._handle, buf, 260)
            return buf.value or None
        if not var("Py_ENABLE_SHARED"):
            return None
        libdl = ctypes.CDLL(ctypes.util.find_library("dl"))
        libdl.dladdr.argtypes = [ctypes.c_void_p, ctypes.POINTER(DlInfo)]
        libdl.dladdr.restype = ctypes.c_int
        info = DlInfo()
        if not libdl.dladdr(ctypes.cast(ctypes.pythonapi.Py_GetVersion, ctypes.c_void_p), ctypes.pointer(info)):
            return None
        path = os.path.realpath(info.dli_fname.decode())
        return None if path == os.path.realpath(sys.executable) else path
    except (AttributeError, OSError, ValueError):
        return None

json.dump({
    "ldlibrary": var("LDLIBRARY"),
    "library": var("LIBRARY"),
    "libpl": var("LIBPL"),
    "srcdir": var("srcdir"),
    "libdir": var("LIBDIR"),
    "version": sysconfig.get_python_version() or "{0}.{1}".format(*sys.version_info),
    "abiflags": var("ABIFLAGS") or var("abiflags") or "",
    "major": sys.version_info[0],
    "executable": sys.executable,
    "exec_prefix": sys.exec_prefix,
    "framework_prefix": var("PYTHONFRAMEWORKPREFIX") or None,
    "enable_shared": bool(var("Py_ENABLE_SHARED")),
    "shlib_suffix": var("SHLIB_SUFFIX"),
    "linked": linked(),
}, sys.stdout)
"#;

#[derive(Debug, Error)]
pub enum SysconfigError {
    #[error("could not run {}: {source}", .python.display())]
    Spawn {
        python: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} exited with {status}: {stderr}", .python.display())]
    Failed {
        python: PathBuf,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("unexpected sysconfig output: {0}")]
    Parse(#[from] serde_json::Error),
}

/// The subset of an interpreter's build configuration that matters for finding libpython.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// `LDLIBRARY`, e.g. `libpython3.11.so`.
    pub ldlibrary: Option<String>,
    /// `LIBRARY`, usually the static archive.
    pub library: Option<String>,
    /// `LIBPL`, where `python-config` looks for the library.
    pub libpl: Option<PathBuf>,
    pub srcdir: Option<PathBuf>,
    /// `LIBDIR`.
    pub libdir: Option<PathBuf>,
    /// `X.Y`.
    pub version: String,
    pub abiflags: String,
    pub major: u32,
    pub executable: Option<PathBuf>,
    pub exec_prefix: Option<PathBuf>,
    /// `PYTHONFRAMEWORKPREFIX`, only set for macOS framework builds.
    pub framework_prefix: Option<PathBuf>,
    /// `Py_ENABLE_SHARED`.
    pub enable_shared: bool,
    pub shlib_suffix: Option<String>,
    /// The libpython image the interpreter itself has mapped, as seen from inside it.
    pub linked: Option<PathBuf>,
}

impl BuildConfig {
    /// Asks `python` for its build configuration.
    pub fn from_interpreter(python: &Path) -> Result<BuildConfig, SysconfigError> {
        debug!(python = %python.display(), "querying sysconfig");
        let output = Command::new(python)
            .args(["-c", QUERY_SCRIPT])
            .output()
            .map_err(|source| SysconfigError::Spawn { python: python.to_path_buf(), source })?;

        if !output.status.success() {
            return Err(SysconfigError::Failed {
                python: python.to_path_buf(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        BuildConfig::from_json(&output.stdout)
    }

    pub fn from_json(json: &[u8]) -> Result<BuildConfig, SysconfigError> {
        Ok(serde_json::from_slice(json)?)
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::*;

    #[test]
    fn test_parse_linux_config() {
        let json = br#"{
            "ldlibrary": "libpython3.11.so",
            "library": "libpython3.11.a",
            "libpl": "/usr/lib/python3.11/config-3.11-x86_64-linux-gnu",
            "srcdir": null,
            "libdir": "/usr/lib",
            "version": "3.11",
            "abiflags": "",
            "major": 3,
            "executable": "/usr/bin/python3",
            "exec_prefix": "/usr",
            "framework_prefix": null,
            "enable_shared": true,
            "shlib_suffix": ".so",
            "linked": "/usr/lib/x86_64-linux-gnu/libpython3.11.so.1.0"
        }"#;
        let config = BuildConfig::from_json(json).unwrap();
        assert_eq!(config.ldlibrary.as_deref(), Some("libpython3.11.so"));
        assert_eq!(config.libdir.as_deref(), Some(Path::new("/usr/lib")));
        assert_eq!(config.srcdir, None);
        assert_eq!(config.executable, Some(PathBuf::from("/usr/bin/python3")));
        assert!(config.enable_shared);
        assert_eq!(config.major, 3);
        assert_eq!(config.linked, Some(PathBuf::from("/usr/lib/x86_64-linux-gnu/libpython3.11.so.1.0")));
    }

    #[test]
    fn test_missing_fields_default() {
        let config = BuildConfig::from_json(br#"{"version": "3.12", "major": 3}"#).unwrap();
        assert_eq!(config.version, "3.12");
        assert!(!config.enable_shared);
        assert_eq!(config.ldlibrary, None);
        assert_eq!(config.linked, None);
    }

    #[test]
    fn test_query_local_interpreter() {
        let config = match BuildConfig::from_interpreter(Path::new("python3")) {
            Err(SysconfigError::Spawn { .. }) => return,
            other => other.unwrap(),
        };
        assert_eq!(config.major, 3);
        if let Some(linked) = &config.linked {
            assert!(config.enable_shared || cfg!(windows));
            assert!(linked.exists());
        }
    }

    #[test]
    fn test_garbage_output() {
        assert!(matches!(BuildConfig::from_json(b"Traceback"), Err(SysconfigError::Parse(_))));
    }
}
