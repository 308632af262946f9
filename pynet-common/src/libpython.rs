//! Locating the libpython that belongs to an interpreter.
//!
//! No single heuristic holds across shared and static builds, virtual
//! environments, macOS frameworks and custom prefixes, so several independent
//! probes are chained in descending order of confidence. Every candidate is
//! resolved to a real path and kept only if it exists; nothing is ever loaded.

use std::collections::HashSet;
use std::ffi::OsString;
use std::hash::Hash;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::sysconfig::BuildConfig;

/// Reports the libpython image already mapped into the process, if any.
pub type LinkedProbe = Box<dyn Fn(&BuildConfig) -> Option<PathBuf> + Send + Sync>;

/// Platform conventions that influence library naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchPlatform {
    pub windows: bool,
    pub apple: bool,
}

impl SearchPlatform {
    pub fn current() -> SearchPlatform {
        SearchPlatform {
            windows: cfg!(windows),
            apple: cfg!(target_os = "macos"),
        }
    }

    /// Directories the platform's own loader searches by default.
    pub fn library_dirs(&self) -> Vec<PathBuf> {
        let var = if self.windows {
            "PATH"
        } else if self.apple {
            "DYLD_LIBRARY_PATH"
        } else {
            "LD_LIBRARY_PATH"
        };

        let mut dirs: Vec<PathBuf> = std::env::var_os(var)
            .map(|paths| std::env::split_paths(&paths).collect())
            .unwrap_or_default();

        if !self.windows {
            dirs.extend(["/usr/local/lib", "/usr/lib", "/lib"].iter().map(PathBuf::from));
        }
        if !self.windows && !self.apple {
            dirs.extend(["/usr/lib64", "/lib64"].iter().map(PathBuf::from));
            if let Some(multiarch) = multiarch_triple() {
                dirs.push(PathBuf::from("/usr/lib").join(multiarch));
                dirs.push(PathBuf::from("/lib").join(multiarch));
            }
        }
        dirs
    }
}

fn multiarch_triple() -> Option<&'static str> {
    match std::env::consts::ARCH {
        "x86_64" => Some("x86_64-linux-gnu"),
        "x86" => Some("i386-linux-gnu"),
        "aarch64" => Some("aarch64-linux-gnu"),
        "arm" => Some("arm-linux-gnueabihf"),
        _ => None,
    }
}

/// A restartable search for libpython.
///
/// Each call to [`LibPythonSearch::finding`] starts over and yields existing,
/// de-duplicated real paths, best guess first.
pub struct LibPythonSearch {
    config: BuildConfig,
    platform: SearchPlatform,
    linked_probe: Option<LinkedProbe>,
    system_dirs: Vec<PathBuf>,
}

impl LibPythonSearch {
    pub fn new(config: BuildConfig) -> LibPythonSearch {
        let platform = SearchPlatform::current();
        LibPythonSearch {
            config,
            platform,
            linked_probe: None,
            system_dirs: platform.library_dirs(),
        }
    }

    pub fn with_platform(mut self, platform: SearchPlatform) -> LibPythonSearch {
        self.platform = platform;
        self
    }

    pub fn with_linked_probe(mut self, probe: LinkedProbe) -> LibPythonSearch {
        self.linked_probe = Some(probe);
        self
    }

    pub fn with_system_dirs(mut self, dirs: Vec<PathBuf>) -> LibPythonSearch {
        self.system_dirs = dirs;
        self
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// The shared library suffix, `.dylib` on macOS regardless of what sysconfig says.
    pub fn shlib_suffix(&self) -> String {
        if self.platform.apple {
            return String::from(".dylib");
        }
        match &self.config.shlib_suffix {
            Some(suffix) if !suffix.is_empty() => suffix.clone(),
            _ if self.platform.windows => String::from(".dll"),
            _ => String::from(".so"),
        }
    }

    /// File names libpython may have, most specific first.
    pub fn candidate_names(&self) -> impl Iterator<Item=String> + '_ {
        let suffix = self.shlib_suffix();
        let config = &self.config;

        let ldlibrary = config.ldlibrary.iter()
            .filter(|name| !name.ends_with(".a"))
            .cloned();

        let library = config.library.iter()
            .filter(|name| !name.ends_with(".a"))
            .map({
                let suffix = suffix.clone();
                move |name| format!("{}{}", strip_extension(name), suffix)
            });

        let dlprefix = if self.platform.windows { "" } else { "lib" };
        let stems = [
            format!("python{}{}", config.version, config.abiflags),
            format!("python{}", config.version),
            format!("python{}", config.major),
            String::from("python"),
        ];
        let conventional = stems.into_iter()
            .map(move |stem| format!("{}{}{}", dlprefix, stem, suffix));

        unique(ldlibrary.chain(library).chain(conventional))
    }

    /// Every place libpython could be, in priority order. Paths may not exist.
    pub fn candidate_paths(&self) -> impl Iterator<Item=PathBuf> + '_ {
        let linked = std::iter::once_with(move || {
            self.linked_probe.as_ref().and_then(|probe| probe(&self.config))
        }).flatten();

        let names: Vec<String> = self.candidate_names().collect();

        let in_dirs = {
            let names = names.clone();
            self.library_dirs()
                .into_iter()
                .flat_map(move |dir| names.clone().into_iter().map(move |name| dir.join(name)))
        };

        let from_system = names.into_iter()
            .filter_map(move |name| self.find_library(library_name(&name, &self.shlib_suffix(), self.platform.windows)));

        unique(linked.chain(in_dirs).chain(from_system))
    }

    /// Existing libpython images, best guess first.
    pub fn finding(&self) -> impl Iterator<Item=PathBuf> + '_ {
        let suffix = self.shlib_suffix();
        let apple = self.platform.apple;

        unique(self.candidate_paths().filter_map(move |path| {
            debug!(candidate = %path.display(), "Candidate");
            let normalized = normalize_path(&path, &suffix, apple);
            match &normalized {
                Some(found) => debug!(path = %found.display(), "Found"),
                None => debug!("Not found."),
            }
            normalized
        }))
    }

    /// The single best guess, if anything was found.
    pub fn find(&self) -> Option<PathBuf> {
        self.finding().next()
    }

    fn library_dirs(&self) -> Vec<PathBuf> {
        let config = &self.config;
        let mut dirs = Vec::new();

        // LIBPL is what python-config uses for static builds; the rest are fallbacks.
        dirs.extend(config.libpl.clone());
        dirs.extend(config.srcdir.clone());
        dirs.extend(config.libdir.clone());

        if let Some(exe) = &config.executable {
            if self.platform.windows {
                dirs.extend(exe.parent().map(PathBuf::from));
            } else {
                dirs.extend(exe.parent().and_then(Path::parent).map(|p| p.join("lib")));
            }
        }

        dirs.extend(config.framework_prefix.clone());

        if let Some(prefix) = &config.exec_prefix {
            dirs.push(prefix.clone());
            dirs.push(prefix.join("lib"));
        }

        dirs.retain(|dir| !dir.as_os_str().is_empty());
        dirs
    }

    /// Resolves a bare library name the way the platform loader would.
    fn find_library(&self, name: &str) -> Option<PathBuf> {
        let prefix = if self.platform.windows { "" } else { "lib" };
        let file_name = format!("{}{}{}", prefix, name, self.shlib_suffix());

        self.system_dirs.iter()
            .map(|dir| dir.join(&file_name))
            .find(|path| path.is_file())
    }
}

/// Strips the `lib` prefix and the shared library suffix off a file name.
///
/// `libpython3.7m.so` becomes `python3.7m`; `python37.dll` becomes `python37` on Windows.
pub fn library_name<'a>(name: &'a str, suffix: &str, windows: bool) -> &'a str {
    let mut name = name;
    if !windows {
        name = name.strip_prefix("lib").unwrap_or(name);
    }
    if !suffix.is_empty() {
        name = name.strip_suffix(suffix).unwrap_or(name);
    }
    name
}

/// Resolves a candidate to an existing real path.
///
/// Relative paths are rejected. A path that does not exist is retried with
/// `suffix` appended, and on macOS once more with `.so` in place of `.dylib`.
pub fn normalize_path(path: &Path, suffix: &str, apple: bool) -> Option<PathBuf> {
    if path.as_os_str().is_empty() || !path.is_absolute() {
        return None;
    }
    if path.exists() {
        return dunce::canonicalize(path).ok();
    }

    let mut with_suffix = OsString::from(path.as_os_str());
    with_suffix.push(suffix);
    let with_suffix = PathBuf::from(with_suffix);
    if with_suffix.exists() {
        return dunce::canonicalize(with_suffix).ok();
    }

    if apple {
        return normalize_path(&remove_suffix_apple(path), ".so", false);
    }
    None
}

fn remove_suffix_apple(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    let stripped = text.strip_suffix(".dylib")
        .or_else(|| text.strip_suffix(".so"))
        .unwrap_or(&text);
    PathBuf::from(stripped)
}

fn strip_extension(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}

/// Drops repeated items while keeping first-seen order.
fn unique<T: Eq + Hash + Clone>(items: impl Iterator<Item=T>) -> impl Iterator<Item=T> {
    let mut seen = HashSet::new();
    items.filter(move |item| seen.insert(item.clone()))
}
