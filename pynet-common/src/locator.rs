//! Side-effect free runtime selection.
//!
//! Nothing in here touches the filesystem or loads anything; the functions only
//! look at the identity of the host they are handed.

use std::path::Path;

use crate::runtime::{RuntimeDescriptor, RuntimeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOs {
    Windows,
    MacOs,
    Linux,
    Other,
}

/// Operating system family and pointer width of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPlatform {
    pub os: HostOs,
    pub pointer_width: u32,
}

impl HostPlatform {
    pub fn current() -> HostPlatform {
        let os = if cfg!(windows) {
            HostOs::Windows
        } else if cfg!(target_os = "macos") {
            HostOs::MacOs
        } else if cfg!(target_os = "linux") {
            HostOs::Linux
        } else {
            HostOs::Other
        };
        HostPlatform { os, pointer_width: usize::BITS }
    }

    pub fn is_windows(&self) -> bool {
        self.os == HostOs::Windows
    }
}

/// The runtime used when nobody picked one: .NET Framework on Windows, Mono elsewhere.
pub fn default_for_platform() -> RuntimeDescriptor {
    default_for(&HostPlatform::current())
}

pub fn default_for(platform: &HostPlatform) -> RuntimeDescriptor {
    if platform.is_windows() {
        conventional(RuntimeKind::DesktopFramework, platform)
    } else {
        conventional(RuntimeKind::Mono, platform)
    }
}

/// Enumerates descriptors for `kind` on the current host.
///
/// CoreCLR has no conventional location for its runtime configuration, so it
/// yields nothing unless `runtime_config` is supplied.
pub fn candidates_for(kind: RuntimeKind, runtime_config: Option<&Path>) -> Vec<RuntimeDescriptor> {
    candidates_for_platform(kind, runtime_config, &HostPlatform::current())
}

pub fn candidates_for_platform(kind: RuntimeKind, runtime_config: Option<&Path>,
                               platform: &HostPlatform) -> Vec<RuntimeDescriptor> {
    match kind {
        RuntimeKind::CoreClrLike => runtime_config
            .map(|config| vec![RuntimeDescriptor::coreclr(config)])
            .unwrap_or_default(),
        RuntimeKind::Mono | RuntimeKind::DesktopFramework => vec![conventional(kind, platform)],
    }
}

fn conventional(kind: RuntimeKind, platform: &HostPlatform) -> RuntimeDescriptor {
    let mut descriptor = RuntimeDescriptor::new(kind);
    if kind == RuntimeKind::Mono {
        for dir in mono_install_dirs(platform) {
            descriptor = descriptor.with_search_path(dir);
        }
    }
    descriptor
}

fn mono_install_dirs(platform: &HostPlatform) -> &'static [&'static str] {
    match (platform.os, platform.pointer_width) {
        (HostOs::Windows, 64) => &[r"C:\Program Files\Mono\bin"],
        (HostOs::Windows, _) => &[r"C:\Program Files (x86)\Mono\bin"],
        (HostOs::MacOs, _) => &["/Library/Frameworks/Mono.framework/Versions/Current/lib"],
        // The system loader already covers the usual prefixes.
        _ => &[],
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::*;

    const WIN64: HostPlatform = HostPlatform { os: HostOs::Windows, pointer_width: 64 };
    const WIN32: HostPlatform = HostPlatform { os: HostOs::Windows, pointer_width: 32 };
    const LINUX: HostPlatform = HostPlatform { os: HostOs::Linux, pointer_width: 64 };
    const MACOS: HostPlatform = HostPlatform { os: HostOs::MacOs, pointer_width: 64 };

    #[test]
    fn test_default_is_netfx_on_windows() {
        assert_eq!(default_for(&WIN64).kind(), RuntimeKind::DesktopFramework);
        assert_eq!(default_for(&WIN32).kind(), RuntimeKind::DesktopFramework);
    }

    #[test]
    fn test_default_is_mono_elsewhere() {
        assert_eq!(default_for(&LINUX).kind(), RuntimeKind::Mono);
        assert_eq!(default_for(&MACOS).kind(), RuntimeKind::Mono);
        assert_eq!(default_for(&HostPlatform { os: HostOs::Other, pointer_width: 64 }).kind(),
                   RuntimeKind::Mono);
    }

    #[test]
    fn test_default_matches_current_host() {
        assert_eq!(default_for_platform(), default_for(&HostPlatform::current()));
    }

    #[test]
    fn test_coreclr_needs_config() {
        assert!(candidates_for_platform(RuntimeKind::CoreClrLike, None, &LINUX).is_empty());

        let found = candidates_for_platform(RuntimeKind::CoreClrLike,
                                            Some(Path::new("/app/app.runtimeconfig.json")), &LINUX);
        assert_eq!(found, vec![RuntimeDescriptor::coreclr("/app/app.runtimeconfig.json")]);
    }

    #[test]
    fn test_mono_candidates_defer_library_search() {
        let found = candidates_for_platform(RuntimeKind::Mono, None, &WIN32);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].primary_library_path(), Path::new(""));
        assert_eq!(found[0].extra_search_paths(), &[PathBuf::from(r"C:\Program Files (x86)\Mono\bin")]);

        let found = candidates_for_platform(RuntimeKind::DesktopFramework, None, &WIN64);
        assert_eq!(found, vec![RuntimeDescriptor::desktop_framework()]);
    }
}
