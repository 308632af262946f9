//! The process-wide loader state and the transitions between its phases.
//!
//! All three transitions take the same lock for their whole body, so the
//! native entry points are never invoked concurrently or twice.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use pynet_common::config::{self, ImageLocator, LoaderSettings};
use pynet_common::locator::default_for_platform;
use pynet_common::runtime::{RuntimeDescriptor, RuntimeKind};

use crate::error::{LoaderError, NativeError};
use crate::hooks::{ExitHook, ShutdownHooks};
use crate::host::{LoadedLibrary, PlatformHost, RuntimeHost, INITIALIZE_ENTRY_POINT, SHUTDOWN_ENTRY_POINT};
use crate::OsImageLocator;

const BRIDGE_DIR: &str = "runtime";
const BRIDGE_FILE: &str = "Python.Runtime.dll";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unselected,
    Selected,
    Initialized,
    ShutDown,
}

/// A snapshot of the selected runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeInfo {
    pub kind: RuntimeKind,
    pub primary_library_path: PathBuf,
    pub config_path: Option<PathBuf>,
    pub initialized: bool,
}

#[derive(Default)]
struct LoaderState {
    descriptor: Option<RuntimeDescriptor>,
    // Present iff initialized.
    library: Option<Box<dyn LoadedLibrary>>,
    shutdown_hook_registered: bool,
    shut_down: bool,
}

pub struct Loader {
    host: Arc<dyn RuntimeHost>,
    hooks: Arc<ShutdownHooks>,
    settings: LoaderSettings,
    state: Mutex<LoaderState>,
    exit_hook: ExitHook,
}

impl Loader {
    pub fn new(host: Arc<dyn RuntimeHost>, hooks: Arc<ShutdownHooks>, settings: LoaderSettings) -> Arc<Loader> {
        Arc::new_cyclic(|weak: &Weak<Loader>| {
            let weak = weak.clone();
            let exit_hook: ExitHook = Arc::new(move || {
                if let Some(loader) = weak.upgrade() {
                    if let Err(e) = loader.shutdown() {
                        warn!(error = %e, "shutdown at exit failed");
                    }
                }
            });

            Loader { host, hooks, settings, state: Mutex::new(LoaderState::default()), exit_hook }
        })
    }

    /// A loader using the platform's runtimes and the process exit hooks.
    ///
    /// Initialize is always handed the empty buffer; the managed side reads
    /// `PYTHONNET_PYDLL` on its own.
    pub fn for_process() -> Arc<Loader> {
        Loader::with_host(Arc::new(PlatformHost), ShutdownHooks::process())
    }

    pub fn with_host(host: Arc<dyn RuntimeHost>, hooks: Arc<ShutdownHooks>) -> Arc<Loader> {
        Loader::new(host, hooks, LoaderSettings::default())
    }

    pub fn settings(&self) -> &LoaderSettings {
        &self.settings
    }

    /// Chooses the runtime for the next [`Loader::initialize`].
    ///
    /// Replaces any earlier choice unless a runtime is currently loaded.
    pub fn select(&self, descriptor: RuntimeDescriptor) -> Result<(), LoaderError> {
        let mut state = self.state.lock();
        if state.library.is_some() {
            let current = state.descriptor.clone().unwrap_or(descriptor);
            return Err(LoaderError::AlreadyInitialized(current));
        }

        debug!(runtime = %descriptor, "runtime selected");
        state.descriptor = Some(descriptor);
        state.shut_down = false;
        Ok(())
    }

    /// Selects the runtime `PYTHONNET_RUNTIME` and its parameters describe.
    pub fn select_from_env(&self) -> Result<(), LoaderError> {
        self.select_from_vars(std::env::vars_os())
    }

    pub fn select_from_vars<I: IntoIterator<Item=(OsString, OsString)>>(&self, vars: I) -> Result<(), LoaderError> {
        let descriptor = config::descriptor_from_vars(vars)?;
        self.select(descriptor)
    }

    /// Selects a runtime by name, with parameters from `PYTHONNET_<RUNTIME>_*`.
    pub fn select_spec(&self, spec: &str) -> Result<(), LoaderError> {
        let descriptor = config::descriptor_from_spec_and_vars(spec, std::env::vars_os())?;
        self.select(descriptor)
    }

    /// Loads the bridging assembly and runs its Initialize entry point.
    ///
    /// Returns immediately if already initialized. Without a prior selection
    /// the platform default runtime is selected first.
    pub fn initialize(&self) -> Result<(), LoaderError> {
        let mut state = self.state.lock();
        if state.library.is_some() {
            debug!("already initialized");
            return Ok(());
        }

        let descriptor = match state.descriptor.clone() {
            Some(descriptor) => descriptor,
            None => {
                let descriptor = default_for_platform();
                info!(runtime = %descriptor, "no runtime selected, using the platform default");
                state.descriptor = Some(descriptor.clone());
                descriptor
            }
        };

        let path = self.bridge_path();
        let library = self.load(&descriptor, &path)
            .map_err(|source| LoaderError::Initialization { path, source })?;

        if !state.shutdown_hook_registered {
            self.hooks.register(self.exit_hook.clone());
            state.shutdown_hook_registered = true;
            debug!("shutdown hook registered");
        }

        state.library = Some(library);
        state.shut_down = false;
        info!(runtime = %descriptor, "pythonnet initialized");
        Ok(())
    }

    /// Runs the Shutdown entry point and forgets the loaded library.
    ///
    /// The selected runtime is kept, so a later [`Loader::initialize`] loads it again.
    pub fn shutdown(&self) -> Result<(), LoaderError> {
        let mut state = self.state.lock();
        let library = match state.library.take() {
            Some(library) => library,
            None => {
                debug!("not initialized, nothing to shut down");
                return Ok(());
            }
        };
        state.shut_down = true;

        let result = invoke(library.as_ref(), SHUTDOWN_ENTRY_POINT, &[]);
        drop(library);
        match result {
            Ok(()) => {
                info!("pythonnet shut down");
                Ok(())
            }
            Err(source) => Err(LoaderError::Shutdown { source }),
        }
    }

    pub fn phase(&self) -> Phase {
        let state = self.state.lock();
        match (&state.descriptor, &state.library) {
            (_, Some(_)) => Phase::Initialized,
            (None, None) => Phase::Unselected,
            (Some(_), None) if state.shut_down => Phase::ShutDown,
            (Some(_), None) => Phase::Selected,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().library.is_some()
    }

    pub fn descriptor(&self) -> Option<RuntimeDescriptor> {
        self.state.lock().descriptor.clone()
    }

    pub fn runtime_info(&self) -> Option<RuntimeInfo> {
        let state = self.state.lock();
        state.descriptor.as_ref().map(|descriptor| RuntimeInfo {
            kind: descriptor.kind(),
            primary_library_path: descriptor.primary_library_path().to_path_buf(),
            config_path: descriptor.config_path().map(Path::to_path_buf),
            initialized: state.library.is_some(),
        })
    }

    fn bridge_path(&self) -> PathBuf {
        let relative = Path::new(BRIDGE_DIR).join(BRIDGE_FILE);
        match self.settings.install_dir.clone().or_else(OsImageLocator::install_dir) {
            Some(dir) => dir.join(relative),
            None => relative,
        }
    }

    fn load(&self, descriptor: &RuntimeDescriptor, path: &Path) -> Result<Box<dyn LoadedLibrary>, NativeError> {
        if !path.is_absolute() {
            return Err(NativeError::InstallDir);
        }
        debug!(runtime = %descriptor, bridge = %path.display(), "loading bridging assembly");
        let library = self.host.load_library(descriptor, path)?;
        invoke(library.as_ref(), INITIALIZE_ENTRY_POINT, &self.settings.initialize_payload())?;
        Ok(library)
    }
}

fn invoke(library: &dyn LoadedLibrary, name: &str, data: &[u8]) -> Result<(), NativeError> {
    let entry = library.get_symbol(name)?;
    let status = entry.invoke(data);
    debug!(entry_point = entry.name(), status, "entry point returned");
    if status != 0 {
        return Err(NativeError::Status { entry_point: name.to_string(), status });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

    use pynet_common::locator::candidates_for;

    use super::*;
    use crate::host::EntryPoint;

    #[derive(Default)]
    struct Calls {
        loads: Mutex<Vec<(RuntimeDescriptor, PathBuf)>>,
        initialize: Mutex<Vec<Vec<u8>>>,
        shutdown: Mutex<Vec<Vec<u8>>>,
        initialize_status: AtomicI32,
        shutdown_status: AtomicI32,
        fail_load: AtomicBool,
    }

    impl Calls {
        fn loads(&self) -> usize {
            self.loads.lock().len()
        }

        fn initializes(&self) -> usize {
            self.initialize.lock().len()
        }

        fn shutdowns(&self) -> usize {
            self.shutdown.lock().len()
        }
    }

    struct StubHost(Arc<Calls>);

    struct StubLibrary(Arc<Calls>);

    impl RuntimeHost for StubHost {
        fn load_library(&self, runtime: &RuntimeDescriptor, path: &Path) -> Result<Box<dyn LoadedLibrary>, NativeError> {
            if self.0.fail_load.load(Ordering::SeqCst) {
                return Err(NativeError::LibraryLoad { path: path.to_path_buf(), message: String::from("stub refused") });
            }
            self.0.loads.lock().push((runtime.clone(), path.to_path_buf()));
            Ok(Box::new(StubLibrary(self.0.clone())))
        }
    }

    impl LoadedLibrary for StubLibrary {
        fn get_symbol(&self, name: &str) -> Result<EntryPoint<'_>, NativeError> {
            let calls = &self.0;
            match name {
                INITIALIZE_ENTRY_POINT => Ok(EntryPoint::new(name, move |data: &[u8]| {
                    calls.initialize.lock().push(data.to_vec());
                    calls.initialize_status.load(Ordering::SeqCst)
                })),
                SHUTDOWN_ENTRY_POINT => Ok(EntryPoint::new(name, move |data: &[u8]| {
                    calls.shutdown.lock().push(data.to_vec());
                    calls.shutdown_status.load(Ordering::SeqCst)
                })),
                _ => Err(NativeError::MissingSymbol { name: name.to_string(), message: String::from("stub") }),
            }
        }
    }

    fn settings() -> LoaderSettings {
        LoaderSettings { install_dir: Some(PathBuf::from("/opt/pythonnet")), python_library: None }
    }

    fn stub_loader_with(settings: LoaderSettings) -> (Arc<Loader>, Arc<Calls>, Arc<ShutdownHooks>) {
        let calls = Arc::new(Calls::default());
        let hooks = Arc::new(ShutdownHooks::new());
        let loader = Loader::new(Arc::new(StubHost(calls.clone())), hooks.clone(), settings);
        (loader, calls, hooks)
    }

    fn stub_loader() -> (Arc<Loader>, Arc<Calls>, Arc<ShutdownHooks>) {
        stub_loader_with(settings())
    }

    fn coreclr(config: &str) -> RuntimeDescriptor {
        RuntimeDescriptor::coreclr(config)
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let (loader, calls, _) = stub_loader();
        loader.select(coreclr("/app/a.runtimeconfig.json")).unwrap();
        loader.initialize().unwrap();
        loader.initialize().unwrap();
        assert_eq!(calls.loads(), 1);
        assert_eq!(calls.initializes(), 1);
    }

    #[test]
    fn test_reselect_after_initialize_fails() {
        let (loader, _, _) = stub_loader();
        let d1 = coreclr("/app/a.runtimeconfig.json");
        loader.select(d1.clone()).unwrap();
        loader.initialize().unwrap();

        let err = loader.select(RuntimeDescriptor::mono()).unwrap_err();
        assert!(matches!(&err, LoaderError::AlreadyInitialized(d) if *d == d1));
        assert_eq!(loader.descriptor(), Some(d1));
    }

    #[test]
    fn test_reinitialize_reuses_descriptor() {
        let (loader, calls, _) = stub_loader();
        let d1 = coreclr("/app/a.runtimeconfig.json");
        loader.select(d1.clone()).unwrap();
        loader.initialize().unwrap();
        loader.shutdown().unwrap();
        loader.initialize().unwrap();

        let loads = calls.loads.lock();
        assert_eq!(loads.len(), 2);
        assert!(loads.iter().all(|(d, _)| *d == d1));
    }

    #[test]
    fn test_default_fallback() {
        let (loader, calls, _) = stub_loader();
        loader.initialize().unwrap();
        assert_eq!(loader.descriptor(), Some(default_for_platform()));
        assert_eq!(calls.loads.lock()[0].0, default_for_platform());
    }

    #[test]
    fn test_shutdown_without_initialize() {
        let (loader, calls, hooks) = stub_loader();
        loader.shutdown().unwrap();
        assert_eq!(calls.loads(), 0);
        assert_eq!(calls.shutdowns(), 0);
        assert!(hooks.is_empty());
        assert_eq!(loader.phase(), Phase::Unselected);
    }

    #[test]
    fn test_mono_with_empty_library_path() {
        let (loader, calls, _) = stub_loader();
        let mono = candidates_for(RuntimeKind::Mono, None).remove(0);
        assert_eq!(mono.primary_library_path(), Path::new(""));

        loader.select(mono).unwrap();
        loader.initialize().unwrap();
        assert!(loader.is_initialized());
        assert_eq!(*calls.initialize.lock(), vec![Vec::<u8>::new()]);
        assert_eq!(calls.loads.lock()[0].1, Path::new("/opt/pythonnet/runtime/Python.Runtime.dll"));
    }

    #[test]
    fn test_initialize_status_failure() {
        let (loader, calls, hooks) = stub_loader();
        calls.initialize_status.store(1, Ordering::SeqCst);
        loader.select(RuntimeDescriptor::mono()).unwrap();

        let err = loader.initialize().unwrap_err();
        assert!(matches!(err, LoaderError::Initialization { source: NativeError::Status { status: 1, .. }, .. }));
        assert!(!loader.is_initialized());
        assert!(hooks.is_empty());
        assert_eq!(loader.phase(), Phase::Selected);
    }

    #[test]
    fn test_exit_hook_after_explicit_shutdown() {
        let (loader, calls, hooks) = stub_loader();
        loader.select(RuntimeDescriptor::mono()).unwrap();
        loader.initialize().unwrap();
        assert_eq!(hooks.len(), 1);

        loader.shutdown().unwrap();
        hooks.run();
        assert_eq!(calls.shutdowns(), 1);
        assert!(hooks.is_empty());
    }

    #[test]
    fn test_exit_hook_shuts_down() {
        let (loader, calls, hooks) = stub_loader();
        loader.initialize().unwrap();
        hooks.run();
        hooks.run();
        assert_eq!(*calls.shutdown.lock(), vec![Vec::<u8>::new()]);
        assert_eq!(loader.phase(), Phase::ShutDown);
    }

    #[test]
    fn test_hook_registered_once() {
        let (loader, _, hooks) = stub_loader();
        loader.initialize().unwrap();
        loader.shutdown().unwrap();
        loader.initialize().unwrap();
        assert_eq!(hooks.len(), 1);
    }

    #[test]
    fn test_failed_load_can_be_retried() {
        let (loader, calls, _) = stub_loader();
        calls.fail_load.store(true, Ordering::SeqCst);

        let err = loader.initialize().unwrap_err();
        assert!(matches!(err, LoaderError::Initialization { source: NativeError::LibraryLoad { .. }, .. }));
        assert!(err.to_string().contains("stub refused"));

        calls.fail_load.store(false, Ordering::SeqCst);
        loader.initialize().unwrap();
        assert!(loader.is_initialized());
    }

    #[test]
    fn test_shutdown_failure_still_clears() {
        let (loader, calls, _) = stub_loader();
        calls.shutdown_status.store(-1, Ordering::SeqCst);
        loader.initialize().unwrap();

        let err = loader.shutdown().unwrap_err();
        assert!(matches!(err, LoaderError::Shutdown { source: NativeError::Status { status: -1, .. } }));
        assert!(!loader.is_initialized());
        loader.shutdown().unwrap();
        assert_eq!(calls.shutdowns(), 1);
    }

    #[test]
    fn test_python_library_payload() {
        let (loader, calls, _) = stub_loader_with(LoaderSettings {
            python_library: Some(PathBuf::from("/usr/lib/libpython3.11.so")),
            ..settings()
        });
        loader.initialize().unwrap();
        assert_eq!(*calls.initialize.lock(), vec![b"/usr/lib/libpython3.11.so".to_vec()]);
    }

    #[test]
    fn test_pydll_env_leaves_payload_empty() {
        let calls = Arc::new(Calls::default());
        let hooks = Arc::new(ShutdownHooks::new());
        std::env::set_var(config::PYDLL_VAR, "/usr/lib/libpython3.11.so");
        let loader = Loader::with_host(Arc::new(StubHost(calls.clone())), hooks);

        loader.select(RuntimeDescriptor::mono()).unwrap();
        let result = loader.initialize();
        std::env::remove_var(config::PYDLL_VAR);

        result.unwrap();
        assert_eq!(*calls.initialize.lock(), vec![Vec::<u8>::new()]);
    }

    #[test]
    fn test_select_overwrites_before_initialize() {
        let (loader, calls, _) = stub_loader();
        loader.select(RuntimeDescriptor::mono()).unwrap();
        loader.select(coreclr("/app/b.runtimeconfig.json")).unwrap();
        loader.initialize().unwrap();
        assert_eq!(calls.loads.lock()[0].0.kind(), RuntimeKind::CoreClrLike);
    }

    #[test]
    fn test_phases() {
        let (loader, _, _) = stub_loader();
        assert_eq!(loader.phase(), Phase::Unselected);
        loader.select(RuntimeDescriptor::mono()).unwrap();
        assert_eq!(loader.phase(), Phase::Selected);
        loader.initialize().unwrap();
        assert_eq!(loader.phase(), Phase::Initialized);
        loader.shutdown().unwrap();
        assert_eq!(loader.phase(), Phase::ShutDown);
        loader.select(RuntimeDescriptor::desktop_framework()).unwrap();
        assert_eq!(loader.phase(), Phase::Selected);
    }

    #[test]
    fn test_concurrent_initialize() {
        let (loader, calls, _) = stub_loader();
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| loader.initialize().unwrap());
            }
        });
        assert_eq!(calls.initializes(), 1);
    }

    #[test]
    fn test_runtime_info() {
        let (loader, _, _) = stub_loader();
        assert_eq!(loader.runtime_info(), None);

        loader.select(coreclr("/app/a.runtimeconfig.json")).unwrap();
        let info = loader.runtime_info().unwrap();
        assert_eq!(info.kind, RuntimeKind::CoreClrLike);
        assert_eq!(info.config_path.as_deref(), Some(Path::new("/app/a.runtimeconfig.json")));
        assert!(!info.initialized);

        loader.initialize().unwrap();
        assert!(loader.runtime_info().unwrap().initialized);
    }

    #[test]
    fn test_select_from_vars() {
        let (loader, _, _) = stub_loader();
        loader.select_from_vars(vec![
            (OsString::from("PYTHONNET_RUNTIME"), OsString::from("coreclr")),
            (OsString::from("PYTHONNET_CORECLR_RUNTIME_CONFIG"), OsString::from("/app/c.runtimeconfig.json")),
        ]).unwrap();
        assert_eq!(loader.descriptor(), Some(coreclr("/app/c.runtimeconfig.json")));

        let err = loader.select_from_vars(vec![
            (OsString::from("PYTHONNET_RUNTIME"), OsString::from("coreclr")),
        ]).unwrap_err();
        assert!(matches!(err, LoaderError::Config(_)));
    }

    #[test]
    fn test_exit_hook_outlived_by_hooks() {
        let (loader, calls, hooks) = stub_loader();
        loader.initialize().unwrap();
        drop(loader);
        hooks.run();
        assert_eq!(calls.shutdowns(), 0);
    }
}
