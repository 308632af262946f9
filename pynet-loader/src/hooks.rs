//! Teardown callbacks run at process exit.

use std::sync::{Arc, Once};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, warn};

pub type ExitHook = Arc<dyn Fn() + Send + Sync>;

static PROCESS_HOOKS: Lazy<Arc<ShutdownHooks>> = Lazy::new(|| Arc::new(ShutdownHooks {
    hooks: Mutex::new(Vec::new()),
    at_exit: true,
    installed: Once::new(),
}));

extern "C" fn run_process_hooks() {
    PROCESS_HOOKS.run();
}

/// A set of hooks, deduplicated by identity, run in reverse registration order.
pub struct ShutdownHooks {
    hooks: Mutex<Vec<ExitHook>>,
    at_exit: bool,
    installed: Once,
}

impl ShutdownHooks {
    /// A registrar that only runs when [`ShutdownHooks::run`] is called.
    pub fn new() -> ShutdownHooks {
        ShutdownHooks { hooks: Mutex::new(Vec::new()), at_exit: false, installed: Once::new() }
    }

    /// The registrar bound to the C runtime's `atexit`.
    pub fn process() -> Arc<ShutdownHooks> {
        PROCESS_HOOKS.clone()
    }

    /// Returns `false` if this very hook is already registered.
    pub fn register(&self, hook: ExitHook) -> bool {
        let mut hooks = self.hooks.lock();
        if hooks.iter().any(|h| same_hook(h, &hook)) {
            debug!("exit hook already registered");
            return false;
        }
        hooks.push(hook);
        drop(hooks);

        if self.at_exit {
            self.installed.call_once(|| {
                if unsafe { libc::atexit(run_process_hooks) } != 0 {
                    warn!("could not register the process exit handler");
                }
            });
        }
        true
    }

    /// Runs and forgets every registered hook, including hooks registered
    /// while running.
    pub fn run(&self) {
        loop {
            let hooks = std::mem::take(&mut *self.hooks.lock());
            if hooks.is_empty() {
                return;
            }
            debug!(count = hooks.len(), "running exit hooks");
            for hook in hooks.iter().rev() {
                hook();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.hooks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ShutdownHooks {
    fn default() -> Self {
        ShutdownHooks::new()
    }
}

fn same_hook(a: &ExitHook, b: &ExitHook) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
