//! Deferred cleanup registry.
//!
//! Resources acquired during a run (producer threads, open readers, staged
//! files, transactions) register a cleanup action here at acquisition time.
//! Each action runs at most once: early through [`Finalizer::release`], or in
//! reverse registration order from [`Finalizer::run_all`] / drop. A resource
//! that closed normally calls [`Finalizer::dismiss`] instead.

use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

type CleanupAction = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Handle returned by [`Finalizer::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CleanupToken(u64);

struct Entry {
    token: CleanupToken,
    name: String,
    action: CleanupAction,
}

#[derive(Default)]
struct Registry {
    next_token: u64,
    entries: Vec<Entry>,
}

impl Registry {
    fn take_all(&mut self) -> Vec<Entry> {
        std::mem::take(&mut self.entries)
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let entries = self.take_all();
        if !entries.is_empty() {
            debug!("Running {} leftover cleanup actions", entries.len());
            run_entries(entries);
        }
    }
}

/// Shared cleanup registry. Clones refer to the same registry.
#[derive(Clone, Default)]
pub struct Finalizer {
    inner: Arc<Mutex<Registry>>,
}

impl Finalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cleanup action.
    pub fn register<F>(&self, name: impl Into<String>, action: F) -> CleanupToken
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let mut registry = self.lock();
        let token = CleanupToken(registry.next_token);
        registry.next_token += 1;
        registry.entries.push(Entry {
            token,
            name: name.into(),
            action: Box::new(action),
        });
        token
    }

    /// Run one action now. Unknown or already-run tokens are ignored.
    pub fn release(&self, token: CleanupToken) {
        let entry = {
            let mut registry = self.lock();
            registry
                .entries
                .iter()
                .position(|e| e.token == token)
                .map(|pos| registry.entries.remove(pos))
        };
        if let Some(entry) = entry {
            run_entry(entry);
        }
    }

    /// Forget an action without running it, once its resource was handed
    /// off or closed normally.
    pub fn dismiss(&self, token: CleanupToken) {
        let entry = {
            let mut registry = self.lock();
            registry
                .entries
                .iter()
                .position(|e| e.token == token)
                .map(|pos| registry.entries.remove(pos))
        };
        // the action may own resources with their own Drop
        drop(entry);
    }

    /// Run every pending action in reverse registration order.
    ///
    /// Failures are logged and never propagated.
    pub fn run_all(&self) {
        let entries = self.lock().take_all();
        run_entries(entries);
    }

    pub fn pending(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        // A panicking cleanup must not disable the remaining ones.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn run_entries(entries: Vec<Entry>) {
    for entry in entries.into_iter().rev() {
        run_entry(entry);
    }
}

fn run_entry(entry: Entry) {
    debug!(cleanup = %entry.name, "Running cleanup");
    if let Err(err) = (entry.action)() {
        warn!(cleanup = %entry.name, "Cleanup failed: {:#}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> CleanupAction) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let make = move |name: &'static str| -> CleanupAction {
            let log = log2.clone();
            Box::new(move || {
                log.lock().unwrap().push(name);
                Ok(())
            })
        };
        (log, make)
    }

    #[test]
    fn runs_in_reverse_order_once() {
        let (log, make) = recorder();
        let finalizer = Finalizer::new();
        finalizer.register("a", make("a"));
        finalizer.register("b", make("b"));
        finalizer.register("c", make("c"));

        finalizer.run_all();
        finalizer.run_all();
        drop(finalizer);

        assert_eq!(*log.lock().unwrap(), vec!["c", "b", "a"]);
    }

    #[test]
    fn failures_do_not_stop_other_actions() {
        let (log, make) = recorder();
        let finalizer = Finalizer::new();
        finalizer.register("first", make("first"));
        finalizer.register("broken", || Err(anyhow::anyhow!("disk gone")));
        finalizer.register("last", make("last"));

        finalizer.run_all();
        assert_eq!(*log.lock().unwrap(), vec!["last", "first"]);
    }

    #[test]
    fn release_runs_early_and_skips_later() {
        let (log, make) = recorder();
        let finalizer = Finalizer::new();
        let a = finalizer.register("a", make("a"));
        finalizer.register("b", make("b"));

        finalizer.release(a);
        finalizer.release(a);
        assert_eq!(finalizer.pending(), 1);

        finalizer.run_all();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn dismissed_actions_never_run() {
        let (log, make) = recorder();
        let finalizer = Finalizer::new();
        let a = finalizer.register("a", make("a"));
        finalizer.register("b", make("b"));

        finalizer.dismiss(a);
        finalizer.run_all();
        assert_eq!(*log.lock().unwrap(), vec!["b"]);
    }

    #[test]
    fn drop_runs_pending_actions() {
        let (log, make) = recorder();
        {
            let finalizer = Finalizer::new();
            let clone = finalizer.clone();
            clone.register("x", make("x"));
        }
        assert_eq!(*log.lock().unwrap(), vec!["x"]);
    }
}
