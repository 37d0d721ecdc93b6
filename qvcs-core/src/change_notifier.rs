//! Debounced per-directory change notification
//!
//! A burst of archive changes produces one callback: each change aborts the
//! pending task and schedules a new one. When the task finally runs it
//! re-merges the directory and only then calls the listeners, so listeners
//! always see the merged state as of the callback, not as of the first
//! change.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::directory_manager::DirectoryMerge;

pub const DEFAULT_NOTIFY_DELAY: Duration = Duration::from_millis(1000);

/// Receives "this directory changed" callbacks.
pub trait DirectoryListener: Send + Sync {
    fn directory_changed(&self, appended_path: &str);
}

struct Inner {
    appended_path: String,
    delay: Duration,
    fast_notify: AtomicBool,
    merge: RwLock<Option<Weak<dyn DirectoryMerge>>>,
    listeners: RwLock<Vec<Arc<dyn DirectoryListener>>>,
    generation: AtomicU64,
    /// Scheduled task and the generation it was spawned for
    pending: Mutex<Option<(u64, JoinHandle<()>)>>,
}

impl Inner {
    /// Clear the pending slot if it still belongs to `generation`. A timer
    /// that loses this race was superseded or cancelled and must not fire.
    fn claim(&self, generation: u64) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.as_ref() {
            Some((current, _)) if *current == generation => {
                pending.take();
                true
            }
            _ => false,
        }
    }

    fn fire(&self) {
        let merge = self.merge.read().unwrap_or_else(|e| e.into_inner()).as_ref().and_then(Weak::upgrade);
        if let Some(merge) = merge {
            merge.merge();
        }
        self.call_listeners();
    }

    fn call_listeners(&self) {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner()).clone();
        for listener in listeners {
            listener.directory_changed(&self.appended_path);
        }
    }
}

#[derive(Clone)]
pub struct ChangeNotifier {
    inner: Arc<Inner>,
}

impl ChangeNotifier {
    pub fn new(appended_path: &str, delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                appended_path: appended_path.to_string(),
                delay,
                fast_notify: AtomicBool::new(false),
                merge: RwLock::new(None),
                listeners: RwLock::new(Vec::new()),
                generation: AtomicU64::new(0),
                pending: Mutex::new(None),
            }),
        }
    }

    /// Directory merge to run before listeners are called. Held weakly so
    /// the notifier never keeps its directory manager alive.
    pub fn set_merge(&self, merge: Weak<dyn DirectoryMerge>) {
        *self.inner.merge.write().unwrap_or_else(|e| e.into_inner()) = Some(merge);
    }

    pub fn set_fast_notify(&self, fast: bool) {
        self.inner.fast_notify.store(fast, Ordering::Release);
    }

    pub fn is_fast_notify(&self) -> bool {
        self.inner.fast_notify.load(Ordering::Acquire)
    }

    pub fn add_listener(&self, listener: Arc<dyn DirectoryListener>) {
        self.inner.listeners.write().unwrap_or_else(|e| e.into_inner()).push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn DirectoryListener>) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Report a change. Fast mode calls listeners right away; otherwise the
    /// call is coalesced with any other change inside the delay window.
    pub fn notify(&self) {
        if self.is_fast_notify() {
            self.inner.call_listeners();
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime for deferred notify of {}; firing now", self.inner.appended_path);
            self.inner.fire();
            return;
        };
        let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, task)) = pending.take() {
            task.abort();
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let inner = Arc::clone(&self.inner);
        let task = runtime.spawn(async move {
            tokio::time::sleep(inner.delay).await;
            if inner.claim(generation) {
                inner.fire();
            }
        });
        *pending = Some((generation, task));
    }

    /// Drop any scheduled notification.
    pub fn cancel(&self) {
        if let Some((_, task)) = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}
