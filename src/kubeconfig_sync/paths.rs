use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPathChange {
    Added(PathBuf),
    Removed(PathBuf),
}

type Listener = Arc<dyn Fn(&SyncPathChange) + Send + Sync>;

/// The user-configured kubeconfig files and folders, in insertion order.
///
/// Listeners run synchronously on the thread that changed the set, after the
/// change is visible to [`SyncPaths::paths`].
#[derive(Default)]
pub struct SyncPaths {
    paths: Mutex<Vec<PathBuf>>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener: AtomicU64,
}

impl std::fmt::Debug for SyncPaths {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncPaths")
            .field("paths", &*self.paths.lock())
            .finish()
    }
}

impl SyncPaths {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_paths<I, P>(paths: I) -> Arc<Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let sync_paths = Self::default();
        for path in paths {
            sync_paths.add(path);
        }
        Arc::new(sync_paths)
    }

    /// Returns `false` if the path was already present.
    pub fn add(&self, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        {
            let mut paths = self.paths.lock();
            if paths.contains(&path) {
                return false;
            }
            paths.push(path.clone());
        }
        self.notify(&SyncPathChange::Added(path));
        true
    }

    /// Returns `false` if the path was not present.
    pub fn remove(&self, path: &Path) -> bool {
        {
            let mut paths = self.paths.lock();
            let Some(index) = paths.iter().position(|existing| existing == path) else {
                return false;
            };
            paths.remove(index);
        }
        self.notify(&SyncPathChange::Removed(path.to_owned()));
        true
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.paths.lock().clone()
    }

    /// Calls `listener` for every later change until the subscription is dropped.
    pub fn observe(
        self: &Arc<Self>,
        listener: impl Fn(&SyncPathChange) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        Subscription {
            paths: Arc::downgrade(self),
            id,
        }
    }

    fn notify(&self, change: &SyncPathChange) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(change);
        }
    }
}

/// Unsubscribes on drop.
#[derive(Debug)]
pub struct Subscription {
    paths: Weak<SyncPaths>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(paths) = self.paths.upgrade() {
            paths.listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}
