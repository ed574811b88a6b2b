//! Keeps a merged list of clusters in sync with kubeconfig files on disk.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{debug, info};
use parking_lot::{Mutex, RwLock};

use crate::seq::seq;

mod entity;
pub use entity::{
    entities_from_kubeconfig, read_kubeconfig_entities, CatalogEntity, ClusterPhase, ClusterSpec,
    ClusterStatus, EntityMetadata, SyncError,
};
mod paths;
pub use paths::{Subscription, SyncPathChange, SyncPaths};
mod watcher;
pub use watcher::PollingWatcher;

/// Kubeconfig files larger than this are ignored.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 16 * 1024 * 1024;

/// A shared, versioned list of entities. Every [`EntityList::set`] bumps the
/// version, which is what readers use to notice changes.
#[derive(Debug, Clone, Default)]
pub struct EntityList {
    inner: Arc<EntityListInner>,
}

#[derive(Debug, Default)]
struct EntityListInner {
    version: AtomicU64,
    entities: RwLock<Arc<Vec<CatalogEntity>>>,
}

impl EntityList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities(entities: Vec<CatalogEntity>) -> Self {
        let list = Self::new();
        list.set(entities);
        list
    }

    pub fn get(&self) -> Arc<Vec<CatalogEntity>> {
        Arc::clone(&self.inner.entities.read())
    }

    pub fn set(&self, entities: Vec<CatalogEntity>) {
        *self.inner.entities.write() = Arc::new(entities);
        self.inner.version.fetch_add(1, Ordering::AcqRel);
    }

    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }
}

/// Stops a source watch when disposed or dropped.
pub struct Disposer(Option<Box<dyn FnOnce() + Send>>);

impl Disposer {
    pub fn new(dispose: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(dispose)))
    }

    pub fn noop() -> Self {
        Self(None)
    }

    pub fn dispose(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(dispose) = self.0.take() {
            dispose();
        }
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        self.run();
    }
}

impl std::fmt::Debug for Disposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Disposer").field(&self.0.is_some()).finish()
    }
}

/// Produces the entities found at a file or folder and keeps them current.
pub trait SourceWatcher: Send + Sync {
    fn watch(&self, path: &Path) -> (EntityList, Disposer);
}

impl<F> SourceWatcher for F
where
    F: Fn(&Path) -> (EntityList, Disposer) + Send + Sync,
{
    fn watch(&self, path: &Path) -> (EntityList, Disposer) {
        self(path)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Always synced while running; usually `~/.kube`.
    pub default_directory: PathBuf,
    pub poll_interval: Duration,
    pub max_file_size: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_directory: default_kubeconfig_directory(),
            poll_interval: Duration::from_secs(2),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl SyncConfig {
    pub fn with_default_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.default_directory = directory.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }
}

pub fn default_kubeconfig_directory() -> PathBuf {
    dirs::home_dir().unwrap_or_default().join(".kube")
}

struct Source {
    path: PathBuf,
    entities: EntityList,
    _disposer: Disposer,
}

#[derive(Default)]
struct SyncState {
    running: bool,
    sources: Vec<Source>,
    /// Bumped whenever a source is added or removed.
    generation: u64,
    subscription: Option<Subscription>,
}

struct MergedView {
    generation: u64,
    versions: Vec<u64>,
    entities: Arc<Vec<CatalogEntity>>,
}

pub struct KubeconfigSyncManager {
    default_directory: PathBuf,
    paths: Arc<SyncPaths>,
    watcher: Arc<dyn SourceWatcher>,
    state: Mutex<SyncState>,
    merged: Mutex<Option<MergedView>>,
}

impl std::fmt::Debug for KubeconfigSyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeconfigSyncManager")
            .field("default_directory", &self.default_directory)
            .field("syncing", &self.syncing_paths())
            .finish()
    }
}

impl KubeconfigSyncManager {
    pub fn new(
        default_directory: impl Into<PathBuf>,
        paths: Arc<SyncPaths>,
        watcher: Arc<dyn SourceWatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            default_directory: default_directory.into(),
            paths,
            watcher,
            state: Mutex::default(),
            merged: Mutex::new(None),
        })
    }

    /// A manager that polls the filesystem. Its syncs spawn Tokio tasks.
    pub fn polling(config: SyncConfig, paths: Arc<SyncPaths>) -> Arc<Self> {
        let watcher = PollingWatcher::new(config.poll_interval, config.max_file_size);
        Self::new(config.default_directory, paths, Arc::new(watcher))
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn syncing_paths(&self) -> Vec<PathBuf> {
        self.state
            .lock()
            .sources
            .iter()
            .map(|source| source.path.clone())
            .collect()
    }

    /// Syncs the default directory and every configured path, and follows
    /// later changes to the configured paths. Does nothing if already running.
    ///
    /// Changes are followed before the configured paths are read, so a path
    /// added concurrently is synced either way. With a [`PollingWatcher`] this
    /// must be called within a Tokio runtime.
    pub fn start_sync(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.running {
                return;
            }
            state.running = true;
        }
        info!("[KUBECONFIG-SYNC]: starting requested syncs");

        let manager = Arc::downgrade(self);
        let subscription = self.paths.observe(move |change| {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            match change {
                SyncPathChange::Added(path) => manager.start_new_sync(path),
                SyncPathChange::Removed(path) => manager.stop_old_sync(path),
            }
        });
        self.state.lock().subscription = Some(subscription);

        self.start_new_sync(&self.default_directory);
        for path in self.paths.paths() {
            self.start_new_sync(&path);
        }
    }

    /// Unsubscribes from path changes, then disposes every source.
    pub fn stop_sync(&self) {
        let (subscription, sources) = {
            let mut state = self.state.lock();
            state.running = false;
            state.generation += 1;
            (state.subscription.take(), std::mem::take(&mut state.sources))
        };
        drop(subscription);
        for source in sources {
            info!("[KUBECONFIG-SYNC]: stopping sync of file/folder {}", source.path.display());
        }
    }

    pub fn is_syncing(&self, path: &Path) -> bool {
        self.state
            .lock()
            .sources
            .iter()
            .any(|source| source.path == path)
    }

    pub fn start_new_sync(&self, path: &Path) {
        let mut state = self.state.lock();
        if state.sources.iter().any(|source| source.path == path) {
            debug!("[KUBECONFIG-SYNC]: already syncing file/folder {}", path.display());
            return;
        }

        let (entities, disposer) = self.watcher.watch(path);
        state.sources.push(Source {
            path: path.to_owned(),
            entities,
            _disposer: disposer,
        });
        state.generation += 1;
        info!("[KUBECONFIG-SYNC]: starting sync of file/folder {}", path.display());
    }

    pub fn stop_old_sync(&self, path: &Path) {
        let removed = {
            let mut state = self.state.lock();
            let index = state.sources.iter().position(|source| source.path == path);
            index.map(|index| {
                state.generation += 1;
                state.sources.remove(index)
            })
        };
        match removed {
            Some(_) => info!("[KUBECONFIG-SYNC]: stopping sync of file/folder {}", path.display()),
            None => debug!("[KUBECONFIG-SYNC]: no syncing file/folder to stop {}", path.display()),
        }
    }

    /// Every entity from every source, first occurrence of an id winning.
    /// Recomputed only when a source changed or the set of sources did.
    pub fn source(&self) -> Arc<Vec<CatalogEntity>> {
        let state = self.state.lock();
        let versions: Vec<u64> = state.sources.iter().map(|source| source.entities.version()).collect();

        let mut merged = self.merged.lock();
        if let Some(view) = merged.as_ref() {
            if view.generation == state.generation && view.versions == versions {
                return Arc::clone(&view.entities);
            }
        }

        let mut seen = HashSet::new();
        let entities: Vec<CatalogEntity> = seq(&state.sources)
            .flat_map(|source| source.entities.get().to_vec())
            .filter(|entity| seen.insert(entity.id().to_owned()))
            .collect();
        let entities = Arc::new(entities);
        *merged = Some(MergedView {
            generation: state.generation,
            versions,
            entities: Arc::clone(&entities),
        });
        entities
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::testing::{capture_logs, captured_logs};

    fn entity(id: &str, origin: &str) -> CatalogEntity {
        let mut entity = CatalogEntity::cluster(Path::new(origin), id);
        entity.metadata.uid = id.to_owned();
        entity
    }

    /// Serves preset lists and counts watches and disposals.
    #[derive(Default)]
    struct FakeWatcher {
        lists: Mutex<Vec<(PathBuf, EntityList)>>,
        started: AtomicUsize,
        disposed: Arc<AtomicUsize>,
    }

    impl FakeWatcher {
        fn serve(&self, path: &str, entities: Vec<CatalogEntity>) -> EntityList {
            let list = EntityList::with_entities(entities);
            self.lists.lock().push((path.into(), list.clone()));
            list
        }
    }

    impl SourceWatcher for FakeWatcher {
        fn watch(&self, path: &Path) -> (EntityList, Disposer) {
            self.started.fetch_add(1, Ordering::SeqCst);
            let list = self
                .lists
                .lock()
                .iter()
                .find(|(served, _)| served == path)
                .map(|(_, list)| list.clone())
                .unwrap_or_default();
            let disposed = Arc::clone(&self.disposed);
            let disposer = Disposer::new(move || {
                disposed.fetch_add(1, Ordering::SeqCst);
            });
            (list, disposer)
        }
    }

    fn ids(entities: &[CatalogEntity]) -> Vec<(&str, &str)> {
        entities
            .iter()
            .map(|entity| (entity.id(), entity.spec.kubeconfig_path.to_str().unwrap()))
            .collect()
    }

    #[test]
    fn merged_view_keeps_first_id() {
        let watcher = Arc::new(FakeWatcher::default());
        watcher.serve("/a", vec![entity("x", "/a"), entity("y", "/a")]);
        watcher.serve("/b", vec![entity("x", "/b"), entity("z", "/b")]);

        let manager = KubeconfigSyncManager::new("/default", SyncPaths::new(), watcher.clone());
        manager.start_new_sync(Path::new("/a"));
        manager.start_new_sync(Path::new("/b"));

        assert_eq!(
            ids(&manager.source()),
            vec![("x", "/a"), ("y", "/a"), ("z", "/b")]
        );
    }

    #[test]
    fn merged_view_recomputes_on_change_only() {
        let watcher = Arc::new(FakeWatcher::default());
        let a = watcher.serve("/a", vec![entity("x", "/a")]);

        let manager = KubeconfigSyncManager::new("/default", SyncPaths::new(), watcher.clone());
        manager.start_new_sync(Path::new("/a"));
        let first = manager.source();
        assert!(Arc::ptr_eq(&first, &manager.source()));

        a.set(vec![entity("x", "/a"), entity("w", "/a")]);
        let second = manager.source();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(ids(&second), vec![("x", "/a"), ("w", "/a")]);

        manager.stop_old_sync(Path::new("/a"));
        assert!(manager.source().is_empty());
    }

    #[test]
    fn starting_a_path_twice_keeps_one_source() {
        let watcher = Arc::new(FakeWatcher::default());
        let manager = KubeconfigSyncManager::new("/default", SyncPaths::new(), watcher.clone());

        capture_logs();
        manager.start_new_sync(Path::new("/a"));
        manager.start_new_sync(Path::new("/a"));
        assert_eq!(watcher.started.load(Ordering::SeqCst), 1);
        let repeated: Vec<_> = captured_logs()
            .into_iter()
            .filter(|(_, message)| message.contains("already syncing file/folder /a"))
            .collect();
        assert_eq!(repeated.len(), 1);
        assert_eq!(repeated[0].0, log::Level::Debug);
        assert_eq!(manager.syncing_paths(), vec![PathBuf::from("/a")]);

        manager.stop_old_sync(Path::new("/a"));
        manager.stop_old_sync(Path::new("/a"));
        assert_eq!(watcher.disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn configured_paths_drive_sources() {
        let watcher = Arc::new(FakeWatcher::default());
        let paths = SyncPaths::with_paths(["/a"]);
        let manager = KubeconfigSyncManager::new("/default", Arc::clone(&paths), watcher.clone());

        manager.start_sync();
        manager.start_sync();
        assert!(manager.is_running());
        assert_eq!(
            manager.syncing_paths(),
            vec![PathBuf::from("/default"), PathBuf::from("/a")]
        );

        paths.add("/b");
        paths.remove(Path::new("/a"));
        assert_eq!(
            manager.syncing_paths(),
            vec![PathBuf::from("/default"), PathBuf::from("/b")]
        );

        manager.stop_sync();
        assert!(manager.syncing_paths().is_empty());
        assert_eq!(watcher.disposed.load(Ordering::SeqCst), 3);

        paths.add("/c");
        assert!(!manager.is_syncing(Path::new("/c")));
    }

    #[test]
    fn paths_added_while_starting_are_synced() {
        let watcher = Arc::new(FakeWatcher::default());
        let paths = SyncPaths::with_paths(["/a"]);
        let manager = KubeconfigSyncManager::new("/default", Arc::clone(&paths), watcher.clone());

        let adder = std::thread::spawn({
            let paths = Arc::clone(&paths);
            move || {
                for n in 0..100 {
                    paths.add(format!("/p{n}"));
                }
            }
        });
        manager.start_sync();
        adder.join().unwrap();

        for path in paths.paths() {
            assert!(manager.is_syncing(&path), "{} is not synced", path.display());
        }
        assert_eq!(manager.syncing_paths().len(), 102);
    }
}
