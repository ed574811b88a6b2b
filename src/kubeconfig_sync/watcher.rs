use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use super::{
    entity::read_kubeconfig_entities, CatalogEntity, Disposer, EntityList, SourceWatcher, SyncError,
};
use crate::seq::seq;

/// Rescans a file or folder on a fixed interval.
///
/// A folder contributes its regular, non-hidden files; subfolders are not
/// descended into.
#[derive(Debug, Clone)]
pub struct PollingWatcher {
    interval: Duration,
    max_file_size: u64,
}

impl PollingWatcher {
    pub fn new(interval: Duration, max_file_size: u64) -> Self {
        Self {
            interval,
            max_file_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileStamp {
    path: PathBuf,
    modified: Option<SystemTime>,
    len: u64,
}

fn stamp(path: &Path) -> Result<FileStamp, SyncError> {
    let metadata = fs::metadata(path).map_err(|source| SyncError::Io {
        path: path.to_owned(),
        source,
    })?;
    Ok(FileStamp {
        path: path.to_owned(),
        modified: metadata.modified().ok(),
        len: metadata.len(),
    })
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'))
}

/// The files `path` currently stands for, sorted by path.
fn scan(path: &Path) -> Result<Vec<FileStamp>, SyncError> {
    let io_error = |source: std::io::Error| SyncError::Io {
        path: path.to_owned(),
        source,
    };
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_error(err)),
    };
    if !metadata.is_dir() {
        return Ok(vec![stamp(path)?]);
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(path).map_err(io_error)? {
        let entry = entry.map_err(io_error)?;
        let file_path = entry.path();
        if is_hidden(&file_path) || !entry.file_type().map_err(io_error)?.is_file() {
            continue;
        }
        files.push(stamp(&file_path)?);
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

fn load(files: &[FileStamp], max_file_size: u64) -> Vec<CatalogEntity> {
    seq(files)
        .filter(|file| {
            if file.len > max_file_size {
                warn!(
                    "[KUBECONFIG-SYNC]: {} is larger than {max_file_size} bytes, skipping",
                    file.path.display()
                );
                return false;
            }
            true
        })
        .flat_map(|file| match read_kubeconfig_entities(&file.path) {
            Ok(entities) => entities,
            Err(err) => {
                warn!("[KUBECONFIG-SYNC]: {err}");
                Vec::new()
            }
        })
        .collect()
}

async fn poll(
    path: PathBuf,
    entities: EntityList,
    interval: Duration,
    max_file_size: u64,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut last_scan: Option<Vec<FileStamp>> = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let files = match scan(&path) {
            Ok(files) => files,
            Err(err) => {
                warn!("[KUBECONFIG-SYNC]: {err}");
                continue;
            }
        };
        if last_scan.as_ref() == Some(&files) {
            continue;
        }
        debug!("[KUBECONFIG-SYNC]: reloading {}", path.display());
        entities.set(load(&files, max_file_size));
        last_scan = Some(files);
    }
}

impl SourceWatcher for PollingWatcher {
    /// Must be called within a Tokio runtime.
    fn watch(&self, path: &Path) -> (EntityList, Disposer) {
        let entities = EntityList::new();
        let cancel = CancellationToken::new();
        tokio::spawn(poll(
            path.to_owned(),
            entities.clone(),
            self.interval,
            self.max_file_size,
            cancel.clone(),
        ));
        (entities, Disposer::new(move || cancel.cancel()))
    }
}
