//! Durable snapshot file with merge-on-save semantics

use super::{Snapshot, SnapshotError};
use crate::clock::Clock;
use crate::reconciler::RateMap;
use crate::sources::SourceName;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Owns the snapshot file for a fixed, ordered set of sources
pub struct SnapshotStore {
    path: PathBuf,
    sources: Vec<SourceName>,
    cache_ttl: Duration,
    clock: Arc<dyn Clock>,
    current: RwLock<Arc<Snapshot>>,
    write_lock: Mutex<()>,
}

impl SnapshotStore {
    /// Open the store and load whatever is on disk
    pub fn open(
        path: impl Into<PathBuf>,
        sources: Vec<SourceName>,
        cache_ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let empty = Snapshot::empty(&sources, cache_ttl.as_secs());
        let store = Self {
            path: path.into(),
            sources,
            cache_ttl,
            clock,
            current: RwLock::new(Arc::new(empty)),
            write_lock: Mutex::new(()),
        };

        let loaded = store.load();
        info!(
            path = %store.path.display(),
            records = loaded.total_records(),
            "snapshot store opened"
        );
        *store.current.write() = Arc::new(loaded);
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sources(&self) -> &[SourceName] {
        &self.sources
    }

    /// Read the file. Never fails: missing or unreadable content yields an
    /// empty snapshot.
    pub fn load(&self) -> Snapshot {
        self.read_persisted()
            .unwrap_or_else(|_| Snapshot::empty(&self.sources, self.cache_ttl.as_secs()))
    }

    fn read_persisted(&self) -> Result<Snapshot, ReadFailure> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no snapshot file yet");
                return Err(ReadFailure::Missing);
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read snapshot");
                return Err(ReadFailure::Unreadable);
            }
        };

        match serde_json::from_slice::<Value>(&bytes) {
            Ok(document) => Ok(Snapshot::from_document(&document, &self.sources, self.cache_ttl.as_secs())),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "malformed snapshot");
                Err(ReadFailure::Unreadable)
            }
        }
    }

    /// Last loaded or saved snapshot, without touching the disk
    pub fn current(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    /// Persist new maps for some sources.
    ///
    /// Sources missing from `updates`, or given an empty map, keep the map
    /// that is currently on disk. When the file cannot be read they keep
    /// the last snapshot held in memory instead.
    pub fn save(&self, mut updates: HashMap<SourceName, RateMap>) -> Result<Arc<Snapshot>, SnapshotError> {
        let _guard = self.write_lock.lock();
        let persisted = match self.read_persisted() {
            Ok(snapshot) => Arc::new(snapshot),
            Err(failure) => {
                if failure == ReadFailure::Unreadable {
                    warn!(path = %self.path.display(), "preserving in-memory rates for sources without updates");
                }
                self.current()
            }
        };

        let mut replaced = 0;
        let maps = self
            .sources
            .iter()
            .map(|name| {
                let map = match updates.remove(name) {
                    Some(map) if !map.is_empty() => {
                        replaced += 1;
                        map
                    }
                    _ => persisted.source(name.as_str()).cloned().unwrap_or_default(),
                };
                (name.clone(), map)
            })
            .collect();

        for name in updates.keys() {
            warn!(source = %name, "dropping update for unconfigured source");
        }

        let snapshot = Snapshot::new(Some(self.clock.now()), self.cache_ttl.as_secs(), maps);
        self.write_atomic(&snapshot)?;

        debug!(
            path = %self.path.display(),
            replaced,
            records = snapshot.total_records(),
            "snapshot written"
        );

        let snapshot = Arc::new(snapshot);
        *self.current.write() = snapshot.clone();
        Ok(snapshot)
    }

    fn write_atomic(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }

        let mut body = serde_json::to_vec_pretty(snapshot)?;
        body.push(b'\n');

        let tmp_path = tmp_path(&self.path);
        let written = File::create(&tmp_path).and_then(|mut file| {
            file.write_all(&body)?;
            file.sync_all()
        });
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(self.io_error(e));
        }

        fs::rename(&tmp_path, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            self.io_error(e)
        })
    }

    fn io_error(&self, source: std::io::Error) -> SnapshotError {
        SnapshotError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[derive(Debug, PartialEq)]
enum ReadFailure {
    Missing,
    Unreadable,
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
