// Persistent journey cache keyed by (origin, destination) coordinate pairs.

use std::{
    collections::HashMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{api::Journey, geo::Coordinate};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Persistence failed: {0}")]
    PersistenceFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JourneyKey {
    pub origin: Coordinate,
    pub destination: Coordinate,
}

impl JourneyKey {
    pub fn new(origin: Coordinate, destination: Coordinate) -> Self {
        Self {
            origin,
            destination,
        }
    }
}

pub type JourneyMap = HashMap<JourneyKey, Vec<Journey>>;

// Durable backing for the cache. `save` always receives the whole map.
pub trait CacheStore: Send + Sync + 'static {
    fn load(&self) -> Result<JourneyMap, CacheError>;
    fn save(&self, journeys: &JourneyMap) -> Result<(), CacheError>;
    fn reset(&self) -> Result<(), CacheError>;
}

impl<S: CacheStore + ?Sized> CacheStore for std::sync::Arc<S> {
    fn load(&self) -> Result<JourneyMap, CacheError> {
        (**self).load()
    }

    fn save(&self, journeys: &JourneyMap) -> Result<(), CacheError> {
        (**self).save(journeys)
    }

    fn reset(&self) -> Result<(), CacheError> {
        (**self).reset()
    }
}

// Writes `content` to a sibling `<name>.tmp`, syncs it and renames it over
// `path`. Readers see either the old file or the new one.
pub(crate) fn write_atomically(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    let temp_path = path.with_file_name(name);

    let mut file = fs::File::create(&temp_path)?;
    file.write_all(content)?;
    file.sync_all()?;
    fs::rename(&temp_path, path)
}

#[derive(Serialize, Deserialize)]
struct CacheRecord {
    origin: Coordinate,
    destination: Coordinate,
    journeys: Vec<Journey>,
}

/// Single JSON file. Writes go to a sibling temp file which is then renamed
/// over the target, so a crash never leaves a half-written store.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

}

impl CacheStore for FileStore {
    fn load(&self) -> Result<JourneyMap, CacheError> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(JourneyMap::new()),
            Err(e) => return Err(e.into()),
        };
        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(JourneyMap::new());
        }

        let records: Vec<CacheRecord> = serde_json::from_slice(&content)?;
        Ok(records
            .into_iter()
            .map(|r| (JourneyKey::new(r.origin, r.destination), r.journeys))
            .collect())
    }

    fn save(&self, journeys: &JourneyMap) -> Result<(), CacheError> {
        let records: Vec<CacheRecord> = journeys
            .iter()
            .map(|(key, journeys)| CacheRecord {
                origin: key.origin,
                destination: key.destination,
                journeys: journeys.clone(),
            })
            .collect();
        let content = serde_json::to_vec(&records)?;
        write_atomically(&self.path, &content)?;
        Ok(())
    }

    fn reset(&self) -> Result<(), CacheError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// In-process store; `set_failing` simulates a broken disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    saved: Mutex<JourneyMap>,
    failing: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(journeys: JourneyMap) -> Self {
        Self {
            saved: Mutex::new(journeys),
            ..Default::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> JourneyMap {
        self.saved.lock().clone()
    }
}

impl CacheStore for MemoryStore {
    fn load(&self) -> Result<JourneyMap, CacheError> {
        Ok(self.saved.lock().clone())
    }

    fn save(&self, journeys: &JourneyMap) -> Result<(), CacheError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::PersistenceFailed("store is failing".into()));
        }
        *self.saved.lock() = journeys.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn reset(&self) -> Result<(), CacheError> {
        self.saved.lock().clear();
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    pub items_count: usize,
    pub hit_count: usize,
    pub miss_count: usize,
}

/// Journey results by coordinate pair, mirrored to a [`CacheStore`].
///
/// Every update is persisted before it returns; if persisting fails the
/// in-memory map is rolled back, so readers never see entries that are not
/// durable.
pub struct JourneyCache {
    journeys: RwLock<JourneyMap>,
    store: Box<dyn CacheStore>,
    hit_count: AtomicUsize,
    miss_count: AtomicUsize,
}

impl JourneyCache {
    /// Loads the whole store. With `reset`, the store is discarded first.
    pub fn open(store: impl CacheStore, reset: bool) -> Result<Self, CacheError> {
        if reset {
            info!("Resetting journey cache");
            store.reset()?;
        }
        let journeys = store.load()?;
        info!(entries = journeys.len(), "Loaded journey cache");

        Ok(Self {
            journeys: RwLock::new(journeys),
            store: Box::new(store),
            hit_count: AtomicUsize::new(0),
            miss_count: AtomicUsize::new(0),
        })
    }

    pub fn get(&self, origin: Coordinate, destination: Coordinate) -> Option<Vec<Journey>> {
        let found = self
            .journeys
            .read()
            .get(&JourneyKey::new(origin, destination))
            .cloned();
        match found {
            Some(_) => self.hit_count.fetch_add(1, Ordering::Relaxed),
            None => self.miss_count.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn contains(&self, origin: Coordinate, destination: Coordinate) -> bool {
        self.journeys
            .read()
            .contains_key(&JourneyKey::new(origin, destination))
    }

    pub fn put(
        &self,
        origin: Coordinate,
        destination: Coordinate,
        journeys: Vec<Journey>,
    ) -> Result<(), CacheError> {
        self.update([(JourneyKey::new(origin, destination), journeys)])
            .map(|_| ())
    }

    /// Applies a batch and persists the whole map. Entries identical to what
    /// is cached are skipped; returns how many entries changed.
    pub fn update(
        &self,
        entries: impl IntoIterator<Item = (JourneyKey, Vec<Journey>)>,
    ) -> Result<usize, CacheError> {
        let mut journeys = self.journeys.write();

        let mut previous: Vec<(JourneyKey, Option<Vec<Journey>>)> = Vec::new();
        for (key, value) in entries {
            if journeys.get(&key) == Some(&value) {
                continue;
            }
            let old = journeys.insert(key, value);
            // Keep only the first prior value when a batch repeats a key
            if !previous.iter().any(|(k, _)| *k == key) {
                previous.push((key, old));
            }
        }
        if previous.is_empty() {
            return Ok(0);
        }

        if let Err(e) = self.store.save(&journeys) {
            for (key, old) in previous {
                match old {
                    Some(value) => journeys.insert(key, value),
                    None => journeys.remove(&key),
                };
            }
            return Err(e);
        }

        debug!(changed = previous.len(), total = journeys.len(), "Persisted journey cache");
        Ok(previous.len())
    }

    pub fn len(&self) -> usize {
        self.journeys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.journeys.read().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            items_count: self.len(),
            hit_count: self.hit_count.load(Ordering::Relaxed),
            miss_count: self.miss_count.load(Ordering::Relaxed),
        }
    }
}
