// "Already seen" ledger of listing identifiers processed by earlier runs.

use std::{
    fs,
    path::{Path, PathBuf},
};

use dashmap::DashSet;
use thiserror::Error;
use tracing::info;

use crate::{cache::write_atomically, listing::ListingId};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed ledger file: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Default)]
pub struct SeenLedger {
    ids: DashSet<ListingId>,
    path: Option<PathBuf>,
}

impl SeenLedger {
    pub fn in_memory(ids: impl IntoIterator<Item = ListingId>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            path: None,
        }
    }

    /// Loads a JSON array of identifiers. A missing or empty file is an empty
    /// ledger; `reset` deletes the file first.
    pub fn open(path: impl AsRef<Path>, reset: bool) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        if reset {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let ids: Vec<ListingId> = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => Vec::new(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        info!(entries = ids.len(), path = %path.display(), "Loaded seen ledger");

        Ok(Self {
            ids: ids.into_iter().collect(),
            path: Some(path),
        })
    }

    pub fn contains(&self, id: ListingId) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Adds identifiers and saves. On a failed save the additions are undone
    /// and the file on disk keeps its previous contents.
    pub fn record(&self, ids: impl IntoIterator<Item = ListingId>) -> Result<usize, LedgerError> {
        let added: Vec<ListingId> = ids.into_iter().filter(|id| self.ids.insert(*id)).collect();
        if added.is_empty() {
            return Ok(0);
        }
        if let Err(e) = self.save() {
            for id in &added {
                self.ids.remove(id);
            }
            return Err(e);
        }
        Ok(added.len())
    }

    fn save(&self) -> Result<(), LedgerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut ids: Vec<ListingId> = self.ids.iter().map(|id| *id).collect();
        ids.sort_unstable();
        write_atomically(path, &serde_json::to_vec(&ids)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_reload() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("history.json");

        let ledger = SeenLedger::open(&path, false)?;
        assert!(ledger.is_empty());
        assert_eq!(ledger.record([3, 1, 2, 3])?, 3);
        assert_eq!(ledger.record([1])?, 0);

        let reloaded = SeenLedger::open(&path, false)?;
        assert_eq!(reloaded.len(), 3);
        assert!(reloaded.contains(2));
        assert!(!reloaded.contains(4));

        let reset = SeenLedger::open(&path, true)?;
        assert!(reset.is_empty());
        Ok(())
    }

    #[test]
    fn test_failed_save_undoes_additions() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let nested = dir.path().join("gone");
        fs::create_dir(&nested)?;

        let ledger = SeenLedger::open(nested.join("history.json"), false)?;
        ledger.record([1])?;
        fs::remove_dir_all(&nested)?;

        assert!(matches!(ledger.record([2]), Err(LedgerError::Io(_))));
        assert!(ledger.contains(1));
        assert!(!ledger.contains(2));
        Ok(())
    }

    #[test]
    fn test_interrupted_save_keeps_previous_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("history.json");
        let ledger = SeenLedger::open(&path, false)?;
        ledger.record([1, 2])?;

        // A directory squatting on the temp name makes the write fail midway
        fs::create_dir(dir.path().join("history.json.tmp"))?;
        assert!(ledger.record([3]).is_err());
        assert!(!ledger.contains(3));

        let reloaded = SeenLedger::open(&path, false)?;
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.contains(1) && reloaded.contains(2));
        Ok(())
    }

    #[test]
    fn test_malformed_file_reported() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("history.json");
        fs::write(&path, "{not json")?;

        assert!(matches!(SeenLedger::open(&path, false), Err(LedgerError::Malformed(_))));
        Ok(())
    }
}
