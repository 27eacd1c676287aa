//! Durable term and vote metadata.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error::StorageError;
use crate::NodeId;

/// A record holding the hard state of a server.
///
/// Persisted before a vote is granted or a term adopted; a server restarting
/// mid-term must not vote twice within it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    /// The last recorded term observed by this server.
    pub current_term: u64,
    /// The candidate voted for in `current_term`, if any.
    pub voted_for: Option<NodeId>,
}

/// The file-backed store for [`HardState`].
pub struct MetaStore {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl MetaStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join("meta.json"),
            tmp_path: dir.join("meta.json.tmp"),
        }
    }

    /// Load the persisted hard state, defaulting to a pristine one.
    pub fn load(&self) -> Result<HardState, StorageError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| StorageError::Corruption {
                segment: 0,
                offset: 0,
                reason: format!("unreadable hard state: {}", err),
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HardState::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Persist the hard state durably (write, fsync, rename).
    pub fn save(&self, state: &HardState) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(state).map_err(|err| StorageError::Corruption {
            segment: 0,
            offset: 0,
            reason: format!("unencodable hard state: {}", err),
        })?;
        std::fs::write(&self.tmp_path, &bytes)?;
        let file = std::fs::OpenOptions::new().read(true).open(&self.tmp_path)?;
        file.sync_all()?;
        std::fs::rename(&self.tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_defaults_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::new(dir.path());
        assert_eq!(store.load().unwrap(), HardState::default());
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::new(dir.path());
        let state = HardState {
            current_term: 4,
            voted_for: Some(2),
        };
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), state);

        let cleared = HardState {
            current_term: 5,
            voted_for: None,
        };
        store.save(&cleared).unwrap();
        assert_eq!(store.load().unwrap(), cleared);
    }
}
