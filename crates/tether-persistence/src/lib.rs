//! Revision persistence for push sync.
//!
//! [`MemoryRevisionStore`] implements [`RevisionStore`] in memory and can be
//! captured as a [`RevisionSnapshot`]. The host decides where the snapshot
//! lives (a file, a key-value store, platform preferences); this crate only
//! turns it into JSON and back.
//!
//! ```ignore
//! let store = Arc::new(MemoryRevisionStore::new());
//! if let Some(json) = prefs.get("tether.revisions") {
//!     store.restore(RevisionSnapshot::from_json(&json)?)?;
//! }
//!
//! let tether = Tether::builder().with_revision_store(store.clone()).build();
//!
//! // on shutdown
//! prefs.set("tether.revisions", store.snapshot().to_json()?);
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use tether::{ActionKey, RevisionStore};

/// Snapshot format version written by this crate.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("unsupported revision snapshot version {found}")]
    UnsupportedVersion { found: u32 },

    #[error("invalid revision snapshot: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serializable copy of every persisted server revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionSnapshot {
    pub version: u32,
    pub taken_at: DateTime<Utc>,
    /// Storage key (see [`ActionKey::to_storage_key`]) to server revision.
    pub revisions: BTreeMap<String, u64>,
}

impl RevisionSnapshot {
    pub fn to_json(&self) -> Result<String, PersistenceError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, PersistenceError> {
        let snapshot: Self = serde_json::from_str(json)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(PersistenceError::UnsupportedVersion {
                found: snapshot.version,
            });
        }
        Ok(snapshot)
    }
}

/// In-memory [`RevisionStore`]. Saved revisions never decrease.
#[derive(Debug, Default)]
pub struct MemoryRevisionStore {
    revisions: DashMap<String, u64>,
}

impl MemoryRevisionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    pub fn snapshot(&self) -> RevisionSnapshot {
        RevisionSnapshot {
            version: SNAPSHOT_VERSION,
            taken_at: Utc::now(),
            revisions: self
                .revisions
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
        }
    }

    /// Merge a snapshot in, keeping the higher revision for keys present in
    /// both.
    pub fn restore(&self, snapshot: RevisionSnapshot) -> Result<(), PersistenceError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(PersistenceError::UnsupportedVersion {
                found: snapshot.version,
            });
        }
        let count = snapshot.revisions.len();
        for (key, revision) in snapshot.revisions {
            self.raise(key, revision);
        }
        info!(count, taken_at = %snapshot.taken_at, "restored revision snapshot");
        Ok(())
    }

    pub fn clear(&self) {
        self.revisions.clear();
    }

    fn raise(&self, key: String, revision: u64) {
        self.revisions
            .entry(key)
            .and_modify(|current| *current = (*current).max(revision))
            .or_insert(revision);
    }
}

impl RevisionStore for MemoryRevisionStore {
    fn load(&self, key: &ActionKey) -> Option<u64> {
        self.revisions.get(&key.to_storage_key()).map(|r| *r)
    }

    fn save(&self, key: &ActionKey, server_revision: u64) {
        debug!(%key, server_revision, "persisting server revision");
        self.raise(key.to_storage_key(), server_revision);
    }
}
