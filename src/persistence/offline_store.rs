//! sled-backed offline queue
//!
//! Keys are ids from [`sled::Db::generate_id`], stored big-endian so tree
//! iteration order is insertion order. Values are JSON-encoded
//! [`StoredMessage`]s.

use super::{PersistenceConfig, PersistenceError};
use crate::message::Message;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::{debug, info, warn};

/// A relay publish waiting for the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub stored_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn from_message(msg: &Message) -> Self {
        Self {
            topic: msg.topic().to_string(),
            payload: msg.payload().to_vec(),
            qos: msg.qos(),
            retain: msg.retain(),
            stored_at: Utc::now(),
        }
    }

    pub fn into_message(self) -> Message {
        let mut msg = Message::publish(self.topic, Bytes::from(self.payload), self.qos);
        msg.set_retain(self.retain);
        msg
    }
}

/// Bounded at-least-once buffer for outbound messages
pub struct OfflineStore {
    db: Db,
    tree: Tree,
    pending: Vec<(u64, StoredMessage)>,
    config: PersistenceConfig,
}

impl OfflineStore {
    /// Open (or create) the database at `config.db_path()`
    pub fn open(config: PersistenceConfig) -> Result<Self, PersistenceError> {
        std::fs::create_dir_all(&config.dir).map_err(|source| PersistenceError::CreateDir {
            path: config.dir.display().to_string(),
            source,
        })?;

        let db = sled::open(config.db_path())?;
        let tree = db.open_tree(config.tree_name())?;

        info!(
            path = %config.db_path().display(),
            tree = %config.tree_name(),
            rows = tree.len(),
            "Offline store opened"
        );

        Ok(Self {
            db,
            tree,
            pending: Vec::new(),
            config,
        })
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    /// Buffer `msg`; writes to disk once `flush_threshold` rows are pending
    pub fn push(&mut self, msg: &Message) -> Result<(), PersistenceError> {
        let id = self.db.generate_id()?;
        self.pending.push((id, StoredMessage::from_message(msg)));

        if self.pending.len() >= self.config.flush_threshold {
            self.flush()?;
        }
        Ok(())
    }

    /// Write pending rows and enforce `max_rows`; returns rows dropped
    pub fn flush(&mut self) -> Result<usize, PersistenceError> {
        if !self.pending.is_empty() {
            let mut batch = sled::Batch::default();
            for (id, stored) in self.pending.drain(..) {
                batch.insert(id.to_be_bytes().to_vec(), serde_json::to_vec(&stored)?);
            }
            self.tree.apply_batch(batch)?;
        }

        let mut dropped = 0;
        while self.tree.len() > self.config.max_rows {
            if self.tree.pop_min()?.is_none() {
                break;
            }
            dropped += 1;
        }
        if dropped > 0 {
            warn!(dropped, max_rows = self.config.max_rows, "Offline store full, dropped oldest rows");
        }

        self.tree.flush()?;
        Ok(dropped)
    }

    /// All stored rows in insertion order, pending ones flushed first
    ///
    /// Rows stay in the store until [`OfflineStore::acknowledge`] is called.
    pub fn pending_rows(&mut self) -> Result<Vec<(u64, StoredMessage)>, PersistenceError> {
        self.flush()?;

        let mut rows = Vec::with_capacity(self.tree.len());
        for entry in self.tree.iter() {
            let (key, value) = entry?;
            let Ok(bytes) = <[u8; 8]>::try_from(key.as_ref()) else {
                warn!("Skipping offline row with malformed key");
                continue;
            };
            match serde_json::from_slice::<StoredMessage>(&value) {
                Ok(stored) => rows.push((u64::from_be_bytes(bytes), stored)),
                Err(e) => warn!("Skipping unreadable offline row: {}", e),
            }
        }
        Ok(rows)
    }

    /// Remove a row once it has been handed to the broker
    pub fn acknowledge(&mut self, id: u64) -> Result<(), PersistenceError> {
        self.tree.remove(id.to_be_bytes())?;
        debug!(id, "Offline row acknowledged");
        Ok(())
    }

    /// Rows on disk plus rows pending in memory
    pub fn len(&self) -> usize {
        self.tree.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for OfflineStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineStore")
            .field("db", &"sled::Db")
            .field("tree", &self.config.tree_name())
            .field("pending", &self.pending.len())
            .finish()
    }
}
