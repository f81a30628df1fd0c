//! Durable store for form submissions that could not be delivered.
//!
//! Layout mirrors the browser database the site uses: database `LifeBank`,
//! version 1, object store `pending-forms` keyed by record id. On disk it is
//! one JSON file per object store. Every write replaces the file through a
//! synced temp file and a rename, so a crash never leaves a half-written
//! store behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::StoreError;

pub const DATABASE_NAME: &str = "LifeBank";
pub const DATABASE_VERSION: u32 = 1;
pub const PENDING_FORMS: &str = "pending-forms";

/// A submission waiting for delivery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingRecord {
    pub id: String,
    pub payload: Value,
}

impl PendingRecord {
    /// Wraps `payload` under a fresh random id.
    pub fn new(payload: Value) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), payload)
    }

    pub fn with_id(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    #[serde(default)]
    records: BTreeMap<String, PendingRecord>,
}

/// Handle to the `pending-forms` object store.
///
/// Writers are serialized through an async mutex; each operation reads the
/// file, applies its change and writes it back before releasing the lock.
#[derive(Debug)]
pub struct PendingStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PendingStore {
    /// Opens (or creates) the database under `root`.
    ///
    /// Fails with [`StoreError::Version`] if the file on disk was written by
    /// a newer schema.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = root.as_ref().join(DATABASE_NAME);
        tokio::fs::create_dir_all(&dir).await?;
        let store = Self {
            path: dir.join(format!("{PENDING_FORMS}.json")),
            lock: Mutex::new(()),
        };

        let guard = store.lock.lock().await;
        let file = store.read().await?;
        if file.version > DATABASE_VERSION {
            return Err(StoreError::Version {
                found: file.version,
                expected: DATABASE_VERSION,
            });
        }
        if file.version < DATABASE_VERSION {
            tracing::info!(path = %store.path.display(), "creating pending-forms store");
            store
                .write(&StoreFile {
                    version: DATABASE_VERSION,
                    records: file.records,
                })
                .await?;
        }
        drop(guard);
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inserts or replaces the record with the same id.
    pub async fn put(&self, record: PendingRecord) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        file.records.insert(record.id.clone(), record);
        self.write(&file).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<PendingRecord>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.records.remove(id))
    }

    /// All records, ordered by id.
    pub async fn get_all(&self) -> Result<Vec<PendingRecord>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.records.into_values().collect())
    }

    /// Removes the record; returns whether it existed.
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        let existed = file.records.remove(id).is_some();
        if existed {
            self.write(&file).await?;
        }
        Ok(existed)
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.records.len())
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    async fn read(&self) -> Result<StoreFile, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(StoreFile::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, file: &StoreFile) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(file)?;
        let tmp = self.path.with_extension("json.tmp");

        let mut handle = tokio::fs::File::create(&tmp).await?;
        handle.write_all(&bytes).await?;
        handle.sync_all().await?;
        drop(handle);

        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
