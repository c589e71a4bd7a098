//! JSON-snapshot key registry.

use std::{
    collections::HashMap,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{
    KeyRecord, KeyRegistry,
    registry::{apply_register, apply_revoke, apply_touch, collect_for_principal},
};
use crate::{
    error::{StorageError, StorageResult},
    types::PrincipalId,
};

/// Snapshot format version written by this crate.
const SNAPSHOT_VERSION: u32 = 1;

/// `last_used_at` changes smaller than this are kept in memory only.
const TOUCH_PERSIST_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Snapshot {
    version: u32,
    keys: Vec<KeyRecord>,
}

/// File-backed implementation of [`KeyRegistry`].
///
/// The whole registry is a single JSON document
/// `{"version": 1, "keys": [...]}`. Every mutation writes a temporary file,
/// `fsync`s it and renames it over the original, so a crash leaves either
/// the old or the new snapshot.
///
/// Reads are served from memory. Writers are serialized by an async mutex
/// and the in-memory map changes only after the new snapshot is durable.
/// `touch_last_used` is the exception: it updates the record in place and
/// takes the writer mutex only on the throttled occasions it persists.
#[derive(Debug)]
pub struct FileKeyRegistry {
    path: PathBuf,
    keys: Arc<RwLock<HashMap<String, KeyRecord>>>,
    write_lock: Mutex<()>,
    /// `at` of the last touch that reached disk.
    last_touch_persisted: parking_lot::Mutex<Option<DateTime<Utc>>>,
}

impl FileKeyRegistry {
    /// Opens the registry at `path`, creating an empty one if absent.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Serialization`] if the snapshot is malformed or of an unknown version
    /// - [`StorageError::InvalidRecord`] if the snapshot lists a public key twice
    /// - [`StorageError::Io`] on read failure
    pub async fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();

        let keys = if tokio::fs::try_exists(&path).await? {
            let bytes = tokio::fs::read(&path).await?;
            let snapshot: Snapshot = serde_json::from_slice(&bytes).map_err(|e| {
                StorageError::serialization_with_source(
                    format!("malformed key registry {}", path.display()),
                    e,
                )
            })?;
            if snapshot.version != SNAPSHOT_VERSION {
                return Err(StorageError::serialization(format!(
                    "unsupported key registry version {}",
                    snapshot.version
                )));
            }

            let mut keys = HashMap::with_capacity(snapshot.keys.len());
            for record in snapshot.keys {
                if keys.contains_key(&record.public_key) {
                    return Err(StorageError::invalid_record(format!(
                        "duplicate public key in registry: {}",
                        record.public_key
                    )));
                }
                keys.insert(record.public_key.clone(), record);
            }
            keys
        } else {
            HashMap::new()
        };

        tracing::info!(path = %path.display(), keys = keys.len(), "key registry opened");

        Ok(Self {
            path,
            keys: Arc::new(RwLock::new(keys)),
            write_lock: Mutex::new(()),
            last_touch_persisted: parking_lot::Mutex::new(None),
        })
    }

    /// Returns the snapshot path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Applies `mutate` to a copy of the map, persists the copy, then
    /// publishes it. Nothing changes if `mutate` or persistence fails.
    async fn mutate<T>(
        &self,
        mutate: impl FnOnce(&mut HashMap<String, KeyRecord>) -> StorageResult<(T, bool)>,
    ) -> StorageResult<T> {
        let _writer = self.write_lock.lock().await;

        let mut next = self.keys.read().clone();
        let (value, persist) = mutate(&mut next)?;

        if persist {
            persist_snapshot(self.path.clone(), &next).await?;
        }

        let mut live = self.keys.write();
        // Keep touches that landed in memory while this mutation was in flight
        for (key, record) in &mut next {
            if let Some(current) = live.get(key)
                && current.last_used_at > record.last_used_at
            {
                record.last_used_at = current.last_used_at;
            }
        }
        *live = next;
        Ok(value)
    }
}

async fn persist_snapshot(path: PathBuf, keys: &HashMap<String, KeyRecord>) -> StorageResult<()> {
    let mut records: Vec<KeyRecord> = keys.values().cloned().collect();
    records.sort_by(|a, b| {
        a.registered_at.cmp(&b.registered_at).then_with(|| a.public_key.cmp(&b.public_key))
    });
    let body = serde_json::to_vec_pretty(&Snapshot { version: SNAPSHOT_VERSION, keys: records })
        .map_err(|e| StorageError::serialization_with_source("failed to encode key registry", e))?;

    tokio::task::spawn_blocking(move || write_atomically(&path, &body))
        .await
        .map_err(|e| StorageError::internal_with_source("key registry writer panicked", e))?
}

fn write_atomically(path: &Path, body: &[u8]) -> StorageResult<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp)?;
    file.write_all(body)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[async_trait]
impl KeyRegistry for FileKeyRegistry {
    #[tracing::instrument(skip(self, record), fields(principal = %record.principal_id))]
    async fn register(&self, record: &KeyRecord) -> StorageResult<()> {
        self.mutate(|keys| apply_register(keys, record).map(|()| ((), true))).await
    }

    #[tracing::instrument(skip(self))]
    async fn lookup(&self, public_key: &str) -> StorageResult<Option<KeyRecord>> {
        Ok(self.keys.read().get(public_key).cloned())
    }

    #[tracing::instrument(skip(self))]
    async fn revoke(&self, public_key: &str, reason: Option<&str>) -> StorageResult<()> {
        let now = Utc::now();
        self.mutate(|keys| apply_revoke(keys, public_key, reason, now).map(|changed| ((), changed)))
            .await
    }

    async fn touch_last_used(&self, public_key: &str, at: DateTime<Utc>) -> StorageResult<()> {
        let persist = {
            let mut keys = self.keys.write();
            match apply_touch(&mut keys, public_key, at)? {
                None => false,
                // First use of a key is always recorded
                Some(None) => true,
                Some(Some(_)) => self.last_touch_persisted.lock().is_none_or(|last| {
                    (at - last).to_std().is_ok_and(|elapsed| elapsed >= TOUCH_PERSIST_INTERVAL)
                }),
            }
        };
        if !persist {
            return Ok(());
        }

        let _writer = self.write_lock.lock().await;
        let snapshot = self.keys.read().clone();
        persist_snapshot(self.path.clone(), &snapshot).await?;
        *self.last_touch_persisted.lock() = Some(at);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn list_for_principal(&self, principal: &PrincipalId) -> StorageResult<Vec<KeyRecord>> {
        Ok(collect_for_principal(&self.keys.read(), principal))
    }
}
