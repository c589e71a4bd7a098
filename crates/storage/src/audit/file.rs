//! Line-delimited, hash-chained audit file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fail::fail_point;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncWrite, AsyncWriteExt},
    sync::{Mutex, oneshot},
};

use super::{AuditChainError, AuditEntry, AuditLog, ChainHead, NewAuditEntry, verify_chain};
use crate::error::{StorageError, StorageResult};

#[derive(Debug)]
struct FileState {
    file: File,
    head: ChainHead,
    /// Set while a batch is being written and left set if it fails; the
    /// file tail may be torn.
    poisoned: bool,
}

type Waiter = oneshot::Sender<StorageResult<AuditEntry>>;

/// File-backed implementation of [`AuditLog`].
///
/// One JSON object per line. Appends are group-committed: callers enqueue
/// their entry, and whichever caller holds the file lock drains the queue,
/// seals the whole batch in queue order, writes it and issues a single
/// `sync_data` for it. Every `append` returns only after its line is on disk,
/// so a burst of appends costs one fsync instead of one each.
///
/// # Failure Handling
///
/// If a write or sync fails the log is poisoned and every later `append`
/// fails: the tail of the file may hold a partial line, and appending after
/// it would produce an unverifiable chain. Reopening the file re-verifies
/// the chain and surfaces the damage.
#[derive(Debug)]
pub struct FileAuditLog {
    path: PathBuf,
    queue: parking_lot::Mutex<Vec<(NewAuditEntry, Waiter)>>,
    state: Mutex<FileState>,
}

impl FileAuditLog {
    /// Opens (or creates) the audit file at `path`.
    ///
    /// Existing content is parsed and its chain verified; numbering and
    /// hashing resume from the last entry. New files are created with mode
    /// `0600` and opened append-only.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Serialization`] if the existing file is malformed or its chain does not
    ///   verify
    /// - [`StorageError::Io`] if the file cannot be opened
    pub async fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let head = if tokio::fs::try_exists(&path).await? {
            let entries = read_entries(&path).await?;
            verify_chain(&entries).map_err(|e| {
                StorageError::serialization_with_source(
                    format!("audit chain in {} does not verify", path.display()),
                    e,
                )
            })?
        } else {
            ChainHead::default()
        };

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        options.mode(0o600);
        let file = options.open(&path).await?;

        tracing::info!(path = %path.display(), last_id = head.last_id, "audit log opened");

        Ok(Self {
            path,
            queue: parking_lot::Mutex::new(Vec::new()),
            state: Mutex::new(FileState { file, head, poisoned: false }),
        })
    }

    /// Returns the path of the audit file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current chain head.
    pub async fn head(&self) -> ChainHead {
        self.state.lock().await.head.clone()
    }

    /// Writes everything queued so far as one batch. Caller holds the file lock.
    async fn commit_queued(&self, state: &mut FileState) {
        let batch = std::mem::take(&mut *self.queue.lock());
        if batch.is_empty() {
            return;
        }
        if state.poisoned {
            for (_, waiter) in batch {
                let _ = waiter.send(Err(poisoned_error()));
            }
            return;
        }

        let mut head = state.head.clone();
        let mut buf = Vec::new();
        let mut sealed = Vec::with_capacity(batch.len());
        for (entry, waiter) in batch {
            let entry = AuditEntry::seal(head.last_id + 1, entry, &head.last_hash);
            match serde_json::to_vec(&entry) {
                Ok(line) => {
                    buf.extend_from_slice(&line);
                    buf.push(b'\n');
                    head.advance(&entry);
                    sealed.push((entry, waiter));
                },
                Err(e) => {
                    let _ = waiter.send(Err(StorageError::serialization_with_source(
                        "failed to encode audit entry",
                        e,
                    )));
                },
            }
        }
        if sealed.is_empty() {
            return;
        }

        state.poisoned = true;
        let file = &mut state.file;
        let written: std::io::Result<()> = async {
            fail_point!("audit-write", |_| {
                Err(std::io::Error::other("injected audit write failure"))
            });
            file.write_all(&buf).await?;
            file.sync_data().await
        }
        .await;

        match written {
            Ok(()) => {
                state.poisoned = false;
                state.head = head;
                for (entry, waiter) in sealed {
                    let _ = waiter.send(Ok(entry));
                }
            },
            Err(e) => {
                tracing::error!(
                    error = %e,
                    path = %self.path.display(),
                    batch = sealed.len(),
                    "audit write failed; log poisoned"
                );
                let message = e.to_string();
                for (_, waiter) in sealed {
                    let _ = waiter.send(Err(StorageError::io_with_source(
                        "failed to persist audit entry",
                        std::io::Error::new(e.kind(), message.clone()),
                    )));
                }
            },
        }
    }
}

fn poisoned_error() -> StorageError {
    StorageError::internal("audit log unavailable after a failed write")
}

#[async_trait]
impl AuditLog for FileAuditLog {
    #[tracing::instrument(skip(self, entry), fields(action = %entry.action, decision = %entry.decision))]
    async fn append(&self, entry: NewAuditEntry) -> StorageResult<AuditEntry> {
        let (tx, rx) = oneshot::channel();
        self.queue.lock().push((entry, tx));

        {
            let mut state = self.state.lock().await;
            self.commit_queued(&mut state).await;
        }

        // Another caller may have committed this entry as part of its batch
        rx.await.map_err(|_| StorageError::internal("audit append abandoned mid-batch"))?
    }
}

/// Reads every entry of an audit file without verifying the chain.
///
/// # Errors
///
/// - [`StorageError::Io`] if the file cannot be read
/// - [`StorageError::Serialization`] (with an [`AuditChainError::Malformed`] source) for the first
///   line that does not parse
pub async fn read_entries(path: impl AsRef<Path>) -> StorageResult<Vec<AuditEntry>> {
    let content = tokio::fs::read_to_string(path.as_ref()).await?;
    let mut entries = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str(line).map_err(|source| {
            let line = index + 1;
            StorageError::serialization_with_source(
                format!("malformed audit entry at line {line}"),
                AuditChainError::Malformed { line, source },
            )
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Copies the audit file verbatim to `writer`, opening it read-only.
///
/// Returns the number of bytes copied.
///
/// # Errors
///
/// Returns [`StorageError::Io`] if the file cannot be read or the writer fails.
pub async fn export<W>(path: impl AsRef<Path>, writer: &mut W) -> StorageResult<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut file = File::open(path.as_ref()).await?;
    let copied = tokio::io::copy(&mut file, writer).await?;
    writer.flush().await?;
    Ok(copied)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::audit::{AuditAction, AuditDecision};

    fn entry(actor: &str) -> NewAuditEntry {
        NewAuditEntry::builder()
            .actor(actor)
            .action(AuditAction::CredentialRequest)
            .decision(AuditDecision::Completed)
            .reason_code("ok")
            .build()
    }

    #[tokio::test]
    async fn test_append_writes_one_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = FileAuditLog::open(&path).await.unwrap();

        log.append(entry("a")).await.unwrap();
        log.append(entry("b")).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.ends_with('\n'));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_share_one_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = std::sync::Arc::new(FileAuditLog::open(&path).await.unwrap());

        let mut set = tokio::task::JoinSet::new();
        for i in 0..32 {
            let log = std::sync::Arc::clone(&log);
            set.spawn(async move { log.append(entry(&format!("w{i}"))).await.unwrap().id() });
        }
        let mut ids = Vec::new();
        while let Some(id) = set.join_next().await {
            ids.push(id.unwrap());
        }
        ids.sort_unstable();
        assert_eq!(ids, (1..=32).collect::<Vec<u64>>());

        let entries = read_entries(&path).await.unwrap();
        assert_eq!(entries.len(), 32);
        assert_eq!(verify_chain(&entries).unwrap().last_id, 32);
        assert_eq!(log.head().await.last_id, 32);
    }

    #[tokio::test]
    async fn test_reopen_resumes_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let first = {
            let log = FileAuditLog::open(&path).await.unwrap();
            log.append(entry("a")).await.unwrap();
            log.append(entry("b")).await.unwrap()
        };

        let log = FileAuditLog::open(&path).await.unwrap();
        assert_eq!(log.head().await.last_id, 2);
        let third = log.append(entry("c")).await.unwrap();
        assert_eq!(third.id(), 3);
        assert_eq!(third.prev_hash(), first.hash());

        let entries = read_entries(&path).await.unwrap();
        assert_eq!(verify_chain(&entries).unwrap().last_id, 3);
    }

    #[tokio::test]
    async fn test_open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state/audit.jsonl");
        let log = FileAuditLog::open(&path).await.unwrap();
        log.append(entry("a")).await.unwrap();
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_new_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let _log = FileAuditLog::open(&path).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_export_copies_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = FileAuditLog::open(&path).await.unwrap();
        log.append(entry("a")).await.unwrap();

        let mut out = Vec::new();
        let copied = export(&path, &mut out).await.unwrap();
        let on_disk = tokio::fs::read(&path).await.unwrap();
        assert_eq!(copied as usize, on_disk.len());
        assert_eq!(out, on_disk);
    }
}
