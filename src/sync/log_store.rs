//! Append-only sync log.
//!
//! Writes go through a single mutex-guarded writer that assigns ids and
//! non-decreasing timestamps and, when configured, appends one JSON line per
//! entry to a file. Readers take the current snapshot (`Arc<Vec<_>>`) and
//! never wait on file I/O.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use super::{LogDraft, LogFilter, SyncLogEntry};
use crate::error::{SyncError, SyncResult};

#[derive(Debug)]
struct Writer {
    file: Option<File>,
    next_id: u64,
    last_timestamp: Option<DateTime<Utc>>,
}

/// The store of [`SyncLogEntry`] records
#[derive(Debug)]
pub struct LogStore {
    writer: Mutex<Writer>,
    snapshot: RwLock<Arc<Vec<SyncLogEntry>>>,
    path: Option<PathBuf>,
}

impl Default for LogStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl LogStore {
    /// A store that keeps entries in memory only.
    pub fn in_memory() -> Self {
        Self {
            writer: Mutex::new(Writer {
                file: None,
                next_id: 1,
                last_timestamp: None,
            }),
            snapshot: RwLock::new(Arc::new(Vec::new())),
            path: None,
        }
    }

    /// Open a file-backed store, reloading any entries already in the file.
    ///
    /// # Errors
    /// `Storage` if the file cannot be created, read, or contains a line that
    /// is not a valid entry.
    pub async fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let (entries, valid_len) = parse_lines(&content)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        if valid_len < content.len() {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = content.len() - valid_len,
                "Truncating incomplete trailing sync log line"
            );
            file.set_len(valid_len as u64).await?;
        } else if !content.is_empty() && !content.ends_with('\n') {
            write_line(&mut file, b"\n").await?;
        }

        let next_id = entries.last().map_or(1, |e| e.id + 1);
        let last_timestamp = entries.last().map(|e| e.timestamp);
        tracing::info!(path = %path.display(), entries = entries.len(), "Sync log opened");

        Ok(Self {
            writer: Mutex::new(Writer {
                file: Some(file),
                next_id,
                last_timestamp,
            }),
            snapshot: RwLock::new(Arc::new(entries)),
            path: Some(path),
        })
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one entry.
    ///
    /// # Errors
    /// `Storage` when the backing file cannot be written. The entry is then
    /// not visible to readers and the failure is not retried.
    pub async fn append(&self, draft: LogDraft) -> SyncResult<SyncLogEntry> {
        let mut writer = self.writer.lock().await;

        let now = Utc::now();
        let timestamp = match writer.last_timestamp {
            Some(last) if last > now => last,
            _ => now,
        };
        let entry = SyncLogEntry {
            id: writer.next_id,
            timestamp,
            plan_id: draft.plan_id,
            plan_version: draft.plan_version,
            source_connection_id: draft.source_connection_id,
            target_connection_id: draft.target_connection_id,
            record_count: draft.record_count,
            success_count: draft.success_count,
            failure_count: draft.failure_count,
            partial: draft.partial,
            error: draft.error,
        };

        if let Some(file) = writer.file.as_mut() {
            let mut line = serde_json::to_vec(&entry).map_err(std::io::Error::from)?;
            line.push(b'\n');
            let len_before = file.metadata().await?.len();
            if let Err(e) = write_line(file, &line).await {
                tracing::error!(error = %e, plan_id = entry.plan_id, "Failed to persist sync log entry");
                if let Err(rollback) = file.set_len(len_before).await {
                    tracing::warn!(error = %rollback, "Could not roll back partial sync log write");
                }
                return Err(e.into());
            }
        }

        writer.next_id += 1;
        writer.last_timestamp = Some(timestamp);

        let mut snapshot = self.snapshot.write().await;
        Arc::make_mut(&mut *snapshot).push(entry.clone());

        Ok(entry)
    }

    /// Lazily iterate entries matching `filter`, oldest first. Each call takes
    /// a fresh snapshot.
    pub async fn query(&self, filter: LogFilter) -> LogQuery {
        LogQuery {
            entries: Arc::clone(&*self.snapshot.read().await),
            position: 0,
            filter,
        }
    }

    pub async fn len(&self) -> usize {
        self.snapshot.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshot.read().await.is_empty()
    }
}

async fn write_line(file: &mut File, line: &[u8]) -> std::io::Result<()> {
    file.write_all(line).await?;
    file.flush().await?;
    file.sync_data().await
}

/// Entries in `content` and the number of bytes they occupy. A last line
/// without its newline that does not parse is a torn write and is left out.
fn parse_lines(content: &str) -> SyncResult<(Vec<SyncLogEntry>, usize)> {
    let mut entries = Vec::new();
    let mut valid_len = 0;

    for (n, line) in content.split_inclusive('\n').enumerate() {
        let text = line.trim();
        if !text.is_empty() {
            match serde_json::from_str::<SyncLogEntry>(text) {
                Ok(entry) => entries.push(entry),
                Err(_) if !line.ends_with('\n') => break,
                Err(e) => {
                    return Err(SyncError::from(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("sync log line {}: {}", n + 1, e),
                    )))
                }
            }
        }
        valid_len += line.len();
    }

    Ok((entries, valid_len))
}

/// Iterator over one snapshot of the log
#[derive(Debug, Clone)]
pub struct LogQuery {
    entries: Arc<Vec<SyncLogEntry>>,
    position: usize,
    filter: LogFilter,
}

impl Iterator for LogQuery {
    type Item = SyncLogEntry;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(entry) = self.entries.get(self.position) {
            self.position += 1;
            if self.filter.matches(entry) {
                return Some(entry.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn draft(plan_id: u64, failures: u64) -> LogDraft {
        LogDraft {
            plan_id,
            plan_version: 1,
            source_connection_id: 1,
            target_connection_id: 2,
            record_count: 3,
            success_count: 3 - failures,
            failure_count: failures,
            partial: false,
            error: (failures > 0).then(|| "boom".to_string()),
        }
    }

    #[tokio::test]
    async fn test_append_assigns_ids_and_orders() {
        let store = LogStore::in_memory();
        let a = store.append(draft(1, 0)).await.unwrap();
        let b = store.append(draft(2, 1)).await.unwrap();

        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert!(b.timestamp >= a.timestamp);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_query_filters() {
        let store = LogStore::in_memory();
        store.append(draft(1, 0)).await.unwrap();
        store.append(draft(2, 1)).await.unwrap();
        store.append(draft(1, 2)).await.unwrap();

        let plan_one: Vec<u64> = store
            .query(LogFilter::for_plan(1))
            .await
            .map(|e| e.id)
            .collect();
        assert_eq!(plan_one, vec![1, 3]);

        let errors = store
            .query(LogFilter {
                has_error: Some(true),
                ..Default::default()
            })
            .await
            .count();
        assert_eq!(errors, 2);
    }

    #[tokio::test]
    async fn test_query_is_a_snapshot() {
        let store = LogStore::in_memory();
        store.append(draft(1, 0)).await.unwrap();

        let query = store.query(LogFilter::default()).await;
        store.append(draft(1, 0)).await.unwrap();

        assert_eq!(query.count(), 1);
        assert_eq!(store.query(LogFilter::default()).await.count(), 2);
    }

    #[tokio::test]
    async fn test_file_backed_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("sync.jsonl");

        {
            let store = LogStore::open(&path).await.unwrap();
            store.append(draft(1, 0)).await.unwrap();
            store.append(draft(2, 1)).await.unwrap();
        }

        let reopened = LogStore::open(&path).await.unwrap();
        assert_eq!(reopened.len().await, 2);
        let next = reopened.append(draft(3, 0)).await.unwrap();
        assert_eq!(next.id, 3);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.jsonl");
        std::fs::write(&path, "{not json}\n").unwrap();

        let err = LogStore::open(&path).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(err.to_string().contains("line 1"));
    }

    #[tokio::test]
    async fn test_torn_last_line_is_dropped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.jsonl");
        {
            let store = LogStore::open(&path).await.unwrap();
            store.append(draft(1, 0)).await.unwrap();
        }
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str(r#"{"id":2,"times"#);
        std::fs::write(&path, &content).unwrap();

        let store = LogStore::open(&path).await.unwrap();
        assert_eq!(store.len().await, 1);
        assert_eq!(store.append(draft(2, 0)).await.unwrap().id, 2);
        drop(store);

        let reopened = LogStore::open(&path).await.unwrap();
        let ids: Vec<u64> = reopened.query(LogFilter::default()).await.map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_complete_last_line_without_newline_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.jsonl");
        {
            let store = LogStore::open(&path).await.unwrap();
            store.append(draft(1, 0)).await.unwrap();
        }
        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.trim_end()).unwrap();

        let store = LogStore::open(&path).await.unwrap();
        assert_eq!(store.len().await, 1);
        store.append(draft(2, 0)).await.unwrap();
        drop(store);

        assert_eq!(LogStore::open(&path).await.unwrap().len().await, 2);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_failed_write_surfaces_and_leaves_log_untouched() {
        let full = OpenOptions::new().append(true).open("/dev/full").await.unwrap();
        let store = LogStore::in_memory();
        store.writer.lock().await.file = Some(full);

        let err = store.append(draft(1, 0)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert_eq!(store.len().await, 0);
        assert_eq!(store.query(LogFilter::default()).await.count(), 0);

        store.writer.lock().await.file = None;
        assert_eq!(store.append(draft(1, 0)).await.unwrap().id, 1);
    }
}
