//! Asynchronous backup writer
//!
//! Callers enqueue backup entries after their primary write commits and return
//! immediately. A single worker drains the queue in order, retrying failed
//! appends with exponential backoff. Entries that still fail are parked in the
//! primary store's outbox and reported as degraded durability.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::BackupConfig;
use crate::error::{StoreError, StoreResult};

use super::backup::{BackupEntry, BackupLog};
use super::sqlite::PrimaryStore;

enum Command {
    Append(BackupEntry),
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct WriterStats {
    appended: AtomicU64,
    retried: AtomicU64,
    degraded: AtomicU64,
}

/// Backup durability counters since startup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupHealth {
    /// Entries appended to the backup log
    pub appended: u64,
    /// Failed attempts that were retried
    pub retried: u64,
    /// Entries that exhausted their retries or could not be queued
    pub degraded: u64,
    /// Entries currently parked in the outbox
    pub outbox_len: usize,
}

impl BackupHealth {
    pub fn is_degraded(&self) -> bool {
        self.outbox_len > 0
    }
}

/// Handle to the backup queue
pub struct BackupWriter {
    queue: mpsc::Sender<Command>,
    stats: Arc<WriterStats>,
    primary: Arc<PrimaryStore>,
}

impl BackupWriter {
    /// Spawn the worker on the current tokio runtime
    pub fn spawn(log: Arc<dyn BackupLog>, primary: Arc<PrimaryStore>, config: BackupConfig) -> Self {
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let stats = Arc::new(WriterStats::default());

        let worker = Worker {
            log,
            primary: primary.clone(),
            config,
            stats: stats.clone(),
        };
        tokio::spawn(worker.run(rx));

        Self { queue, stats, primary }
    }

    /// Queue an entry without waiting for the append.
    ///
    /// A full or closed queue never fails the caller; the entry goes straight
    /// to the outbox instead.
    pub async fn enqueue(&self, entry: BackupEntry) {
        let entry = match self.queue.try_send(Command::Append(entry)) {
            Ok(()) => return,
            Err(e) => match e.into_inner() {
                Command::Append(entry) => entry,
                Command::Flush(_) => return,
            },
        };

        self.stats.degraded.fetch_add(1, Ordering::Relaxed);
        error!(
            target: "durability",
            "Backup queue unavailable, parking {} entry for #{}",
            entry.record.kind(),
            entry.record.logical_id()
        );
        if let Err(e) = self.primary.park_backup(&entry, "backup queue unavailable").await {
            error!(target: "durability", "Failed to park backup entry {}: {}", entry.entry_id, e);
        }
    }

    /// Wait until every entry queued so far has been handled
    pub async fn flush(&self) -> StoreResult<()> {
        let (done, wait) = oneshot::channel();
        self.queue
            .send(Command::Flush(done))
            .await
            .map_err(|_| StoreError::QueueClosed)?;
        wait.await.map_err(|_| StoreError::QueueClosed)
    }

    pub async fn health(&self) -> StoreResult<BackupHealth> {
        Ok(BackupHealth {
            appended: self.stats.appended.load(Ordering::Relaxed),
            retried: self.stats.retried.load(Ordering::Relaxed),
            degraded: self.stats.degraded.load(Ordering::Relaxed),
            outbox_len: self.primary.outbox_len().await?,
        })
    }
}

struct Worker {
    log: Arc<dyn BackupLog>,
    primary: Arc<PrimaryStore>,
    config: BackupConfig,
    stats: Arc<WriterStats>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Append(entry) => self.deliver(entry).await,
                Command::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("Backup queue closed, worker exiting");
    }

    async fn deliver(&self, entry: BackupEntry) {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            let log = self.log.clone();
            let pending = entry.clone();
            let result = tokio::task::spawn_blocking(move || log.append(&pending))
                .await
                .unwrap_or_else(|e| Err(StoreError::Io(std::io::Error::other(e.to_string()))));

            match result {
                Ok(()) => {
                    self.stats.appended.fetch_add(1, Ordering::Relaxed);
                    if attempt > 0 {
                        info!("Backup entry {} appended after {} retries", entry.entry_id, attempt);
                    }
                    return;
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt + 1 < max_attempts {
                        self.stats.retried.fetch_add(1, Ordering::Relaxed);
                        let backoff = self.config.backoff_duration(attempt);
                        warn!(
                            "Backup append failed (attempt {}/{}), retrying in {:?}: {}",
                            attempt + 1,
                            max_attempts,
                            backoff,
                            e
                        );
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        self.stats.degraded.fetch_add(1, Ordering::Relaxed);
        error!(
            target: "durability",
            "Backup degraded: {} entry for #{} failed after {} attempts: {}",
            entry.record.kind(),
            entry.record.logical_id(),
            max_attempts,
            last_error
        );
        if let Err(e) = self.primary.park_backup(&entry, &last_error).await {
            error!(target: "durability", "Failed to park backup entry {}: {}", entry.entry_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backup::{BackupRecord, MockBackupLog};
    use crate::training::CurationPolicy;
    use crate::types::{now, Rating};
    use tempfile::tempdir;

    fn fast_retries(max_attempts: u32) -> BackupConfig {
        BackupConfig {
            max_attempts,
            base_backoff_ms: 1,
            max_backoff_ms: 4,
            queue_capacity: 8,
        }
    }

    fn rating_entry() -> BackupEntry {
        BackupEntry::new(
            BackupRecord::Rating { itinerary_id: 1, rating: Rating::new(5).unwrap(), feedback: None },
            now(),
        )
    }

    async fn primary(dir: &std::path::Path) -> Arc<PrimaryStore> {
        Arc::new(PrimaryStore::open(dir.join("w.db"), CurationPolicy::default(), 3).await.unwrap())
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let dir = tempdir().unwrap();
        let mut log = MockBackupLog::new();
        let mut calls = 0;
        log.expect_append().times(3).returning(move |_| {
            calls += 1;
            if calls < 3 {
                Err(StoreError::Io(std::io::Error::other("disk busy")))
            } else {
                Ok(())
            }
        });

        let writer = BackupWriter::spawn(Arc::new(log), primary(dir.path()).await, fast_retries(5));
        writer.enqueue(rating_entry()).await;
        writer.flush().await.unwrap();

        let health = writer.health().await.unwrap();
        assert_eq!(health.appended, 1);
        assert_eq!(health.retried, 2);
        assert_eq!(health.degraded, 0);
        assert!(!health.is_degraded());
    }

    #[tokio::test]
    async fn test_exhausted_retries_park_entry() {
        let dir = tempdir().unwrap();
        let mut log = MockBackupLog::new();
        log.expect_append()
            .times(2)
            .returning(|_| Err(StoreError::Io(std::io::Error::other("read-only filesystem"))));

        let store = primary(dir.path()).await;
        let writer = BackupWriter::spawn(Arc::new(log), store.clone(), fast_retries(2));
        let entry = rating_entry();
        writer.enqueue(entry.clone()).await;
        writer.flush().await.unwrap();

        let health = writer.health().await.unwrap();
        assert_eq!(health.appended, 0);
        assert_eq!(health.degraded, 1);
        assert_eq!(health.outbox_len, 1);
        assert_eq!(store.outbox_entries().await.unwrap(), vec![entry]);
    }
}
