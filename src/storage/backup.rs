//! Append-only backup log
//!
//! Every successful primary write is mirrored as one immutable JSON line.
//! Entries are never rewritten: a later rating of the same itinerary is a new
//! entry carrying the same logical id, so the log replays in time order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::types::{Itinerary, Rating, Trip};

/// File name of the log inside the backup directory
pub const BACKUP_FILE: &str = "backup.jsonl";

/// The logical record a backup entry carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackupRecord {
    Trip { trip: Trip },
    Itinerary { itinerary: Itinerary },
    Rating {
        itinerary_id: i64,
        rating: Rating,
        feedback: Option<String>,
    },
}

impl BackupRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            BackupRecord::Trip { .. } => "trip",
            BackupRecord::Itinerary { .. } => "itinerary",
            BackupRecord::Rating { .. } => "rating",
        }
    }

    /// Id of the primary record the entry refers to
    pub fn logical_id(&self) -> i64 {
        match self {
            BackupRecord::Trip { trip } => trip.id,
            BackupRecord::Itinerary { itinerary } => itinerary.id,
            BackupRecord::Rating { itinerary_id, .. } => *itinerary_id,
        }
    }
}

/// One immutable write event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub entry_id: Uuid,
    pub written_at: DateTime<Utc>,
    #[serde(flatten)]
    pub record: BackupRecord,
}

impl BackupEntry {
    /// Entry stamped with the primary write time of its record
    pub fn new(record: BackupRecord, written_at: DateTime<Utc>) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            written_at,
            record,
        }
    }
}

/// Append-only secondary store
#[cfg_attr(test, mockall::automock)]
pub trait BackupLog: Send + Sync {
    /// Durably append one entry
    fn append(&self, entry: &BackupEntry) -> StoreResult<()>;

    /// Every readable entry in append order
    fn read_all(&self) -> StoreResult<Vec<BackupEntry>>;
}

/// Backup log kept as a JSON Lines file
pub struct JsonlBackupLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlBackupLog {
    /// Open the log inside `dir`, creating the directory if needed
    pub fn open(dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(BACKUP_FILE);
        debug!("Backup log at {}", path.display());
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BackupLog for JsonlBackupLog {
    fn append(&self, entry: &BackupEntry) -> StoreResult<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let _guard = self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;
        if ends_mid_line(&mut file)? {
            // Terminate a torn tail so this entry starts on its own line
            warn!("Backup log {} ends in a partial line", self.path.display());
            line.insert(0, '\n');
        }
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    fn read_all(&self) -> StoreResult<Vec<BackupEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = std::fs::File::open(&self.path)?;
        let mut entries = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<BackupEntry>(&line) {
                Ok(entry) => entries.push(entry),
                // A torn final line from a crash mid-append is expected
                Err(e) => warn!("Skipping unreadable backup line {}: {}", index + 1, e),
            }
        }
        Ok(entries)
    }
}

fn ends_mid_line(file: &mut File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{now, BudgetTier, NewTrip};
    use tempfile::tempdir;

    fn trip_entry(id: i64) -> BackupEntry {
        let mut trip = NewTrip::new("Hanoi", &["food"], 5, BudgetTier::Budget)
            .validate(now())
            .unwrap();
        trip.id = id;
        let written_at = trip.created_at;
        BackupEntry::new(BackupRecord::Trip { trip }, written_at)
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempdir().unwrap();
        let log = JsonlBackupLog::open(dir.path()).unwrap();

        let first = trip_entry(1);
        let rating = BackupEntry::new(
            BackupRecord::Rating { itinerary_id: 3, rating: Rating::new(4).unwrap(), feedback: None },
            now(),
        );
        log.append(&first).unwrap();
        log.append(&rating).unwrap();

        let entries = log.read_all().unwrap();
        assert_eq!(entries, vec![first, rating]);
        assert_eq!(entries[1].record.kind(), "rating");
        assert_eq!(entries[1].record.logical_id(), 3);
    }

    #[test]
    fn test_entries_are_tagged_lines() {
        let dir = tempdir().unwrap();
        let log = JsonlBackupLog::open(dir.path()).unwrap();
        log.append(&trip_entry(9)).unwrap();

        let raw = std::fs::read_to_string(log.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(raw.trim()).unwrap();
        assert_eq!(value["kind"], "trip");
        assert_eq!(value["trip"]["id"], 9);
    }

    #[test]
    fn test_torn_line_is_skipped() {
        let dir = tempdir().unwrap();
        let log = JsonlBackupLog::open(dir.path()).unwrap();
        let entry = trip_entry(1);
        log.append(&entry).unwrap();

        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        file.write_all(b"{\"entry_id\": \"trunc").unwrap();

        assert_eq!(log.read_all().unwrap(), vec![entry]);
    }

    #[test]
    fn test_append_after_torn_line_is_kept() {
        let dir = tempdir().unwrap();
        let log = JsonlBackupLog::open(dir.path()).unwrap();
        log.append(&trip_entry(1)).unwrap();

        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        file.write_all(b"{\"entry_id\": \"trunc").unwrap();
        drop(file);

        log.append(&trip_entry(2)).unwrap();
        log.append(&trip_entry(3)).unwrap();

        let ids: Vec<i64> = log.read_all().unwrap().iter().map(|e| e.record.logical_id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = tempdir().unwrap();
        let log = JsonlBackupLog::open(&dir.path().join("nested")).unwrap();
        assert!(log.read_all().unwrap().is_empty());
    }
}
