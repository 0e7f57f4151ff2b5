//! SQLite primary store for trips, itineraries and curated training data
//!
//! Source of truth for every record. All mutations run inside one IMMEDIATE
//! transaction, which takes the database write lock up front so concurrent
//! writers are serialised instead of racing on the metrics row.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult, ValidationError};
use crate::training::CurationPolicy;
use crate::types::{from_db_time, to_db_time, BudgetTier, Itinerary, Rating, Trip};

use super::backup::BackupEntry;

struct Inner {
    conn: Connection,
    /// Timestamp handed to the last write; keeps write times strictly increasing
    last_write: Option<DateTime<Utc>>,
}

/// SQLite-based primary store
pub struct PrimaryStore {
    inner: Arc<Mutex<Inner>>,
    policy: CurationPolicy,
    busy_retries: u32,
}

impl PrimaryStore {
    /// Open (or create) the primary store at the given path
    pub async fn open<P: AsRef<Path>>(path: P, policy: CurationPolicy, busy_retries: u32) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let conn = Connection::open(&path)?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
        )?;

        Self::init_schema(&conn)?;
        let last_write = latest_write_time(&conn)?;
        debug!("Primary store ready at {}", path.display());

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner { conn, last_write })),
            policy,
            busy_retries,
        })
    }

    fn init_schema(conn: &Connection) -> StoreResult<()> {
        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS trips (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                destination TEXT NOT NULL,
                interests TEXT NOT NULL DEFAULT '[]',
                duration_days INTEGER NOT NULL CHECK (duration_days > 0),
                budget TEXT NOT NULL CHECK (budget IN ('Budget', 'Moderate', 'Luxury')),
                travel_style TEXT NOT NULL DEFAULT '[]',
                include_food INTEGER NOT NULL DEFAULT 1,
                include_transport INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS itineraries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trip_id INTEGER NOT NULL REFERENCES trips(id) ON DELETE CASCADE,
                content TEXT NOT NULL,
                word_count INTEGER NOT NULL,
                character_count INTEGER NOT NULL,
                model_name TEXT NOT NULL,
                generation_time_ms INTEGER NOT NULL DEFAULT 0,
                rating INTEGER CHECK (rating BETWEEN 0 AND 5),
                feedback TEXT,
                quality_score REAL,
                rated_at TEXT,
                training_sample_id INTEGER REFERENCES training_samples(id) ON DELETE SET NULL,
                created_at TEXT NOT NULL
            );

            -- One curated sample per trip shape; the unique fingerprint is the dedup guard
            CREATE TABLE IF NOT EXISTS training_samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fingerprint TEXT NOT NULL UNIQUE,
                itinerary_id INTEGER NOT NULL REFERENCES itineraries(id) ON DELETE CASCADE,
                input_params TEXT NOT NULL,
                output TEXT NOT NULL,
                quality_score REAL NOT NULL,
                high_quality INTEGER NOT NULL,
                consumed INTEGER NOT NULL DEFAULT 0,
                consumed_by_cycle INTEGER,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS training_cycles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle_number INTEGER NOT NULL UNIQUE,
                samples_used INTEGER NOT NULL,
                avg_quality_before REAL NOT NULL,
                avg_quality_after REAL NOT NULL,
                improvement REAL NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS system_metrics (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                total_trips INTEGER NOT NULL,
                total_itineraries INTEGER NOT NULL,
                total_ratings INTEGER NOT NULL,
                avg_rating REAL NOT NULL,
                avg_quality_score REAL NOT NULL,
                unconsumed_high_quality_samples INTEGER NOT NULL,
                total_training_samples INTEGER NOT NULL,
                training_cycles_completed INTEGER NOT NULL,
                last_cycle_at TEXT,
                updated_at TEXT NOT NULL
            );

            -- Backup entries that could not be appended to the backup log
            CREATE TABLE IF NOT EXISTS backup_outbox (
                entry_id TEXT PRIMARY KEY,
                written_at TEXT NOT NULL,
                payload TEXT NOT NULL,
                last_error TEXT NOT NULL,
                parked_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_trips_destination ON trips(destination COLLATE NOCASE);
            CREATE INDEX IF NOT EXISTS idx_itineraries_trip ON itineraries(trip_id);
            CREATE INDEX IF NOT EXISTS idx_itineraries_created ON itineraries(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_samples_unconsumed ON training_samples(high_quality, consumed);
        "#)?;

        Ok(())
    }

    pub fn policy(&self) -> &CurationPolicy {
        &self.policy
    }

    /// Run a write pipeline in one transaction, stamped with a fresh write time
    pub async fn write<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: FnMut(&mut Transaction<'_>, DateTime<Utc>) -> StoreResult<T>,
    {
        self.transact(None, op).await
    }

    /// Run a write pipeline stamped with a known write time (backup replay)
    pub async fn write_at<T, F>(&self, at: DateTime<Utc>, op: F) -> StoreResult<T>
    where
        F: FnMut(&mut Transaction<'_>, DateTime<Utc>) -> StoreResult<T>,
    {
        self.transact(Some(at), op).await
    }

    async fn transact<T, F>(&self, at: Option<DateTime<Utc>>, mut op: F) -> StoreResult<T>
    where
        F: FnMut(&mut Transaction<'_>, DateTime<Utc>) -> StoreResult<T>,
    {
        let mut inner = self.inner.lock().await;

        let now = match at {
            Some(ts) => ts,
            None => next_write_time(inner.last_write),
        };

        let mut attempt = 0u32;
        loop {
            match run_transaction(&mut inner.conn, now, &mut op) {
                Ok(value) => {
                    inner.last_write = Some(inner.last_write.map_or(now, |last| last.max(now)));
                    return Ok(value);
                }
                Err(e) if e.is_busy() => {
                    attempt += 1;
                    if attempt > self.busy_retries {
                        return Err(StoreError::Conflict { attempts: attempt });
                    }
                    warn!("Primary store busy, retrying transaction (attempt {})", attempt);
                    tokio::time::sleep(Duration::from_millis(20 * 2u64.saturating_pow(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run a read-only query against the store
    pub async fn read<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T>,
    {
        let inner = self.inner.lock().await;
        op(&inner.conn)
    }

    /// Load a trip by ID
    pub async fn trip(&self, id: i64) -> StoreResult<Option<Trip>> {
        self.read(|conn| load_trip(conn, id)).await
    }

    /// Load an itinerary by ID
    pub async fn itinerary(&self, id: i64) -> StoreResult<Option<Itinerary>> {
        self.read(|conn| load_itinerary(conn, id)).await
    }

    /// Most recent itineraries with their trip details
    pub async fn recent_itineraries(&self, limit: usize) -> StoreResult<Vec<ItinerarySummary>> {
        self.read(|conn| {
            let sql = format!("{} ORDER BY i.created_at DESC, i.id DESC LIMIT ?1", SUMMARY_SELECT);
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![limit], summary_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        }).await
    }

    /// Itineraries whose destination contains the query (case-insensitive)
    pub async fn search_destination(&self, query: &str, limit: usize) -> StoreResult<Vec<ItinerarySummary>> {
        let query = query.trim().to_lowercase();
        self.read(|conn| {
            let sql = format!(
                "{} WHERE instr(lower(t.destination), ?1) > 0 ORDER BY i.created_at DESC LIMIT ?2",
                SUMMARY_SELECT
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![query, limit], summary_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        }).await
    }

    /// Itineraries rated at or above the high-quality rating, best first
    pub async fn high_rated_itineraries(&self, limit: usize) -> StoreResult<Vec<ItinerarySummary>> {
        let min_rating = self.policy.scorer.high_quality_rating;
        self.read(|conn| {
            let sql = format!(
                "{} WHERE i.rating >= ?1 ORDER BY i.rating DESC, i.created_at DESC LIMIT ?2",
                SUMMARY_SELECT
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![min_rating, limit], summary_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        }).await
    }

    pub async fn all_trips(&self) -> StoreResult<Vec<Trip>> {
        self.read(|conn| {
            let sql = format!("SELECT {} FROM trips ORDER BY id", TRIP_COLUMNS);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], trip_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        }).await
    }

    pub async fn all_itineraries(&self) -> StoreResult<Vec<Itinerary>> {
        self.read(|conn| {
            let sql = format!("SELECT {} FROM itineraries ORDER BY id", ITINERARY_COLUMNS);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], itinerary_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        }).await
    }

    /// Park a backup entry that could not reach the backup log
    pub async fn park_backup(&self, entry: &BackupEntry, error: &str) -> StoreResult<()> {
        let payload = serde_json::to_string(entry)?;
        self.write(|tx, now| {
            tx.execute(
                r#"INSERT INTO backup_outbox (entry_id, written_at, payload, last_error, parked_at)
                   VALUES (?1, ?2, ?3, ?4, ?5)
                   ON CONFLICT(entry_id) DO UPDATE SET last_error = excluded.last_error"#,
                params![
                    entry.entry_id.to_string(),
                    to_db_time(&entry.written_at),
                    payload,
                    error,
                    to_db_time(&now),
                ],
            )?;
            Ok(())
        }).await
    }

    /// Parked backup entries in write order
    pub async fn outbox_entries(&self) -> StoreResult<Vec<BackupEntry>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT payload FROM backup_outbox ORDER BY written_at, entry_id",
            )?;
            let entries = stmt.query_map([], |row| json_column::<BackupEntry>(row, 0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        }).await
    }

    pub async fn remove_from_outbox(&self, entry: &BackupEntry) -> StoreResult<()> {
        let entry_id = entry.entry_id.to_string();
        self.write(|tx, _| {
            tx.execute("DELETE FROM backup_outbox WHERE entry_id = ?1", params![entry_id])?;
            Ok(())
        }).await
    }

    pub async fn outbox_len(&self) -> StoreResult<usize> {
        self.read(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM backup_outbox", [], |row| row.get(0))?;
            Ok(count as usize)
        }).await
    }
}

fn run_transaction<T, F>(conn: &mut Connection, now: DateTime<Utc>, op: &mut F) -> StoreResult<T>
where
    F: FnMut(&mut Transaction<'_>, DateTime<Utc>) -> StoreResult<T>,
{
    let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = op(&mut tx, now)?;
    tx.commit()?;
    Ok(value)
}

/// Newest timestamp already persisted, so write times keep increasing across restarts
fn latest_write_time(conn: &Connection) -> StoreResult<Option<DateTime<Utc>>> {
    const QUERIES: [&str; 5] = [
        "SELECT MAX(created_at) FROM trips",
        "SELECT MAX(created_at) FROM itineraries",
        "SELECT MAX(rated_at) FROM itineraries",
        "SELECT MAX(updated_at) FROM system_metrics",
        "SELECT MAX(started_at) FROM training_cycles",
    ];

    let mut latest: Option<DateTime<Utc>> = None;
    for sql in QUERIES {
        let raw: Option<String> = conn.query_row(sql, [], |row| row.get(0))?;
        if let Some(raw) = raw {
            let ts = from_db_time(&raw).map_err(|e| conversion_error(0, e))?;
            latest = Some(latest.map_or(ts, |current| current.max(ts)));
        }
    }
    Ok(latest)
}

fn next_write_time(last: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = crate::types::now();
    match last {
        Some(last) if now <= last => last + chrono::Duration::microseconds(1),
        _ => now,
    }
}

/// One row of the itinerary listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItinerarySummary {
    pub id: i64,
    pub trip_id: i64,
    pub destination: String,
    pub duration_days: u32,
    pub budget: BudgetTier,
    pub rating: Option<Rating>,
    pub quality_score: Option<f64>,
    pub word_count: u32,
    pub created_at: DateTime<Utc>,
}

const SUMMARY_SELECT: &str = r#"SELECT i.id, i.trip_id, t.destination, t.duration_days, t.budget,
           i.rating, i.quality_score, i.word_count, i.created_at
    FROM itineraries i
    JOIN trips t ON i.trip_id = t.id"#;

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<ItinerarySummary> {
    Ok(ItinerarySummary {
        id: row.get(0)?,
        trip_id: row.get(1)?,
        destination: row.get(2)?,
        duration_days: row.get(3)?,
        budget: budget_column(row, 4)?,
        rating: rating_column(row, 5)?,
        quality_score: row.get(6)?,
        word_count: row.get(7)?,
        created_at: time_column(row, 8)?,
    })
}

pub(crate) const TRIP_COLUMNS: &str =
    "id, destination, interests, duration_days, budget, travel_style, include_food, include_transport, created_at";

pub(crate) const ITINERARY_COLUMNS: &str =
    "id, trip_id, content, word_count, character_count, model_name, generation_time_ms, \
     rating, feedback, quality_score, rated_at, training_sample_id, created_at";

fn assigned_id(id: i64) -> Option<i64> {
    (id > 0).then_some(id)
}

/// Insert a trip, keeping its id when it already has one
pub(crate) fn insert_trip(conn: &Connection, trip: &Trip) -> StoreResult<i64> {
    let interests = serde_json::to_string(&trip.interests)?;
    let travel_style = serde_json::to_string(&trip.travel_style)?;

    conn.execute(
        r#"INSERT INTO trips
           (id, destination, interests, duration_days, budget, travel_style,
            include_food, include_transport, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
        params![
            assigned_id(trip.id),
            trip.destination,
            interests,
            trip.duration_days,
            trip.budget.as_str(),
            travel_style,
            trip.include_food,
            trip.include_transport,
            to_db_time(&trip.created_at),
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

pub(crate) fn load_trip(conn: &Connection, id: i64) -> StoreResult<Option<Trip>> {
    let sql = format!("SELECT {} FROM trips WHERE id = ?1", TRIP_COLUMNS);
    let mut stmt = conn.prepare_cached(&sql)?;
    Ok(stmt.query_row(params![id], trip_from_row).optional()?)
}

/// Insert an unrated itinerary, keeping its id when it already has one
pub(crate) fn insert_itinerary(conn: &Connection, itinerary: &Itinerary) -> StoreResult<i64> {
    let generation_time_ms = i64::try_from(itinerary.generation_time_ms)
        .map_err(|_| ValidationError::GenerationTimeOutOfRange(itinerary.generation_time_ms))?;

    conn.execute(
        r#"INSERT INTO itineraries
           (id, trip_id, content, word_count, character_count, model_name,
            generation_time_ms, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
        params![
            assigned_id(itinerary.id),
            itinerary.trip_id,
            itinerary.content,
            itinerary.word_count,
            itinerary.character_count,
            itinerary.model_name,
            generation_time_ms,
            to_db_time(&itinerary.created_at),
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

pub(crate) fn load_itinerary(conn: &Connection, id: i64) -> StoreResult<Option<Itinerary>> {
    let sql = format!("SELECT {} FROM itineraries WHERE id = ?1", ITINERARY_COLUMNS);
    let mut stmt = conn.prepare_cached(&sql)?;
    Ok(stmt.query_row(params![id], itinerary_from_row).optional()?)
}

/// Attach a rating to an itinerary, replacing any earlier one
pub(crate) fn apply_rating(
    conn: &Connection,
    itinerary_id: i64,
    rating: Rating,
    feedback: Option<&str>,
    quality_score: f64,
    rated_at: &DateTime<Utc>,
) -> StoreResult<()> {
    let updated = conn.execute(
        r#"UPDATE itineraries
           SET rating = ?1, feedback = ?2, quality_score = ?3, rated_at = ?4
           WHERE id = ?5"#,
        params![rating.value(), feedback, quality_score, to_db_time(rated_at), itinerary_id],
    )?;

    if updated == 0 {
        return Err(StoreError::NotFound { kind: "itinerary", id: itinerary_id });
    }
    Ok(())
}

/// Associate an itinerary with the sample curated from it
pub(crate) fn link_sample(conn: &Connection, itinerary_id: i64, sample_id: i64) -> StoreResult<()> {
    conn.execute(
        "UPDATE itineraries SET training_sample_id = ?1 WHERE id = ?2",
        params![sample_id, itinerary_id],
    )?;
    Ok(())
}

pub(crate) fn trip_from_row(row: &Row<'_>) -> rusqlite::Result<Trip> {
    Ok(Trip {
        id: row.get(0)?,
        destination: row.get(1)?,
        interests: json_column(row, 2)?,
        duration_days: row.get(3)?,
        budget: budget_column(row, 4)?,
        travel_style: json_column(row, 5)?,
        include_food: row.get(6)?,
        include_transport: row.get(7)?,
        created_at: time_column(row, 8)?,
    })
}

pub(crate) fn itinerary_from_row(row: &Row<'_>) -> rusqlite::Result<Itinerary> {
    Ok(Itinerary {
        id: row.get(0)?,
        trip_id: row.get(1)?,
        content: row.get(2)?,
        word_count: row.get(3)?,
        character_count: row.get(4)?,
        model_name: row.get(5)?,
        generation_time_ms: u64::try_from(row.get::<_, i64>(6)?).map_err(|e| conversion_error(6, e))?,
        rating: rating_column(row, 7)?,
        feedback: row.get(8)?,
        quality_score: row.get(9)?,
        rated_at: opt_time_column(row, 10)?,
        training_sample_id: row.get(11)?,
        created_at: time_column(row, 12)?,
    })
}

pub(crate) fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

pub(crate) fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    from_db_time(&raw).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn opt_time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| from_db_time(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn budget_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<BudgetTier> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn rating_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Rating>> {
    let raw: Option<i64> = row.get(idx)?;
    raw.map(Rating::new)
        .transpose()
        .map_err(|e| conversion_error(idx, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewItinerary, NewTrip};
    use tempfile::tempdir;

    async fn open_store(dir: &Path) -> PrimaryStore {
        PrimaryStore::open(dir.join("test.db"), CurationPolicy::default(), 3)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_load_trip() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let draft = NewTrip::new("Lisbon, Portugal", &["food", "history"], 4, BudgetTier::Budget)
            .with_travel_style(&["slow"])
            .validate(crate::types::now())
            .unwrap();

        let id = store.write(|tx, _| insert_trip(tx, &draft)).await.unwrap();
        assert!(id > 0);

        let loaded = store.trip(id).await.unwrap().unwrap();
        assert_eq!(loaded.destination, "Lisbon, Portugal");
        assert_eq!(loaded.interests.len(), 2);
        assert_eq!(loaded.created_at, draft.created_at);
    }

    #[tokio::test]
    async fn test_explicit_ids_are_kept() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let mut trip = NewTrip::new("Oslo", &["hiking"], 2, BudgetTier::Luxury)
            .validate(crate::types::now())
            .unwrap();
        trip.id = 42;
        let id = store.write(|tx, _| insert_trip(tx, &trip)).await.unwrap();
        assert_eq!(id, 42);

        let mut itinerary = NewItinerary::from_text(42, "Day 1: fjords", "test-model", 10)
            .into_record(crate::types::now());
        itinerary.id = 7;
        let itin_id = store.write(|tx, _| insert_itinerary(tx, &itinerary)).await.unwrap();
        assert_eq!(itin_id, 7);
        assert_eq!(store.itinerary(7).await.unwrap().unwrap().trip_id, 42);
    }

    #[tokio::test]
    async fn test_write_times_strictly_increase() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let first = store.write(|_, now| Ok(now)).await.unwrap();
        let second = store.write(|_, now| Ok(now)).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_write_times_increase_across_reopen() {
        let dir = tempdir().unwrap();
        let ahead = crate::types::now() + chrono::Duration::hours(1);
        {
            let store = open_store(dir.path()).await;
            let trip = NewTrip::new("Quito", &["volcanoes"], 3, BudgetTier::Budget)
                .validate(ahead)
                .unwrap();
            store.write_at(ahead, |tx, _| insert_trip(tx, &trip)).await.unwrap();
        }

        // Wall clock is now behind the newest stored write
        let store = open_store(dir.path()).await;
        let next = store.write(|_, now| Ok(now)).await.unwrap();
        assert!(next > ahead);
    }

    #[tokio::test]
    async fn test_generation_time_is_kept_verbatim() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let trip = NewTrip::new("Lima", &["food"], 2, BudgetTier::Budget)
            .validate(crate::types::now())
            .unwrap();
        let trip_id = store.write(|tx, _| insert_trip(tx, &trip)).await.unwrap();

        let slow = NewItinerary::from_text(trip_id, "Day 1: ceviche", "m", i64::MAX as u64)
            .into_record(crate::types::now());
        let id = store.write(|tx, _| insert_itinerary(tx, &slow)).await.unwrap();
        assert_eq!(store.itinerary(id).await.unwrap().unwrap().generation_time_ms, i64::MAX as u64);

        let overflow = NewItinerary::from_text(trip_id, "Day 1: ceviche", "m", u64::MAX)
            .into_record(crate::types::now());
        let err = store.write(|tx, _| insert_itinerary(tx, &overflow)).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Validation(ValidationError::GenerationTimeOutOfRange(ms)) if ms == u64::MAX
        ));
        assert_eq!(store.all_itineraries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rating_missing_itinerary() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let rating = Rating::new(4).unwrap();
        let err = store
            .write(|tx, now| apply_rating(tx, 99, rating, None, 72.0, &now))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "itinerary", id: 99 }));
    }

    #[tokio::test]
    async fn test_failed_pipeline_rolls_back() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let trip = NewTrip::new("Cairo", &["history"], 3, BudgetTier::Moderate)
            .validate(crate::types::now())
            .unwrap();
        let result: StoreResult<()> = store
            .write(|tx, _| {
                insert_trip(tx, &trip)?;
                Err(StoreError::NotFound { kind: "itinerary", id: 1 })
            })
            .await;
        assert!(result.is_err());
        assert!(store.all_trips().await.unwrap().is_empty());
    }
}
