//! Cycle orchestrator - summarises curated samples into training cycles
//!
//! A cycle fires once enough unconsumed high-quality samples exist. The cycle
//! row and the consumption marks are written in the caller's transaction, so
//! they commit together or not at all.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::storage::sqlite::{conversion_error, opt_time_column, time_column};
use crate::types::to_db_time;

use super::CurationPolicy;

/// Lifecycle of a training cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl CycleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CycleStatus::Pending => "pending",
            CycleStatus::Running => "running",
            CycleStatus::Completed => "completed",
            CycleStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CycleStatus::Completed | CycleStatus::Failed)
    }

    /// Move to `next`, rejecting anything but pending -> running -> completed | failed
    pub fn advance(self, next: CycleStatus) -> StoreResult<CycleStatus> {
        let allowed = matches!(
            (self, next),
            (CycleStatus::Pending, CycleStatus::Running)
                | (CycleStatus::Running, CycleStatus::Completed)
                | (CycleStatus::Running, CycleStatus::Failed)
        );
        if allowed {
            Ok(next)
        } else {
            Err(StoreError::InvalidTransition { from: self.as_str(), to: next.as_str() })
        }
    }
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CycleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CycleStatus::Pending),
            "running" => Ok(CycleStatus::Running),
            "completed" => Ok(CycleStatus::Completed),
            "failed" => Ok(CycleStatus::Failed),
            other => Err(format!("unknown cycle status '{}'", other)),
        }
    }
}

#[derive(Debug)]
struct StatusParseError(String);

impl std::fmt::Display for StatusParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for StatusParseError {}

/// A point-in-time summary of consumed samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingCycle {
    pub id: i64,
    pub cycle_number: i64,
    pub samples_used: u64,
    /// Average score of high-quality samples consumed by earlier cycles
    pub avg_quality_before: f64,
    /// Average score of every high-quality sample once this batch is consumed
    pub avg_quality_after: f64,
    pub improvement: f64,
    pub status: CycleStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

const CYCLE_COLUMNS: &str = "id, cycle_number, samples_used, avg_quality_before, avg_quality_after, \
     improvement, status, started_at, completed_at";

fn cycle_from_row(row: &Row<'_>) -> rusqlite::Result<TrainingCycle> {
    let status: String = row.get(6)?;
    Ok(TrainingCycle {
        id: row.get(0)?,
        cycle_number: row.get(1)?,
        samples_used: row.get::<_, i64>(2)?.max(0) as u64,
        avg_quality_before: row.get(3)?,
        avg_quality_after: row.get(4)?,
        improvement: row.get(5)?,
        status: status.parse().map_err(|e| conversion_error(6, StatusParseError(e)))?,
        started_at: time_column(row, 7)?,
        completed_at: opt_time_column(row, 8)?,
    })
}

/// Emit a cycle if the unconsumed high-quality backlog reached the threshold.
///
/// Returns `None` when the backlog is too small; that is the normal case.
pub(crate) fn run_if_ready(
    conn: &Connection,
    policy: &CurationPolicy,
    now: &DateTime<Utc>,
) -> StoreResult<Option<TrainingCycle>> {
    let threshold = policy.cycle_threshold.max(1) as i64;

    let batch: Vec<i64> = {
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM training_samples WHERE high_quality = 1 AND consumed = 0 ORDER BY id",
        )?;
        let ids = stmt.query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids
    };

    if (batch.len() as i64) < threshold {
        debug!(
            "Training cycle not ready: {}/{} unconsumed high-quality samples",
            batch.len(),
            threshold
        );
        return Ok(None);
    }

    let cycle_number: i64 = conn.query_row(
        "SELECT COALESCE(MAX(cycle_number), 0) + 1 FROM training_cycles",
        [],
        |row| row.get(0),
    )?;

    let avg_quality_before = consumed_average(conn)?;

    let mut status = CycleStatus::Pending.advance(CycleStatus::Running)?;
    conn.execute(
        r#"INSERT INTO training_cycles
           (cycle_number, samples_used, avg_quality_before, avg_quality_after, improvement, status, started_at)
           VALUES (?1, ?2, ?3, ?3, 0.0, ?4, ?5)"#,
        params![
            cycle_number,
            batch.len() as i64,
            avg_quality_before,
            status.as_str(),
            to_db_time(now),
        ],
    )?;
    let id = conn.last_insert_rowid();

    let mut marked = 0usize;
    {
        let mut stmt = conn.prepare_cached(
            "UPDATE training_samples SET consumed = 1, consumed_by_cycle = ?1 WHERE id = ?2 AND consumed = 0",
        )?;
        for sample_id in &batch {
            marked += stmt.execute(params![cycle_number, sample_id])?;
        }
    }
    if marked != batch.len() {
        return Err(StoreError::CycleAborted {
            cycle_number,
            reason: format!("marked {} of {} samples", marked, batch.len()),
        });
    }

    let avg_quality_after = consumed_average(conn)?;
    let improvement = avg_quality_after - avg_quality_before;
    status = status.advance(CycleStatus::Completed)?;

    conn.execute(
        r#"UPDATE training_cycles
           SET avg_quality_after = ?1, improvement = ?2, status = ?3, completed_at = ?4
           WHERE id = ?5"#,
        params![avg_quality_after, improvement, status.as_str(), to_db_time(now), id],
    )?;

    info!(
        "Training cycle #{} completed: {} samples, quality {:.1} -> {:.1}",
        cycle_number,
        batch.len(),
        avg_quality_before,
        avg_quality_after
    );

    Ok(Some(TrainingCycle {
        id,
        cycle_number,
        samples_used: batch.len() as u64,
        avg_quality_before,
        avg_quality_after,
        improvement,
        status,
        started_at: *now,
        completed_at: Some(*now),
    }))
}

fn consumed_average(conn: &Connection) -> StoreResult<f64> {
    Ok(conn.query_row(
        "SELECT COALESCE(AVG(quality_score), 0.0) FROM training_samples WHERE high_quality = 1 AND consumed = 1",
        [],
        |row| row.get(0),
    )?)
}

/// All cycles, oldest first
pub(crate) fn history(conn: &Connection) -> StoreResult<Vec<TrainingCycle>> {
    let sql = format!("SELECT {} FROM training_cycles ORDER BY cycle_number", CYCLE_COLUMNS);
    let mut stmt = conn.prepare_cached(&sql)?;
    let cycles = stmt.query_map([], cycle_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(cycles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::PrimaryStore;
    use crate::types::now;
    use tempfile::tempdir;

    /// Insert bare samples without going through curation
    fn insert_samples(conn: &Connection, scores: &[f64], ts: &DateTime<Utc>) -> StoreResult<()> {
        conn.execute(
            "INSERT INTO trips (destination, duration_days, budget, created_at) VALUES ('Rome', 3, 'Budget', ?1)",
            params![to_db_time(ts)],
        )?;
        let trip_id = conn.last_insert_rowid();
        for (i, score) in scores.iter().enumerate() {
            conn.execute(
                r#"INSERT INTO itineraries (trip_id, content, word_count, character_count, model_name, created_at)
                   VALUES (?1, 'text', 1, 4, 'm', ?2)"#,
                params![trip_id, to_db_time(ts)],
            )?;
            let itinerary_id = conn.last_insert_rowid();
            conn.execute(
                r#"INSERT INTO training_samples
                   (fingerprint, itinerary_id, input_params, output, quality_score, high_quality, created_at)
                   VALUES (?1, ?2, '{}', '{}', ?3, 1, ?4)"#,
                params![format!("fp-{}-{}", ts.timestamp_micros(), i), itinerary_id, score, to_db_time(ts)],
            )?;
        }
        Ok(())
    }

    #[test]
    fn test_status_transitions() {
        assert_eq!(CycleStatus::Pending.advance(CycleStatus::Running).unwrap(), CycleStatus::Running);
        assert!(CycleStatus::Running.advance(CycleStatus::Failed).unwrap().is_terminal());
        assert!(matches!(
            CycleStatus::Completed.advance(CycleStatus::Running),
            Err(StoreError::InvalidTransition { from: "completed", to: "running" })
        ));
        assert!(CycleStatus::Pending.advance(CycleStatus::Completed).is_err());
    }

    #[tokio::test]
    async fn test_below_threshold_is_noop() {
        let dir = tempdir().unwrap();
        let store = PrimaryStore::open(dir.path().join("c.db"), CurationPolicy::default(), 3).await.unwrap();
        let policy = CurationPolicy::default();

        let cycle = store
            .write(|tx, now| {
                insert_samples(tx, &[100.0, 90.0], &now)?;
                run_if_ready(tx, &policy, &now)
            })
            .await
            .unwrap();
        assert!(cycle.is_none());
        assert!(store.read(history).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_consumes_batch_and_numbers_monotonically() {
        let dir = tempdir().unwrap();
        let store = PrimaryStore::open(dir.path().join("c.db"), CurationPolicy::default(), 3).await.unwrap();
        let policy = CurationPolicy::default();

        let first = store
            .write(|tx, now| {
                insert_samples(tx, &[100.0, 90.0, 80.0], &now)?;
                run_if_ready(tx, &policy, &now)
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.cycle_number, 1);
        assert_eq!(first.samples_used, 3);
        assert_eq!(first.status, CycleStatus::Completed);
        assert_eq!(first.avg_quality_before, 0.0);
        assert_eq!(first.avg_quality_after, 90.0);

        let again = store.write(|tx, now| run_if_ready(tx, &policy, &now)).await.unwrap();
        assert!(again.is_none());

        let second = store
            .write(|tx, now| {
                insert_samples(tx, &[72.0, 72.0, 72.0], &now)?;
                run_if_ready(tx, &policy, &now)
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.cycle_number, 2);
        assert_eq!(second.avg_quality_before, 90.0);
        assert_eq!(second.avg_quality_after, 81.0);
        assert_eq!(second.improvement, -9.0);

        let cycles = store.read(history).await.unwrap();
        assert_eq!(cycles.len(), 2);
        assert_eq!(cycles[0], first);
        assert_eq!(cycles[1].completed_at, Some(second.started_at));
    }

    #[tokio::test]
    async fn test_threshold_is_configurable() {
        let dir = tempdir().unwrap();
        let store = PrimaryStore::open(dir.path().join("c.db"), CurationPolicy::default(), 3).await.unwrap();
        let policy = CurationPolicy { cycle_threshold: 0, ..CurationPolicy::default() };

        let cycle = store
            .write(|tx, _| {
                let ts = now();
                insert_samples(tx, &[90.0], &ts)?;
                run_if_ready(tx, &policy, &ts)
            })
            .await
            .unwrap();
        assert_eq!(cycle.map(|c| c.samples_used), Some(1));
    }
}
