//! Metrics aggregator
//!
//! Keeps the single `system_metrics` row in step with the authoritative
//! tables. Every recompute is a full re-scan inside the triggering write's
//! transaction; the row is never incremented in place, so it cannot drift.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::StoreResult;
use crate::storage::sqlite::opt_time_column;
use crate::training::CurationPolicy;
use crate::types::to_db_time;

/// Cached aggregate over every trip, itinerary, sample and cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub total_trips: u64,
    pub total_itineraries: u64,
    pub total_ratings: u64,
    pub avg_rating: f64,
    pub avg_quality_score: f64,
    pub unconsumed_high_quality_samples: u64,
    pub total_training_samples: u64,
    pub training_cycles_completed: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    /// Write that last recomputed the row; `None` for a fresh scan
    pub updated_at: Option<DateTime<Utc>>,
}

impl SystemMetrics {
    /// Same aggregate, ignoring when it was computed
    pub fn same_counts(&self, other: &SystemMetrics) -> bool {
        SystemMetrics { updated_at: None, ..self.clone() } == SystemMetrics { updated_at: None, ..other.clone() }
    }
}

/// Destination rollup for operational inspection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopularDestination {
    pub destination: String,
    pub trip_count: u64,
    /// Average rating over rated itineraries of these trips
    pub avg_rating: Option<f64>,
}

/// Derive the aggregate from the authoritative tables
pub fn scan(conn: &Connection) -> StoreResult<SystemMetrics> {
    let total_trips: i64 = conn.query_row("SELECT COUNT(*) FROM trips", [], |row| row.get(0))?;

    let (total_itineraries, total_ratings, avg_rating, avg_quality_score): (i64, i64, f64, f64) = conn.query_row(
        r#"SELECT COUNT(*),
                  COUNT(rating),
                  COALESCE(AVG(rating), 0.0),
                  COALESCE(AVG(quality_score), 0.0)
           FROM itineraries"#,
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
    )?;

    let (total_training_samples, unconsumed): (i64, i64) = conn.query_row(
        r#"SELECT COUNT(*),
                  COALESCE(SUM(CASE WHEN high_quality = 1 AND consumed = 0 THEN 1 ELSE 0 END), 0)
           FROM training_samples"#,
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let (cycles_completed, last_cycle_at) = conn.query_row(
        "SELECT COUNT(*), MAX(completed_at) FROM training_cycles WHERE status = 'completed'",
        [],
        |row| Ok((row.get::<_, i64>(0)?, opt_time_column(row, 1)?)),
    )?;

    Ok(SystemMetrics {
        total_trips: total_trips as u64,
        total_itineraries: total_itineraries as u64,
        total_ratings: total_ratings as u64,
        avg_rating,
        avg_quality_score,
        unconsumed_high_quality_samples: unconsumed as u64,
        total_training_samples: total_training_samples as u64,
        training_cycles_completed: cycles_completed as u64,
        last_cycle_at,
        updated_at: None,
    })
}

/// Re-scan and replace the cached row, stamped with the write time
pub(crate) fn recompute(conn: &Connection, now: &DateTime<Utc>) -> StoreResult<SystemMetrics> {
    let mut metrics = scan(conn)?;
    metrics.updated_at = Some(*now);

    conn.execute(
        r#"INSERT INTO system_metrics
           (id, total_trips, total_itineraries, total_ratings, avg_rating, avg_quality_score,
            unconsumed_high_quality_samples, total_training_samples, training_cycles_completed,
            last_cycle_at, updated_at)
           VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
           ON CONFLICT(id) DO UPDATE SET
               total_trips = excluded.total_trips,
               total_itineraries = excluded.total_itineraries,
               total_ratings = excluded.total_ratings,
               avg_rating = excluded.avg_rating,
               avg_quality_score = excluded.avg_quality_score,
               unconsumed_high_quality_samples = excluded.unconsumed_high_quality_samples,
               total_training_samples = excluded.total_training_samples,
               training_cycles_completed = excluded.training_cycles_completed,
               last_cycle_at = excluded.last_cycle_at,
               updated_at = excluded.updated_at"#,
        params![
            metrics.total_trips as i64,
            metrics.total_itineraries as i64,
            metrics.total_ratings as i64,
            metrics.avg_rating,
            metrics.avg_quality_score,
            metrics.unconsumed_high_quality_samples as i64,
            metrics.total_training_samples as i64,
            metrics.training_cycles_completed as i64,
            metrics.last_cycle_at.as_ref().map(to_db_time),
            to_db_time(now),
        ],
    )?;

    debug!(
        "Metrics recomputed: {} trips, {} itineraries, {} ratings",
        metrics.total_trips, metrics.total_itineraries, metrics.total_ratings
    );
    Ok(metrics)
}

fn metrics_from_row(row: &Row<'_>) -> rusqlite::Result<SystemMetrics> {
    Ok(SystemMetrics {
        total_trips: row.get::<_, i64>(0)? as u64,
        total_itineraries: row.get::<_, i64>(1)? as u64,
        total_ratings: row.get::<_, i64>(2)? as u64,
        avg_rating: row.get(3)?,
        avg_quality_score: row.get(4)?,
        unconsumed_high_quality_samples: row.get::<_, i64>(5)? as u64,
        total_training_samples: row.get::<_, i64>(6)? as u64,
        training_cycles_completed: row.get::<_, i64>(7)? as u64,
        last_cycle_at: opt_time_column(row, 8)?,
        updated_at: opt_time_column(row, 9)?,
    })
}

/// The cached row; an empty store reports zeroes
pub fn load(conn: &Connection) -> StoreResult<SystemMetrics> {
    let cached = conn
        .query_row(
            r#"SELECT total_trips, total_itineraries, total_ratings, avg_rating, avg_quality_score,
                      unconsumed_high_quality_samples, total_training_samples,
                      training_cycles_completed, last_cycle_at, updated_at
               FROM system_metrics WHERE id = 1"#,
            [],
            metrics_from_row,
        )
        .optional()?;
    Ok(cached.unwrap_or_default())
}

/// Destinations by trip count, case-insensitively grouped
pub fn popular_destinations(conn: &Connection, limit: usize) -> StoreResult<Vec<PopularDestination>> {
    let mut stmt = conn.prepare_cached(
        r#"SELECT MIN(t.destination), COUNT(DISTINCT t.id), AVG(i.rating)
           FROM trips t
           LEFT JOIN itineraries i ON i.trip_id = t.id
           GROUP BY t.destination COLLATE NOCASE
           ORDER BY COUNT(DISTINCT t.id) DESC, MIN(t.destination)
           LIMIT ?1"#,
    )?;
    let rows = stmt
        .query_map(params![limit], |row| {
            Ok(PopularDestination {
                destination: row.get(0)?,
                trip_count: row.get::<_, i64>(1)? as u64,
                avg_rating: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Number of rated itineraries per rating value
pub fn rating_distribution(conn: &Connection) -> StoreResult<BTreeMap<u8, u64>> {
    let mut stmt = conn.prepare_cached(
        "SELECT rating, COUNT(*) FROM itineraries WHERE rating IS NOT NULL GROUP BY rating",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, u8>(0)?, row.get::<_, i64>(1)? as u64)))?
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(rows)
}

/// Unconsumed backlog relative to the cycle threshold, for reporting
pub fn cycle_readiness(metrics: &SystemMetrics, policy: &CurationPolicy) -> f64 {
    let threshold = policy.cycle_threshold.max(1) as f64;
    (metrics.unconsumed_high_quality_samples as f64 / threshold).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::{apply_rating, insert_itinerary, insert_trip, PrimaryStore};
    use crate::types::{now, BudgetTier, NewItinerary, NewTrip, Rating};
    use tempfile::tempdir;

    fn add_trip(conn: &Connection, destination: &str, rating: Option<i64>) -> StoreResult<()> {
        let trip = NewTrip::new(destination, &["food"], 3, BudgetTier::Budget).validate(now())?;
        let trip_id = insert_trip(conn, &trip)?;
        let itinerary = NewItinerary::from_text(trip_id, "Day 1", "m", 5).into_record(now());
        let itinerary_id = insert_itinerary(conn, &itinerary)?;
        if let Some(r) = rating {
            let rating = Rating::new(r)?;
            apply_rating(conn, itinerary_id, rating, None, r as f64 * 18.0, &now())?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_store_reports_zeroes() {
        let dir = tempdir().unwrap();
        let store = PrimaryStore::open(dir.path().join("m.db"), CurationPolicy::default(), 3).await.unwrap();

        let cached = store.read(load).await.unwrap();
        assert_eq!(cached, SystemMetrics::default());
        assert!(cached.same_counts(&store.read(scan).await.unwrap()));
    }

    #[tokio::test]
    async fn test_recompute_matches_scan() {
        let dir = tempdir().unwrap();
        let store = PrimaryStore::open(dir.path().join("m.db"), CurationPolicy::default(), 3).await.unwrap();

        let written = store
            .write(|tx, now| {
                add_trip(tx, "Paris", Some(5))?;
                add_trip(tx, "paris", Some(3))?;
                add_trip(tx, "Berlin", None)?;
                recompute(tx, &now)
            })
            .await
            .unwrap();

        assert_eq!(written.total_trips, 3);
        assert_eq!(written.total_itineraries, 3);
        assert_eq!(written.total_ratings, 2);
        assert_eq!(written.avg_rating, 4.0);
        assert_eq!(written.avg_quality_score, 72.0);
        assert!(written.updated_at.is_some());

        let cached = store.read(load).await.unwrap();
        assert_eq!(cached, written);
        assert!(cached.same_counts(&store.read(scan).await.unwrap()));
    }

    #[tokio::test]
    async fn test_popular_destinations_and_distribution() {
        let dir = tempdir().unwrap();
        let store = PrimaryStore::open(dir.path().join("m.db"), CurationPolicy::default(), 3).await.unwrap();

        store
            .write(|tx, _| {
                add_trip(tx, "Paris", Some(5))?;
                add_trip(tx, "paris", Some(3))?;
                add_trip(tx, "Berlin", None)
            })
            .await
            .unwrap();

        let popular = store.read(|conn| popular_destinations(conn, 10)).await.unwrap();
        assert_eq!(popular.len(), 2);
        assert_eq!(popular[0].trip_count, 2);
        assert_eq!(popular[0].avg_rating, Some(4.0));
        assert_eq!(popular[1].destination, "Berlin");
        assert_eq!(popular[1].avg_rating, None);

        let distribution = store.read(rating_distribution).await.unwrap();
        assert_eq!(distribution.get(&5), Some(&1));
        assert_eq!(distribution.get(&3), Some(&1));
        assert_eq!(distribution.get(&4), None);
    }

    #[test]
    fn test_cycle_readiness() {
        let policy = CurationPolicy::default();
        let metrics = SystemMetrics { unconsumed_high_quality_samples: 2, ..Default::default() };
        assert!((cycle_readiness(&metrics, &policy) - 2.0 / 3.0).abs() < f64::EPSILON);
    }
}
