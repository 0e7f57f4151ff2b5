//! Storage coordinator
//!
//! Owns both stores. Writes go to the SQLite primary first; once a write
//! commits, the same logical record is queued for the append-only backup log.
//! Backup failures never fail the caller: they are retried in the background
//! and parked for reconciliation when retries run out.

pub mod backup;
pub mod replay;
pub mod sqlite;
pub mod writer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::metrics::{self, PopularDestination, SystemMetrics};
use crate::pipeline::{self, RatingOutcome};
use crate::training::{self, curator, cycle, CurationPolicy, TrainingCycle, TrainingSample, TrainingStats};
use crate::types::{now, Itinerary, NewItinerary, NewTrip, Rating, Trip};

pub use backup::{BackupEntry, BackupLog, BackupRecord, JsonlBackupLog};
pub use replay::ReplayReport;
pub use sqlite::{ItinerarySummary, PrimaryStore};
pub use writer::{BackupHealth, BackupWriter};

/// Every record in the primary store, for export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub exported_at: DateTime<Utc>,
    pub trips: Vec<Trip>,
    pub itineraries: Vec<Itinerary>,
    pub training_samples: Vec<TrainingSample>,
    pub training_cycles: Vec<TrainingCycle>,
    pub metrics: SystemMetrics,
}

/// Dual-store persistence front door
pub struct StorageCoordinator {
    primary: Arc<PrimaryStore>,
    backup_log: Arc<dyn BackupLog>,
    writer: BackupWriter,
}

impl StorageCoordinator {
    /// Open both stores from configuration
    pub async fn open(config: &Config) -> StoreResult<Self> {
        let log = Arc::new(JsonlBackupLog::open(&config.storage.backup_dir)?);
        Self::open_with_log(config, log).await
    }

    /// Open with a caller-supplied backup log
    pub async fn open_with_log(config: &Config, backup_log: Arc<dyn BackupLog>) -> StoreResult<Self> {
        let policy = CurationPolicy::from(&config.curation);
        let primary = Arc::new(
            PrimaryStore::open(&config.storage.database_path, policy, config.recovery.busy_retries).await?,
        );
        let writer = BackupWriter::spawn(backup_log.clone(), primary.clone(), config.backup.clone());

        let coordinator = Self { primary, backup_log, writer };

        if config.recovery.replay_on_startup {
            let report = coordinator.recover().await?;
            if report.orphaned > 0 {
                warn!("Startup replay left {} orphaned backup entries", report.orphaned);
            }
        }

        Ok(coordinator)
    }

    pub fn policy(&self) -> &CurationPolicy {
        self.primary.policy()
    }

    /// Validate and persist a trip
    pub async fn create_trip(&self, request: &NewTrip) -> StoreResult<Trip> {
        let draft = request.validate(now())?;

        let trip = self
            .primary
            .write(|tx, now| {
                let mut trip = Trip { created_at: now, ..draft.clone() };
                pipeline::trip_created(tx, &mut trip, &now)?;
                Ok(trip)
            })
            .await?;

        info!("Created trip #{} to {}", trip.id, trip.destination);
        self.writer
            .enqueue(BackupEntry::new(BackupRecord::Trip { trip: trip.clone() }, trip.created_at))
            .await;
        Ok(trip)
    }

    /// Persist a generated itinerary for an existing trip
    pub async fn create_itinerary(&self, request: NewItinerary) -> StoreResult<Itinerary> {
        let itinerary = self
            .primary
            .write(|tx, now| {
                let mut itinerary = request.clone().into_record(now);
                pipeline::itinerary_created(tx, &mut itinerary, &now)?;
                Ok(itinerary)
            })
            .await?;

        info!(
            "Created itinerary #{} for trip #{} ({} words)",
            itinerary.id, itinerary.trip_id, itinerary.word_count
        );
        self.writer
            .enqueue(BackupEntry::new(
                BackupRecord::Itinerary { itinerary: itinerary.clone() },
                itinerary.created_at,
            ))
            .await;
        Ok(itinerary)
    }

    /// Rate an itinerary and run curation, cycle emission and metrics.
    ///
    /// Out-of-range ratings are rejected before anything is written. Blank
    /// feedback is stored as no feedback.
    pub async fn rate_itinerary(
        &self,
        itinerary_id: i64,
        rating: i64,
        feedback: Option<&str>,
    ) -> StoreResult<RatingOutcome> {
        let rating = Rating::new(rating)?;
        let feedback = feedback.map(str::trim).filter(|text| !text.is_empty());
        let policy = *self.primary.policy();

        let outcome = self
            .primary
            .write(|tx, now| pipeline::itinerary_rated(tx, &policy, itinerary_id, rating, feedback, &now))
            .await?;

        info!(
            "Rated itinerary #{} {} (quality {:.0})",
            itinerary_id,
            rating,
            outcome.itinerary.quality_score.unwrap_or_default()
        );

        if let Some(rated_at) = outcome.itinerary.rated_at {
            let record = BackupRecord::Rating {
                itinerary_id,
                rating,
                feedback: feedback.map(str::to_string),
            };
            self.writer.enqueue(BackupEntry::new(record, rated_at)).await;
        }
        Ok(outcome)
    }

    /// Replay the backup log into the primary store
    pub async fn recover(&self) -> StoreResult<ReplayReport> {
        let log = self.backup_log.clone();
        let entries = tokio::task::spawn_blocking(move || log.read_all())
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e.to_string())))??;
        replay::replay(&self.primary, entries).await
    }

    /// Re-append parked entries to the backup log, oldest first.
    ///
    /// Returns how many entries were reconciled. Stops at the first entry that
    /// still cannot be appended; it stays parked.
    pub async fn reconcile_backup(&self) -> StoreResult<usize> {
        self.writer.flush().await?;

        let mut reconciled = 0;
        for entry in self.primary.outbox_entries().await? {
            let log = self.backup_log.clone();
            let pending = entry.clone();
            tokio::task::spawn_blocking(move || log.append(&pending))
                .await
                .map_err(|e| StoreError::Io(std::io::Error::other(e.to_string())))??;
            self.primary.remove_from_outbox(&entry).await?;
            reconciled += 1;
        }

        if reconciled > 0 {
            info!("Reconciled {} parked backup entries", reconciled);
        }
        Ok(reconciled)
    }

    /// Wait for queued backup writes to finish
    pub async fn flush_backups(&self) -> StoreResult<()> {
        self.writer.flush().await
    }

    pub async fn backup_health(&self) -> StoreResult<BackupHealth> {
        self.writer.health().await
    }

    // Read accessors

    pub async fn trip(&self, id: i64) -> StoreResult<Option<Trip>> {
        self.primary.trip(id).await
    }

    pub async fn itinerary(&self, id: i64) -> StoreResult<Option<Itinerary>> {
        self.primary.itinerary(id).await
    }

    /// The cached metrics row
    pub async fn system_metrics(&self) -> StoreResult<SystemMetrics> {
        self.primary.read(metrics::load).await
    }

    /// Metrics derived from the tables right now, bypassing the cached row
    pub async fn rescan_metrics(&self) -> StoreResult<SystemMetrics> {
        self.primary.read(metrics::scan).await
    }

    pub async fn cycle_history(&self) -> StoreResult<Vec<TrainingCycle>> {
        self.primary.read(cycle::history).await
    }

    pub async fn popular_destinations(&self, limit: usize) -> StoreResult<Vec<PopularDestination>> {
        self.primary.read(|conn| metrics::popular_destinations(conn, limit)).await
    }

    pub async fn rating_distribution(&self) -> StoreResult<BTreeMap<u8, u64>> {
        self.primary.read(metrics::rating_distribution).await
    }

    pub async fn recent_itineraries(&self, limit: usize) -> StoreResult<Vec<ItinerarySummary>> {
        self.primary.recent_itineraries(limit).await
    }

    pub async fn search_destination(&self, query: &str, limit: usize) -> StoreResult<Vec<ItinerarySummary>> {
        self.primary.search_destination(query, limit).await
    }

    pub async fn high_rated_itineraries(&self, limit: usize) -> StoreResult<Vec<ItinerarySummary>> {
        self.primary.high_rated_itineraries(limit).await
    }

    pub async fn training_samples(&self, limit: usize) -> StoreResult<Vec<TrainingSample>> {
        self.primary.read(|conn| curator::list_samples(conn, limit)).await
    }

    pub async fn training_statistics(&self) -> StoreResult<TrainingStats> {
        let policy = *self.primary.policy();
        self.primary.read(|conn| training::training_stats(conn, &policy)).await
    }

    /// Everything in the primary store as one value
    pub async fn export_snapshot(&self) -> StoreResult<Snapshot> {
        let trips = self.primary.all_trips().await?;
        let itineraries = self.primary.all_itineraries().await?;
        let (training_samples, training_cycles, metrics) = self
            .primary
            .read(|conn| Ok((curator::all_samples(conn)?, cycle::history(conn)?, metrics::load(conn)?)))
            .await?;

        Ok(Snapshot {
            exported_at: now(),
            trips,
            itineraries,
            training_samples,
            training_cycles,
            metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::types::BudgetTier;
    use crate::storage::backup::MockBackupLog;
    use tempfile::tempdir;

    fn quiet_log() -> MockBackupLog {
        let mut log = MockBackupLog::new();
        log.expect_read_all().returning(|| Ok(Vec::new()));
        log
    }

    #[tokio::test]
    async fn test_each_write_is_mirrored_in_order() {
        let dir = tempdir().unwrap();
        let mut log = quiet_log();
        let mut seq = mockall::Sequence::new();
        for kind in ["trip", "itinerary", "rating"] {
            log.expect_append()
                .withf(move |entry| entry.record.kind() == kind)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
        }

        let coordinator = StorageCoordinator::open_with_log(&Config::in_dir(dir.path()), Arc::new(log))
            .await
            .unwrap();
        let trip = coordinator
            .create_trip(&NewTrip::new("Tokyo, Japan", &["culture", "food"], 7, BudgetTier::Moderate))
            .await
            .unwrap();
        let itinerary = coordinator
            .create_itinerary(NewItinerary::from_text(trip.id, "Day 1: Asakusa", "m", 800))
            .await
            .unwrap();
        coordinator.rate_itinerary(itinerary.id, 5, Some("  great trip ")).await.unwrap();
        coordinator.flush_backups().await.unwrap();

        let health = coordinator.backup_health().await.unwrap();
        assert_eq!(health.appended, 3);
        assert_eq!(health.outbox_len, 0);

        let stored = coordinator.itinerary(itinerary.id).await.unwrap().unwrap();
        assert_eq!(stored.feedback.as_deref(), Some("great trip"));
    }

    #[tokio::test]
    async fn test_invalid_rating_writes_nothing() {
        let dir = tempdir().unwrap();
        let mut log = quiet_log();
        log.expect_append().times(2).returning(|_| Ok(()));

        let coordinator = StorageCoordinator::open_with_log(&Config::in_dir(dir.path()), Arc::new(log))
            .await
            .unwrap();
        let trip = coordinator
            .create_trip(&NewTrip::new("Rome", &["history"], 3, BudgetTier::Budget))
            .await
            .unwrap();
        let itinerary = coordinator
            .create_itinerary(NewItinerary::from_text(trip.id, "Day 1: Forum", "m", 10))
            .await
            .unwrap();
        let before = coordinator.system_metrics().await.unwrap();

        for bad in [-1, 6] {
            let err = coordinator.rate_itinerary(itinerary.id, bad, None).await.unwrap_err();
            assert!(matches!(err, StoreError::Validation(ValidationError::RatingOutOfRange(_))));
        }
        coordinator.flush_backups().await.unwrap();

        assert_eq!(coordinator.system_metrics().await.unwrap(), before);
        assert!(coordinator.training_samples(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_itinerary_is_not_found() {
        let dir = tempdir().unwrap();
        let coordinator = StorageCoordinator::open_with_log(&Config::in_dir(dir.path()), Arc::new(quiet_log()))
            .await
            .unwrap();

        let err = coordinator.rate_itinerary(404, 4, None).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "itinerary", id: 404 }));
    }

    #[tokio::test]
    async fn test_backup_failure_does_not_fail_caller() {
        let dir = tempdir().unwrap();
        let mut log = quiet_log();
        log.expect_append()
            .returning(|_| Err(StoreError::Io(std::io::Error::other("backup volume offline"))));

        let mut config = Config::in_dir(dir.path());
        config.backup.max_attempts = 2;
        config.backup.base_backoff_ms = 1;

        let coordinator = StorageCoordinator::open_with_log(&config, Arc::new(log)).await.unwrap();
        let trip = coordinator
            .create_trip(&NewTrip::new("Quito", &["hiking"], 5, BudgetTier::Luxury))
            .await
            .unwrap();
        coordinator.flush_backups().await.unwrap();

        assert_eq!(coordinator.trip(trip.id).await.unwrap(), Some(trip));
        let health = coordinator.backup_health().await.unwrap();
        assert_eq!(health.degraded, 1);
        assert!(health.is_degraded());
    }
}
