//! Backup replay
//!
//! Rebuilds primary state from the backup log. Each entry goes through the
//! same write pipeline as the live path, stamped with its original write
//! time, so derived samples, cycles and metrics come out identical. Entries
//! already reflected in the primary store are skipped, which makes replay
//! safe to run on every startup.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StoreResult;
use crate::pipeline;
use crate::types::Rating;

use super::backup::{BackupEntry, BackupRecord};
use super::sqlite::{load_itinerary, load_trip, PrimaryStore};

/// What a replay did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub applied: usize,
    /// Already present in the primary store
    pub skipped: usize,
    /// Referenced a trip or itinerary missing from both stores
    pub orphaned: usize,
}

impl ReplayReport {
    pub fn total(&self) -> usize {
        self.applied + self.skipped + self.orphaned
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Yes,
    AlreadyPresent,
    Orphaned,
}

/// Replay entries in write order
pub async fn replay(primary: &PrimaryStore, mut entries: Vec<BackupEntry>) -> StoreResult<ReplayReport> {
    // Reconciled outbox entries are appended late, so file order is not write order
    entries.sort_by_key(|entry| entry.written_at);

    let mut report = ReplayReport::default();
    for entry in &entries {
        match apply(primary, entry).await? {
            Applied::Yes => report.applied += 1,
            Applied::AlreadyPresent => report.skipped += 1,
            Applied::Orphaned => {
                warn!(
                    "Backup {} entry for #{} references a missing record, skipping",
                    entry.record.kind(),
                    entry.record.logical_id()
                );
                report.orphaned += 1;
            }
        }
    }

    if report.applied > 0 {
        info!(
            "Replayed backup log: {} applied, {} already present, {} orphaned",
            report.applied, report.skipped, report.orphaned
        );
    } else {
        debug!("Backup replay found nothing to apply ({} entries)", report.total());
    }
    Ok(report)
}

async fn apply(primary: &PrimaryStore, entry: &BackupEntry) -> StoreResult<Applied> {
    match &entry.record {
        BackupRecord::Trip { trip } => {
            primary
                .write_at(entry.written_at, |tx, now| {
                    if load_trip(tx, trip.id)?.is_some() {
                        return Ok(Applied::AlreadyPresent);
                    }
                    let mut trip = trip.clone();
                    pipeline::trip_created(tx, &mut trip, &now)?;
                    Ok(Applied::Yes)
                })
                .await
        }
        BackupRecord::Itinerary { itinerary } => {
            primary
                .write_at(entry.written_at, |tx, now| {
                    if load_itinerary(tx, itinerary.id)?.is_some() {
                        return Ok(Applied::AlreadyPresent);
                    }
                    if load_trip(tx, itinerary.trip_id)?.is_none() {
                        return Ok(Applied::Orphaned);
                    }
                    let mut itinerary = itinerary.clone();
                    pipeline::itinerary_created(tx, &mut itinerary, &now)?;
                    Ok(Applied::Yes)
                })
                .await
        }
        BackupRecord::Rating { itinerary_id, rating, feedback } => {
            let policy = *primary.policy();
            let rating: Rating = *rating;
            primary
                .write_at(entry.written_at, |tx, now| {
                    let current = match load_itinerary(tx, *itinerary_id)? {
                        Some(current) => current,
                        None => return Ok(Applied::Orphaned),
                    };
                    if current.rated_at.is_some_and(|rated_at| rated_at >= now) {
                        return Ok(Applied::AlreadyPresent);
                    }
                    pipeline::itinerary_rated(tx, &policy, *itinerary_id, rating, feedback.as_deref(), &now)?;
                    Ok(Applied::Yes)
                })
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::CurationPolicy;
    use crate::types::{now, BudgetTier, NewItinerary, NewTrip};
    use tempfile::tempdir;

    fn history() -> Vec<BackupEntry> {
        let t0 = now();
        let mut trip = NewTrip::new("Seoul", &["food"], 4, BudgetTier::Moderate)
            .validate(t0)
            .unwrap();
        trip.id = 1;
        let mut itinerary = NewItinerary::from_text(1, "Day 1: markets", "m", 50)
            .into_record(t0 + chrono::Duration::milliseconds(1));
        itinerary.id = 1;
        let rated_at = t0 + chrono::Duration::milliseconds(2);

        vec![
            BackupEntry::new(
                BackupRecord::Rating { itinerary_id: 1, rating: Rating::new(5).unwrap(), feedback: None },
                rated_at,
            ),
            BackupEntry::new(BackupRecord::Itinerary { itinerary: itinerary.clone() }, itinerary.created_at),
            BackupEntry::new(BackupRecord::Trip { trip: trip.clone() }, trip.created_at),
        ]
    }

    #[tokio::test]
    async fn test_replay_is_ordered_and_idempotent() {
        let dir = tempdir().unwrap();
        let store = PrimaryStore::open(dir.path().join("r.db"), CurationPolicy::default(), 3).await.unwrap();

        let entries = history();
        let first = replay(&store, entries.clone()).await.unwrap();
        assert_eq!(first, ReplayReport { applied: 3, skipped: 0, orphaned: 0 });

        let itinerary = store.itinerary(1).await.unwrap().unwrap();
        assert_eq!(itinerary.rating, Rating::new(5).ok());
        assert!(itinerary.training_sample_id.is_some());

        let second = replay(&store, entries).await.unwrap();
        assert_eq!(second, ReplayReport { applied: 0, skipped: 3, orphaned: 0 });
    }

    #[tokio::test]
    async fn test_orphans_are_counted() {
        let dir = tempdir().unwrap();
        let store = PrimaryStore::open(dir.path().join("r.db"), CurationPolicy::default(), 3).await.unwrap();

        let mut entries = history();
        entries.retain(|e| !matches!(e.record, BackupRecord::Trip { .. }));
        let report = replay(&store, entries).await.unwrap();
        assert_eq!(report, ReplayReport { applied: 0, skipped: 0, orphaned: 2 });
        assert!(store.all_itineraries().await.unwrap().is_empty());
    }
}
