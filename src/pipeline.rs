//! Write pipelines
//!
//! One function per mutation. Each runs inside the primary store's write
//! transaction and performs every dependent step (curation, cycle emission,
//! metrics recompute) before the transaction commits. The live path and
//! backup replay both go through these functions.

use chrono::{DateTime, Utc};
use rusqlite::Transaction;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::metrics::{self, SystemMetrics};
use crate::storage::sqlite::{apply_rating, insert_itinerary, insert_trip, load_itinerary, load_trip};
use crate::training::{curator, cycle, CurationOutcome, CurationPolicy, TrainingCycle};
use crate::types::{Itinerary, Rating, Trip};

/// Everything a rating write changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingOutcome {
    pub itinerary: Itinerary,
    pub curation: CurationOutcome,
    /// Cycle emitted by this rating, if the backlog reached the threshold
    pub cycle: Option<TrainingCycle>,
    pub metrics: SystemMetrics,
}

/// Persist a trip; assigns `trip.id` unless it already carries one
pub(crate) fn trip_created(tx: &Transaction<'_>, trip: &mut Trip, now: &DateTime<Utc>) -> StoreResult<SystemMetrics> {
    trip.id = insert_trip(tx, trip)?;
    debug!("Stored trip #{} ({})", trip.id, trip.destination);
    metrics::recompute(tx, now)
}

/// Persist an itinerary for an existing trip
pub(crate) fn itinerary_created(
    tx: &Transaction<'_>,
    itinerary: &mut Itinerary,
    now: &DateTime<Utc>,
) -> StoreResult<SystemMetrics> {
    if load_trip(tx, itinerary.trip_id)?.is_none() {
        return Err(StoreError::NotFound { kind: "trip", id: itinerary.trip_id });
    }
    itinerary.id = insert_itinerary(tx, itinerary)?;
    debug!("Stored itinerary #{} for trip #{}", itinerary.id, itinerary.trip_id);
    metrics::recompute(tx, now)
}

/// Attach a rating and run curation, cycle emission and metrics.
///
/// The cycle step runs under a savepoint: if it fails, only the cycle is
/// rolled back and the rating itself still commits. The next qualifying
/// rating re-triggers it.
pub(crate) fn itinerary_rated(
    tx: &mut Transaction<'_>,
    policy: &CurationPolicy,
    itinerary_id: i64,
    rating: Rating,
    feedback: Option<&str>,
    now: &DateTime<Utc>,
) -> StoreResult<RatingOutcome> {
    let existing = load_itinerary(tx, itinerary_id)?
        .ok_or(StoreError::NotFound { kind: "itinerary", id: itinerary_id })?;
    let trip = load_trip(tx, existing.trip_id)?
        .ok_or(StoreError::NotFound { kind: "trip", id: existing.trip_id })?;

    let quality_score = policy.scorer.score(rating, feedback);
    apply_rating(tx, itinerary_id, rating, feedback, quality_score, now)?;

    let rated = Itinerary {
        rating: Some(rating),
        feedback: feedback.map(str::to_string),
        quality_score: Some(quality_score),
        rated_at: Some(*now),
        ..existing
    };

    let curation = curator::curate(tx, &policy.scorer, &trip, &rated, now)?;

    let emitted = {
        let sp = tx.savepoint()?;
        match cycle::run_if_ready(&sp, policy, now) {
            Ok(emitted) => {
                sp.commit()?;
                emitted
            }
            Err(e) => {
                // Dropping the savepoint rolls the partial cycle back
                warn!("Training cycle failed, will retry on next rating: {}", e);
                None
            }
        }
    };

    let metrics = metrics::recompute(tx, now)?;

    let itinerary = load_itinerary(tx, itinerary_id)?
        .ok_or(StoreError::NotFound { kind: "itinerary", id: itinerary_id })?;

    Ok(RatingOutcome { itinerary, curation, cycle: emitted, metrics })
}
