//! Training curator - promotes highly rated itineraries to training samples
//!
//! The first sample for a trip shape wins. Later ratings of the same shape are
//! skipped, never merged into the existing sample.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::error::StoreResult;
use crate::scoring::QualityScorer;
use crate::storage::sqlite::{json_column, link_sample, time_column};
use crate::types::{to_db_time, Itinerary, Trip};

use super::fingerprint::trip_fingerprint;

/// What curation did with a rating
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CurationOutcome {
    /// Rating below the high-quality threshold
    NotEligible,
    /// A new sample was stored and linked to the itinerary
    Created { sample_id: i64, fingerprint: String },
    /// A sample with the same fingerprint already exists
    Duplicate { fingerprint: String, existing_sample_id: i64 },
}

impl CurationOutcome {
    pub fn sample_id(&self) -> Option<i64> {
        match self {
            CurationOutcome::Created { sample_id, .. } => Some(*sample_id),
            _ => None,
        }
    }
}

/// A curated training sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSample {
    pub id: i64,
    pub fingerprint: String,
    pub itinerary_id: i64,
    /// Trip parameters that produced the itinerary
    pub input_params: serde_json::Value,
    /// Itinerary text together with the rating and feedback it received
    pub output: serde_json::Value,
    pub quality_score: f64,
    pub high_quality: bool,
    pub consumed: bool,
    pub consumed_by_cycle: Option<i64>,
    pub created_at: DateTime<Utc>,
}

const SAMPLE_COLUMNS: &str = "id, fingerprint, itinerary_id, input_params, output, quality_score, \
     high_quality, consumed, consumed_by_cycle, created_at";

fn sample_from_row(row: &Row<'_>) -> rusqlite::Result<TrainingSample> {
    Ok(TrainingSample {
        id: row.get(0)?,
        fingerprint: row.get(1)?,
        itinerary_id: row.get(2)?,
        input_params: json_column(row, 3)?,
        output: json_column(row, 4)?,
        quality_score: row.get(5)?,
        high_quality: row.get(6)?,
        consumed: row.get(7)?,
        consumed_by_cycle: row.get(8)?,
        created_at: time_column(row, 9)?,
    })
}

/// Curate a freshly rated itinerary inside the rating transaction
pub(crate) fn curate(
    conn: &Connection,
    scorer: &QualityScorer,
    trip: &Trip,
    itinerary: &Itinerary,
    now: &DateTime<Utc>,
) -> StoreResult<CurationOutcome> {
    let rating = match itinerary.rating {
        Some(rating) if scorer.is_high_quality(rating) => rating,
        _ => {
            debug!("Itinerary #{} not eligible for curation", itinerary.id);
            return Ok(CurationOutcome::NotEligible);
        }
    };
    let feedback = itinerary.feedback.as_deref();
    let quality_score = itinerary
        .quality_score
        .unwrap_or_else(|| scorer.score(rating, feedback));

    let fingerprint = trip_fingerprint(trip);
    let input_params = json!({
        "destination": trip.destination,
        "interests": trip.interests,
        "duration_days": trip.duration_days,
        "budget": trip.budget,
        "travel_style": trip.travel_style,
        "include_food": trip.include_food,
        "include_transport": trip.include_transport,
    });
    let output = json!({
        "itinerary_text": itinerary.content,
        "rating": rating.value(),
        "feedback": feedback,
    });

    let inserted = conn.execute(
        r#"INSERT INTO training_samples
           (fingerprint, itinerary_id, input_params, output, quality_score, high_quality, consumed, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)
           ON CONFLICT(fingerprint) DO NOTHING"#,
        params![
            fingerprint,
            itinerary.id,
            input_params.to_string(),
            output.to_string(),
            quality_score,
            scorer.is_high_quality_score(quality_score),
            to_db_time(now),
        ],
    )?;

    if inserted == 0 {
        let existing_sample_id: i64 = conn.query_row(
            "SELECT id FROM training_samples WHERE fingerprint = ?1",
            params![fingerprint],
            |row| row.get(0),
        )?;
        info!(
            "Skipping duplicate training sample for itinerary #{} (fingerprint {} already held by sample #{})",
            itinerary.id, &fingerprint[..12], existing_sample_id
        );
        return Ok(CurationOutcome::Duplicate { fingerprint, existing_sample_id });
    }

    let sample_id = conn.last_insert_rowid();
    link_sample(conn, itinerary.id, sample_id)?;
    info!("Curated training sample #{} from itinerary #{} ({})", sample_id, itinerary.id, trip.destination);

    Ok(CurationOutcome::Created { sample_id, fingerprint })
}

pub(crate) fn load_sample(conn: &Connection, id: i64) -> StoreResult<Option<TrainingSample>> {
    let sql = format!("SELECT {} FROM training_samples WHERE id = ?1", SAMPLE_COLUMNS);
    let mut stmt = conn.prepare_cached(&sql)?;
    Ok(stmt.query_row(params![id], sample_from_row).optional()?)
}

/// Newest samples first
pub(crate) fn list_samples(conn: &Connection, limit: usize) -> StoreResult<Vec<TrainingSample>> {
    let sql = format!(
        "SELECT {} FROM training_samples ORDER BY created_at DESC, id DESC LIMIT ?1",
        SAMPLE_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let samples = stmt.query_map(params![limit], sample_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(samples)
}

/// Every sample in creation order
pub(crate) fn all_samples(conn: &Connection) -> StoreResult<Vec<TrainingSample>> {
    let sql = format!("SELECT {} FROM training_samples ORDER BY id", SAMPLE_COLUMNS);
    let mut stmt = conn.prepare_cached(&sql)?;
    let samples = stmt.query_map([], sample_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(samples)
}
