//! Self-curating training corpus
//!
//! Highly rated itineraries are promoted into deduplicated training samples;
//! once enough unconsumed samples accumulate they are summarised into a
//! training cycle. No model is ever trained here, only data is curated.

pub mod curator;
pub mod cycle;
pub mod fingerprint;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::config::CurationConfig;
use crate::error::StoreResult;
use crate::scoring::QualityScorer;

pub use curator::{CurationOutcome, TrainingSample};
pub use cycle::{CycleStatus, TrainingCycle};
pub use fingerprint::{fingerprint, trip_fingerprint};

/// Thresholds that drive curation and cycle emission
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurationPolicy {
    pub scorer: QualityScorer,
    /// Unconsumed high-quality samples needed before a cycle fires
    pub cycle_threshold: u32,
}

impl Default for CurationPolicy {
    fn default() -> Self {
        Self::from(&CurationConfig::default())
    }
}

impl From<&CurationConfig> for CurationPolicy {
    fn from(config: &CurationConfig) -> Self {
        Self {
            scorer: config.scorer(),
            cycle_threshold: config.cycle_threshold.max(1),
        }
    }
}

/// Corpus-level training statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingStats {
    pub total_samples: u64,
    pub high_quality_samples: u64,
    pub unconsumed_high_quality: u64,
    pub avg_quality_score: f64,
    /// High-quality samples still needed before the next cycle fires
    pub samples_until_next_cycle: u64,
}

impl TrainingStats {
    pub fn ready_for_cycle(&self) -> bool {
        self.samples_until_next_cycle == 0
    }
}

pub(crate) fn training_stats(conn: &Connection, policy: &CurationPolicy) -> StoreResult<TrainingStats> {
    let (total, high_quality, unconsumed, avg): (i64, i64, i64, f64) = conn.query_row(
        r#"SELECT COUNT(*),
                  COALESCE(SUM(high_quality), 0),
                  COALESCE(SUM(CASE WHEN high_quality = 1 AND consumed = 0 THEN 1 ELSE 0 END), 0),
                  COALESCE(AVG(quality_score), 0.0)
           FROM training_samples"#,
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
    )?;

    let unconsumed = unconsumed as u64;
    Ok(TrainingStats {
        total_samples: total as u64,
        high_quality_samples: high_quality as u64,
        unconsumed_high_quality: unconsumed,
        avg_quality_score: avg,
        samples_until_next_cycle: (policy.cycle_threshold as u64).saturating_sub(unconsumed),
    })
}
