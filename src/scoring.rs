//! Quality scoring for rated itineraries
//!
//! Deterministic and side-effect free. The rating dominates the score: the
//! feedback bonus is smaller than one rating step, so any score at or above
//! `score(high_quality_rating, None)` implies a high-quality rating.

use serde::{Deserialize, Serialize};

use crate::types::Rating;

/// Points awarded per rating step
const POINTS_PER_STAR: f64 = 18.0;

/// Bonus for substantive feedback; must stay below `POINTS_PER_STAR`
const FEEDBACK_BONUS: f64 = 10.0;

/// Scoring parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityScorer {
    /// Minimum trimmed feedback length (characters) that earns the bonus
    pub feedback_min_chars: usize,
    /// Lowest rating that counts as high quality
    pub high_quality_rating: u8,
}

impl Default for QualityScorer {
    fn default() -> Self {
        Self {
            feedback_min_chars: 8,
            high_quality_rating: 4,
        }
    }
}

impl QualityScorer {
    /// Score a rating on the 0-100 scale
    pub fn score(&self, rating: Rating, feedback: Option<&str>) -> f64 {
        let base = rating.value() as f64 * POINTS_PER_STAR;
        base + self.feedback_bonus(feedback)
    }

    fn feedback_bonus(&self, feedback: Option<&str>) -> f64 {
        match feedback.map(str::trim) {
            Some(text) if !text.is_empty() && text.chars().count() >= self.feedback_min_chars => FEEDBACK_BONUS,
            _ => 0.0,
        }
    }

    /// Whether the rating qualifies for curation
    pub fn is_high_quality(&self, rating: Rating) -> bool {
        rating.value() >= self.high_quality_rating
    }

    /// Score below which no sample can be high quality
    pub fn high_quality_cutoff(&self) -> f64 {
        self.high_quality_rating as f64 * POINTS_PER_STAR
    }

    pub fn is_high_quality_score(&self, score: f64) -> bool {
        score >= self.high_quality_cutoff()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rating(v: i64) -> Rating {
        Rating::new(v).unwrap()
    }

    #[test]
    fn test_score_scale() {
        let scorer = QualityScorer::default();
        assert_eq!(scorer.score(rating(0), None), 0.0);
        assert_eq!(scorer.score(rating(5), None), 90.0);
        assert_eq!(scorer.score(rating(5), Some("great trip")), 100.0);
    }

    #[test]
    fn test_short_feedback_gets_no_bonus() {
        let scorer = QualityScorer::default();
        assert_eq!(scorer.score(rating(4), Some("ok")), 72.0);
        assert_eq!(scorer.score(rating(4), Some("        ")), 72.0);
    }

    #[test]
    fn test_cutoff_is_monotone_in_rating() {
        let scorer = QualityScorer::default();
        let best_low = scorer.score(rating(3), Some("a long and detailed review"));
        assert!(!scorer.is_high_quality_score(best_low));
        assert!(scorer.is_high_quality_score(scorer.score(rating(4), None)));
        assert!(scorer.is_high_quality(rating(4)));
        assert!(!scorer.is_high_quality(rating(3)));
    }
}
