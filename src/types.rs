//! Shared record types
//!
//! Trips and itineraries as they are persisted in both stores. Timestamps are
//! truncated to microseconds so they survive SQLite text columns and JSON
//! backup entries without drift.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

use crate::error::ValidationError;

/// Current time at the precision both stores can represent
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Render a timestamp the way the primary store keeps it
pub fn to_db_time(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp stored by [`to_db_time`]
pub fn from_db_time(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|d| d.with_timezone(&Utc))
}

/// Budget tier of a trip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BudgetTier {
    Budget,
    Moderate,
    Luxury,
}

impl BudgetTier {
    pub fn as_str(self) -> &'static str {
        match self {
            BudgetTier::Budget => "Budget",
            BudgetTier::Moderate => "Moderate",
            BudgetTier::Luxury => "Luxury",
        }
    }
}

impl std::fmt::Display for BudgetTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BudgetTier {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "budget" => Ok(BudgetTier::Budget),
            "moderate" => Ok(BudgetTier::Moderate),
            "luxury" => Ok(BudgetTier::Luxury),
            _ => Err(ValidationError::UnknownBudgetTier(s.to_string())),
        }
    }
}

/// A user rating on the 0-5 scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct Rating(u8);

impl Rating {
    pub const MAX: u8 = 5;

    pub fn new(value: i64) -> Result<Self, ValidationError> {
        if (0..=Self::MAX as i64).contains(&value) {
            Ok(Rating(value as u8))
        } else {
            Err(ValidationError::RatingOutOfRange(value))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Rating {
    type Error = ValidationError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Rating::new(value)
    }
}

impl From<Rating> for u8 {
    fn from(rating: Rating) -> u8 {
        rating.0
    }
}

impl std::fmt::Display for Rating {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/5", self.0)
    }
}

/// Trip request as supplied by the planner surface
#[derive(Debug, Clone)]
pub struct NewTrip {
    pub destination: String,
    pub interests: Vec<String>,
    pub duration_days: i64,
    pub budget: BudgetTier,
    pub travel_style: Vec<String>,
    pub include_food: bool,
    pub include_transport: bool,
}

impl NewTrip {
    pub fn new(destination: impl Into<String>, interests: &[&str], duration_days: i64, budget: BudgetTier) -> Self {
        Self {
            destination: destination.into(),
            interests: interests.iter().map(|s| s.to_string()).collect(),
            duration_days,
            budget,
            travel_style: Vec::new(),
            include_food: true,
            include_transport: true,
        }
    }

    pub fn with_travel_style(mut self, styles: &[&str]) -> Self {
        self.travel_style = styles.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Check the request and build the record that will be stored.
    /// The id stays 0 until the primary store assigns one.
    pub fn validate(&self, created_at: DateTime<Utc>) -> Result<Trip, ValidationError> {
        let destination = self.destination.trim();
        if destination.is_empty() {
            return Err(ValidationError::EmptyDestination);
        }
        if self.duration_days <= 0 {
            return Err(ValidationError::NonPositiveDuration(self.duration_days));
        }
        let duration_days = u32::try_from(self.duration_days)
            .map_err(|_| ValidationError::DurationTooLong(self.duration_days))?;

        Ok(Trip {
            id: 0,
            destination: destination.to_string(),
            interests: tag_set(&self.interests),
            duration_days,
            budget: self.budget,
            travel_style: tag_set(&self.travel_style),
            include_food: self.include_food,
            include_transport: self.include_transport,
            created_at,
        })
    }
}

fn tag_set(tags: &[String]) -> BTreeSet<String> {
    tags.iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// A persisted trip; immutable once created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    pub id: i64,
    pub destination: String,
    pub interests: BTreeSet<String>,
    pub duration_days: u32,
    pub budget: BudgetTier,
    pub travel_style: BTreeSet<String>,
    pub include_food: bool,
    pub include_transport: bool,
    pub created_at: DateTime<Utc>,
}

/// Generated itinerary as handed over by the generation service
#[derive(Debug, Clone)]
pub struct NewItinerary {
    pub trip_id: i64,
    pub content: String,
    pub word_count: u32,
    pub character_count: u32,
    pub model_name: String,
    pub generation_time_ms: u64,
}

impl NewItinerary {
    /// Build from raw text, deriving the size metrics
    pub fn from_text(trip_id: i64, content: impl Into<String>, model_name: impl Into<String>, generation_time_ms: u64) -> Self {
        let content = content.into();
        let word_count = content.split_whitespace().count() as u32;
        let character_count = content.chars().count() as u32;
        Self {
            trip_id,
            content,
            word_count,
            character_count,
            model_name: model_name.into(),
            generation_time_ms,
        }
    }

    /// Record to be stored; the id stays 0 until the primary store assigns one
    pub fn into_record(self, created_at: DateTime<Utc>) -> Itinerary {
        Itinerary {
            id: 0,
            trip_id: self.trip_id,
            content: self.content,
            word_count: self.word_count,
            character_count: self.character_count,
            model_name: self.model_name,
            generation_time_ms: self.generation_time_ms,
            rating: None,
            feedback: None,
            quality_score: None,
            rated_at: None,
            training_sample_id: None,
            created_at,
        }
    }
}

/// A persisted itinerary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Itinerary {
    pub id: i64,
    pub trip_id: i64,
    pub content: String,
    pub word_count: u32,
    pub character_count: u32,
    pub model_name: String,
    pub generation_time_ms: u64,
    pub rating: Option<Rating>,
    pub feedback: Option<String>,
    pub quality_score: Option<f64>,
    pub rated_at: Option<DateTime<Utc>>,
    /// Curated sample derived from this itinerary, if any
    pub training_sample_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}
