//! Trip Curator - dual-store persistence and training-data curation
//!
//! Generated itineraries are written to a SQLite primary store and mirrored
//! to an append-only backup log. Ratings are scored, high-quality itineraries
//! are curated into a deduplicated training corpus, and once enough samples
//! accumulate a training cycle is recorded. Aggregate metrics are recomputed
//! inside every write.
//!
//! # Example
//!
//! ```ignore
//! use trip_curator::{BudgetTier, Config, NewItinerary, NewTrip, StorageCoordinator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let coordinator = StorageCoordinator::open(&Config::load()?).await?;
//!     let trip = coordinator
//!         .create_trip(&NewTrip::new("Tokyo, Japan", &["culture", "food"], 7, BudgetTier::Moderate))
//!         .await?;
//!     let itinerary = coordinator
//!         .create_itinerary(NewItinerary::from_text(trip.id, "Day 1: ...", "llama-3.3-70b", 1800))
//!         .await?;
//!     coordinator.rate_itinerary(itinerary.id, 5, Some("great trip")).await?;
//!     coordinator.flush_backups().await?;
//!     Ok(())
//! }
//! ```

// Core modules
pub mod types;
pub mod error;
pub mod config;
pub mod scoring;

// Persistence and curation
pub mod storage;
pub mod training;
pub mod metrics;
pub mod pipeline;

pub mod cli;

// Re-export commonly used types for convenience
pub use config::Config;
pub use error::{StoreError, StoreResult, ValidationError};
pub use metrics::{PopularDestination, SystemMetrics};
pub use pipeline::RatingOutcome;
pub use scoring::QualityScorer;
pub use storage::{
    BackupHealth,
    BackupLog,
    ItinerarySummary,
    JsonlBackupLog,
    ReplayReport,
    Snapshot,
    StorageCoordinator,
};
pub use training::{
    CurationOutcome,
    CurationPolicy,
    CycleStatus,
    TrainingCycle,
    TrainingSample,
    TrainingStats,
};
pub use types::{BudgetTier, Itinerary, NewItinerary, NewTrip, Rating, Trip};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
