//! CLI interface for trip-curator

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

use crate::config::{self, Config};
use crate::storage::{ItinerarySummary, StorageCoordinator};
use crate::training::CurationOutcome;
use crate::types::{BudgetTier, NewItinerary, NewTrip};

#[derive(Parser)]
#[command(name = "trip-curator")]
#[command(about = "Dual-store persistence and training-data curation for generated itineraries", long_about = None)]
#[command(version)]
struct Cli {
    /// Use this config file instead of the default location
    #[arg(long, global = true, env = "TRIP_CURATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a trip request
    Trip {
        /// Destination, e.g. "Tokyo, Japan"
        destination: String,
        /// Trip length in days
        #[arg(short, long)]
        days: i64,
        /// Budget tier: budget, moderate or luxury
        #[arg(short, long, default_value = "moderate")]
        budget: String,
        /// Interest tags (repeatable or comma separated)
        #[arg(short, long, value_delimiter = ',')]
        interests: Vec<String>,
        /// Travel style tags (repeatable or comma separated)
        #[arg(short, long, value_delimiter = ',')]
        style: Vec<String>,
        /// Leave food recommendations out
        #[arg(long)]
        no_food: bool,
        /// Leave transport tips out
        #[arg(long)]
        no_transport: bool,
    },
    /// Record a generated itinerary for a trip
    Itinerary {
        /// Trip the itinerary was generated for
        trip_id: i64,
        /// Itinerary text
        #[arg(short, long, conflicts_with = "file", required_unless_present = "file")]
        text: Option<String>,
        /// Read the itinerary text from a file
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Model that generated it
        #[arg(short, long, default_value = "unknown")]
        model: String,
        /// Generation latency in milliseconds
        #[arg(long, default_value = "0")]
        generation_ms: u64,
    },
    /// Rate an itinerary (0-5) with optional feedback
    Rate {
        itinerary_id: i64,
        #[arg(allow_negative_numbers = true)]
        rating: i64,
        #[arg(short, long)]
        feedback: Option<String>,
    },
    /// Show system metrics and backup health
    Stats,
    /// List training cycles
    Cycles,
    /// Most planned destinations
    Destinations {
        #[arg(short, long, default_value = "5")]
        limit: usize,
    },
    /// Most recent itineraries
    Recent {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Find itineraries by destination
    Search {
        query: String,
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Training corpus statistics and newest samples
    Training {
        #[arg(short, long, default_value = "5")]
        limit: usize,
    },
    /// Export every record as JSON
    Export {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Replay the backup log into the primary store
    Replay,
    /// Append parked backup entries to the backup log
    Reconcile,
    /// Show configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
}

/// Run the CLI
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config.clone() {
        Some(path) => path,
        None => config::config_path()?,
    };

    if let Commands::Config { command } = &cli.command {
        match command {
            ConfigCommands::Path => println!("{}", config_path.display()),
            ConfigCommands::Show => {
                let config = Config::load_from(&config_path)?;
                print!("{}", toml::to_string_pretty(&config).context("Failed to render config")?);
            }
        }
        return Ok(());
    }

    let config = Config::load_from(&config_path)?;
    let coordinator = StorageCoordinator::open(&config)
        .await
        .context("Failed to open stores")?;

    let result = dispatch(&coordinator, cli.command, cli.json).await;

    // Queued backup writes must land before the process exits
    coordinator.flush_backups().await.context("Failed to flush backup queue")?;
    result
}

async fn dispatch(coordinator: &StorageCoordinator, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::Trip { destination, days, budget, interests, style, no_food, no_transport } => {
            let budget: BudgetTier = budget.parse()?;
            let mut request = NewTrip::new(destination, &[], days, budget);
            request.interests = interests;
            request.travel_style = style;
            request.include_food = !no_food;
            request.include_transport = !no_transport;

            let trip = coordinator.create_trip(&request).await?;
            if json {
                print_json(&trip)?;
            } else {
                println!("Trip #{} created: {} ({} days, {})", trip.id, trip.destination, trip.duration_days, trip.budget);
            }
        }
        Commands::Itinerary { trip_id, text, file, model, generation_ms } => {
            let content = match (text, file) {
                (Some(text), _) => text,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                (None, None) => anyhow::bail!("Provide --text or --file"),
            };

            let itinerary = coordinator
                .create_itinerary(NewItinerary::from_text(trip_id, content, model, generation_ms))
                .await?;
            if json {
                print_json(&itinerary)?;
            } else {
                println!(
                    "Itinerary #{} stored for trip #{} ({} words, {} chars)",
                    itinerary.id, itinerary.trip_id, itinerary.word_count, itinerary.character_count
                );
            }
        }
        Commands::Rate { itinerary_id, rating, feedback } => {
            let outcome = coordinator
                .rate_itinerary(itinerary_id, rating, feedback.as_deref())
                .await?;
            if json {
                print_json(&outcome)?;
            } else {
                println!(
                    "Itinerary #{} rated {} (quality score {:.0})",
                    itinerary_id,
                    rating,
                    outcome.itinerary.quality_score.unwrap_or_default()
                );
                match &outcome.curation {
                    CurationOutcome::Created { sample_id, .. } => println!("  Training sample #{} curated", sample_id),
                    CurationOutcome::Duplicate { existing_sample_id, .. } => {
                        println!("  Same trip shape already curated as sample #{}", existing_sample_id)
                    }
                    CurationOutcome::NotEligible => {}
                }
                if let Some(cycle) = &outcome.cycle {
                    println!(
                        "  Training cycle #{} {} with {} samples",
                        cycle.cycle_number, cycle.status, cycle.samples_used
                    );
                }
            }
        }
        Commands::Stats => {
            let metrics = coordinator.system_metrics().await?;
            let distribution = coordinator.rating_distribution().await?;
            let health = coordinator.backup_health().await?;
            if json {
                print_json(&serde_json::json!({
                    "metrics": metrics,
                    "rating_distribution": distribution,
                    "backup": health,
                }))?;
            } else {
                println!("\nSystem Metrics");
                println!("=======================================");
                println!("  Trips:                   {}", metrics.total_trips);
                println!("  Itineraries:             {}", metrics.total_itineraries);
                println!("  Ratings:                 {}", metrics.total_ratings);
                println!("  Average rating:          {:.2}", metrics.avg_rating);
                println!("  Average quality score:   {:.1}", metrics.avg_quality_score);
                println!("  Training samples:        {}", metrics.total_training_samples);
                println!("  Unconsumed high quality: {}", metrics.unconsumed_high_quality_samples);
                println!("  Cycles completed:        {}", metrics.training_cycles_completed);
                println!(
                    "  Next cycle readiness:    {:.0}%",
                    crate::metrics::cycle_readiness(&metrics, coordinator.policy()) * 100.0
                );
                if let Some(last) = metrics.last_cycle_at {
                    println!("  Last cycle:              {}", last.format("%Y-%m-%d %H:%M"));
                }
                if !distribution.is_empty() {
                    println!("\n  Ratings:");
                    for (rating, count) in distribution.iter().rev() {
                        println!("    {}: {}", rating, count);
                    }
                }
                println!("\n  Backup: {} appended, {} retried, {} degraded, {} parked",
                    health.appended, health.retried, health.degraded, health.outbox_len);
                if health.is_degraded() {
                    println!("  Run 'trip-curator reconcile' to re-append parked entries.");
                }
            }
        }
        Commands::Cycles => {
            let cycles = coordinator.cycle_history().await?;
            if json {
                print_json(&cycles)?;
            } else if cycles.is_empty() {
                println!("No training cycles yet.");
            } else {
                for cycle in cycles {
                    println!(
                        "#{} [{}] {} samples, quality {:.1} -> {:.1} ({:+.1}), started {}",
                        cycle.cycle_number,
                        cycle.status,
                        cycle.samples_used,
                        cycle.avg_quality_before,
                        cycle.avg_quality_after,
                        cycle.improvement,
                        cycle.started_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }
        }
        Commands::Destinations { limit } => {
            let destinations = coordinator.popular_destinations(limit).await?;
            if json {
                print_json(&destinations)?;
            } else {
                for (i, d) in destinations.iter().enumerate() {
                    let rating = d.avg_rating.map(|r| format!("{:.1}", r)).unwrap_or_else(|| "-".to_string());
                    println!("{}. {} ({} trips, avg rating {})", i + 1, d.destination, d.trip_count, rating);
                }
            }
        }
        Commands::Recent { limit } => {
            let rows = coordinator.recent_itineraries(limit).await?;
            print_summaries(&rows, json)?;
        }
        Commands::Search { query, limit } => {
            let rows = coordinator.search_destination(&query, limit).await?;
            print_summaries(&rows, json)?;
        }
        Commands::Training { limit } => {
            let stats = coordinator.training_statistics().await?;
            let samples = coordinator.training_samples(limit).await?;
            if json {
                print_json(&serde_json::json!({ "statistics": stats, "samples": samples }))?;
            } else {
                println!("\nTraining Corpus");
                println!("=======================================");
                println!("  Samples:            {}", stats.total_samples);
                println!("  High quality:       {}", stats.high_quality_samples);
                println!("  Unconsumed:         {}", stats.unconsumed_high_quality);
                println!("  Average score:      {:.1}", stats.avg_quality_score);
                if stats.ready_for_cycle() {
                    println!("  Next cycle:         ready");
                } else {
                    println!("  Next cycle:         {} more samples", stats.samples_until_next_cycle);
                }
                for sample in samples {
                    println!(
                        "  #{} itinerary #{} score {:.0}{}",
                        sample.id,
                        sample.itinerary_id,
                        sample.quality_score,
                        if sample.consumed { " (consumed)" } else { "" }
                    );
                }
            }
        }
        Commands::Export { output } => {
            let snapshot = coordinator.export_snapshot().await?;
            let rendered = serde_json::to_string_pretty(&snapshot)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, rendered)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("Exported {} trips and {} itineraries to {}",
                        snapshot.trips.len(), snapshot.itineraries.len(), path.display());
                }
                None => println!("{}", rendered),
            }
        }
        Commands::Replay => {
            let report = coordinator.recover().await?;
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "Replayed backup log: {} applied, {} already present, {} orphaned",
                    report.applied, report.skipped, report.orphaned
                );
            }
        }
        Commands::Reconcile => {
            let reconciled = coordinator.reconcile_backup().await?;
            if json {
                print_json(&serde_json::json!({ "reconciled": reconciled }))?;
            } else {
                println!("Reconciled {} parked backup entries", reconciled);
            }
        }
        Commands::Config { .. } => {}
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_summaries(rows: &[ItinerarySummary], json: bool) -> Result<()> {
    if json {
        return print_json(&rows);
    }
    if rows.is_empty() {
        println!("No itineraries found.");
        return Ok(());
    }
    for row in rows {
        let rating = row.rating.map(|r| r.to_string()).unwrap_or_else(|| "unrated".to_string());
        println!(
            "#{} {} ({} days, {}) {} - {} words, {}",
            row.id,
            row.destination,
            row.duration_days,
            row.budget,
            rating,
            row.word_count,
            row.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}
