//! Configuration management
//!
//! Storage locations, curation thresholds, backup retry policy and recovery
//! behaviour, loaded from a TOML file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::scoring::QualityScorer;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Where the primary and backup stores live
    #[serde(default)]
    pub storage: StorageConfig,
    /// Curation and cycle thresholds
    #[serde(default)]
    pub curation: CurationConfig,
    /// Backup write retry policy
    #[serde(default)]
    pub backup: BackupConfig,
    /// Startup recovery and lock handling
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite primary store
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Directory holding the append-only backup log
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
}

fn default_database_path() -> PathBuf {
    data_dir()
        .unwrap_or_else(|_| PathBuf::from("data"))
        .join("curator.db")
}

fn default_backup_dir() -> PathBuf {
    data_dir()
        .unwrap_or_else(|_| PathBuf::from("data"))
        .join("backup")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            backup_dir: default_backup_dir(),
        }
    }
}

impl StorageConfig {
    /// Keep both stores under one directory
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            database_path: dir.join("curator.db"),
            backup_dir: dir.join("backup"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurationConfig {
    /// Lowest rating that produces a training sample
    #[serde(default = "default_high_quality_rating")]
    pub high_quality_rating: u8,
    /// Unconsumed high-quality samples needed to emit a cycle
    #[serde(default = "default_cycle_threshold")]
    pub cycle_threshold: u32,
    /// Feedback length that earns the quality bonus
    #[serde(default = "default_feedback_min_chars")]
    pub feedback_min_chars: usize,
}

fn default_high_quality_rating() -> u8 {
    4
}

fn default_cycle_threshold() -> u32 {
    3
}

fn default_feedback_min_chars() -> usize {
    8
}

impl Default for CurationConfig {
    fn default() -> Self {
        Self {
            high_quality_rating: default_high_quality_rating(),
            cycle_threshold: default_cycle_threshold(),
            feedback_min_chars: default_feedback_min_chars(),
        }
    }
}

impl CurationConfig {
    pub fn scorer(&self) -> QualityScorer {
        QualityScorer {
            feedback_min_chars: self.feedback_min_chars,
            high_quality_rating: self.high_quality_rating,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Attempts per backup entry before it is parked in the outbox
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base backoff between attempts in milliseconds
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    /// Maximum backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Pending entries the queue holds before spilling to the outbox
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_max_attempts() -> u32 { 5 }
fn default_base_backoff_ms() -> u64 { 100 }
fn default_max_backoff_ms() -> u64 { 5000 }
fn default_queue_capacity() -> usize { 1024 }

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl BackupConfig {
    /// Backoff before retry number `attempt` (0-based), doubling and capped
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let ms = self.base_backoff_ms.saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Replay the backup log into the primary store when opening
    #[serde(default = "default_true")]
    pub replay_on_startup: bool,
    /// Transparent retries when the primary store is locked
    #[serde(default = "default_busy_retries")]
    pub busy_retries: u32,
}

fn default_true() -> bool {
    true
}

fn default_busy_retries() -> u32 {
    5
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            replay_on_startup: true,
            busy_retries: default_busy_retries(),
        }
    }
}

impl Config {
    /// Load configuration from the default location, writing defaults if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to an explicit file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let parent = path.parent()
            .context("Config path has no parent")?;

        std::fs::create_dir_all(parent)
            .context("Failed to create config directory")?;

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        std::fs::write(path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Configuration rooted in a single directory, used by tests and tooling
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            storage: StorageConfig::in_dir(dir),
            ..Default::default()
        }
    }
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "trip-curator", "trip-curator")
        .context("Failed to get project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

/// Get the data directory path
pub fn data_dir() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "trip-curator", "trip-curator")
        .context("Failed to get project directories")?;
    Ok(base.data_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.curation.high_quality_rating, 4);
        assert_eq!(config.curation.cycle_threshold, 3);
        assert_eq!(config.backup.max_attempts, 5);
        assert!(config.recovery.replay_on_startup);
    }

    #[test]
    fn test_backoff_duration() {
        let backup = BackupConfig::default();
        assert_eq!(backup.backoff_duration(0).as_millis(), 100);
        assert_eq!(backup.backoff_duration(1).as_millis(), 200);
        assert_eq!(backup.backoff_duration(2).as_millis(), 400);
        assert_eq!(backup.backoff_duration(10).as_millis(), 5000);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str("[curation]\ncycle_threshold = 5\n").unwrap();
        assert_eq!(config.curation.cycle_threshold, 5);
        assert_eq!(config.curation.high_quality_rating, 4);
        assert_eq!(config.backup.queue_capacity, 1024);
    }

    #[test]
    fn test_load_writes_default_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.curation.feedback_min_chars, 8);
    }
}
