use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::leaderboard::{RoleGrant, SnapshotSettings};
use crate::scoring::{default_badge_rules, BadgeRule, ScoringConfig};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Where the event journal lives. Defaults to `<config dir>/data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default = "default_badge_rules")]
    pub badges: Vec<BadgeRule>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub roles: Vec<RoleGrant>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            scoring: ScoringConfig::default(),
            badges: default_badge_rules(),
            cache: CacheConfig::default(),
            roles: Vec::new(),
        }
    }
}

impl Config {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| super::get_config_dir().join("data"))
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir().join("events.jsonl")
    }
}

/// Snapshot staleness policy. Durations use humantime syntax ("5m", "10s").
///
/// Example YAML:
/// ```yaml
/// cache:
///   refresh_interval: 5m
///   change_threshold: 25
///   refresh_budget: 10s
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: String,
    #[serde(default = "default_change_threshold")]
    pub change_threshold: u64,
    #[serde(default = "default_refresh_budget")]
    pub refresh_budget: String,
}

fn default_refresh_interval() -> String {
    "5m".to_string()
}

fn default_change_threshold() -> u64 {
    25
}

fn default_refresh_budget() -> String {
    "10s".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
            change_threshold: default_change_threshold(),
            refresh_budget: default_refresh_budget(),
        }
    }
}

impl CacheConfig {
    fn parse_positive(field: &str, value: &str, errors: &mut Vec<String>) -> Duration {
        match humantime::parse_duration(value) {
            Ok(d) if d.is_zero() => {
                errors.push(format!("cache.{}: must be greater than zero", field));
                Duration::ZERO
            }
            Ok(d) => d,
            Err(e) => {
                errors.push(format!("cache.{}: invalid duration '{}': {}", field, value, e));
                Duration::ZERO
            }
        }
    }

    /// Resolve into runtime settings, collecting every problem.
    pub fn settings(&self) -> Result<SnapshotSettings, Vec<String>> {
        let mut errors = Vec::new();
        let refresh_interval =
            Self::parse_positive("refresh_interval", &self.refresh_interval, &mut errors);
        let refresh_budget =
            Self::parse_positive("refresh_budget", &self.refresh_budget, &mut errors);
        if self.change_threshold == 0 {
            errors.push("cache.change_threshold: must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(SnapshotSettings {
                refresh_interval,
                change_threshold: self.change_threshold,
                refresh_budget,
            })
        } else {
            Err(errors)
        }
    }
}
