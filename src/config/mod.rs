mod init;
mod schema;

pub use init::write_default_config;
pub use schema::{CacheConfig, Config};

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use crate::scoring::{validate_badges, validate_scoring};

/// Get the config directory path (~/.config/contrib-rank/)
pub fn get_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("contrib-rank")
}

/// Get the default config file path (~/.config/contrib-rank/config.yaml)
pub fn get_config_path() -> PathBuf {
    get_config_dir().join("config.yaml")
}

/// Load configuration from a YAML file
///
/// # Arguments
///
/// * `path` - Optional path to config file. If None, uses default path (~/.config/contrib-rank/config.yaml)
///
/// # Errors
///
/// Returns an error if:
/// - The config file does not exist
/// - The config file cannot be read
/// - The YAML cannot be parsed
pub fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let config_path = path.unwrap_or_else(get_config_path);

    if !config_path.exists() {
        anyhow::bail!(
            "Config file not found at {}. Run `contrib-rank init` to create one",
            config_path.display()
        );
    }

    let config_content = fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;

    let config: Config = serde_saphyr::from_str(&config_content)
        .with_context(|| format!("Failed to parse config: invalid YAML in {}", config_path.display()))?;

    Ok(config)
}

/// Validate a whole config, returning every error found.
pub fn validate_config(config: &Config) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if let Err(e) = validate_scoring(&config.scoring) {
        errors.extend(e);
    }
    if let Err(e) = validate_badges(&config.badges) {
        errors.extend(e);
    }
    if let Err(e) = config.cache.settings() {
        errors.extend(e);
    }

    let mut seen = HashSet::new();
    for (i, grant) in config.roles.iter().enumerate() {
        if grant.user_id.trim().is_empty() {
            errors.push(format!("roles[{}]: user_id must not be empty", i));
        } else if !seen.insert(grant.user_id.as_str()) {
            errors.push(format!("roles[{}]: duplicate grant for user '{}'", i, grant.user_id));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
