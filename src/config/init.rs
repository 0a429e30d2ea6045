use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::config::{get_config_path, Config};

const HEADER: &str = "\
# contrib-rank configuration
#
# scoring.weights  points per activity type; every type you record needs one
# badges           contiguous tiers from 0, the last one open-ended
# cache            snapshot staleness policy (durations like 30s, 5m, 1h)
# roles            admin / gamification role grants by user id
";

/// Write the default config to `path` (or the default location).
///
/// Refuses to replace an existing file unless `force` is set. Returns the
/// path written.
pub fn write_default_config(path: Option<PathBuf>, force: bool) -> Result<PathBuf> {
    let config_path = path.unwrap_or_else(get_config_path);

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config already exists at {}. Pass --force to overwrite",
            config_path.display()
        );
    }

    let yaml = serde_saphyr::to_string(&Config::default())
        .map_err(|e| anyhow::anyhow!("Failed to serialize config: {}", e))?;

    // Create parent directories
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    std::fs::write(&config_path, format!("{}\n{}", HEADER, yaml))
        .with_context(|| format!("Failed to write config to {}", config_path.display()))?;

    Ok(config_path)
}
