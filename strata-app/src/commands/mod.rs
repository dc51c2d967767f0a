pub mod health;
pub mod simulate;

use anyhow::{Context, Result};
use std::path::Path;
use strata_core::{load_config, CoreConfig};

/// Load the YAML config at `path`, or defaults plus `STRATA_*` overrides.
pub fn load(path: Option<&Path>) -> Result<CoreConfig> {
    match path {
        Some(path) => load_config(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => {
            let mut config = CoreConfig::default();
            config
                .apply_env_overrides()
                .context("Invalid STRATA_* environment override")?;
            config.validate().context("Invalid default configuration")?;
            Ok(config)
        }
    }
}
