//! `homa-probe.toml` configuration: a thin TOML load wrapper around the
//! engine's own tunables. There is nothing demo-specific to configure beyond
//! what `homa::HomaConfig` already exposes, so this module just owns the
//! file I/O and the `init` example-printing path.

use std::path::Path;

use anyhow::{Context, Result};
use homa::config::HomaConfig;

/// Load and validate a `HomaConfig` from a TOML file. Missing fields fall
/// back to the engine's own defaults, the same `#[serde(default = ...)]`
/// contract `HomaConfig` documents.
pub fn load(path: &Path) -> Result<HomaConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let cfg: HomaConfig = toml::from_str(&text)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    cfg.validate().with_context(|| format!("invalid config in {}", path.display()))?;
    Ok(cfg)
}

/// A config suitable for printing with `toml::to_string_pretty`, for the
/// `init` subcommand.
pub fn default_example() -> HomaConfig {
    HomaConfig::default_example()
}
