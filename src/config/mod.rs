//! C10 — Configuration & lifecycle.
//!
//! A single YAML file drives the daemon: database connection
//! parameters, worker count, update interval, log destination,
//! extension list, and per-class defaults (`spec.md` §4.10).

mod daemon;

pub use daemon::{DaemonConfig, IoClassDefaults};

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::buildcfg;

/// Resolve the configuration file path: `ALPENHORN_CONFIG` if set,
/// otherwise the compiled-in default (`spec.md` §6).
pub fn config_path() -> PathBuf {
    match std::env::var_os(buildcfg::CONFIG_ENV_VAR) {
        Some(path) => PathBuf::from(path),
        None => PathBuf::from(buildcfg::DEFAULT_CONFIG_PATH),
    }
}

/// Load and validate the daemon configuration from `path`. Any
/// failure here is a fatal configuration error (`spec.md` §6, §7,
/// exit code 1).
pub fn load(path: &Path) -> Result<DaemonConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading configuration file {:?}", path))?;

    let config: DaemonConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing configuration file {:?}", path))?;

    config.validate()?;

    Ok(config)
}

/// Initialize `env_logger` from the configured log level, falling
/// back to `RUST_LOG` if the user has set it explicitly.
pub fn init_logging(config: &DaemonConfig) {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", &config.log_level);
    }
    let _ = env_logger::try_init();
}
