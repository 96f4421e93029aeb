//! The daemon's YAML configuration schema.

use std::collections::HashMap;

use anyhow::{bail, Result};
use serde::Deserialize;

use crate::buildcfg;

/// Per-I/O-class default overrides (`spec.md` §4.10, §9 open
/// question — exact metric/knob names are part of the configurable
/// observability layer, not the core contract, so this struct only
/// carries the handful `spec.md` actually names).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IoClassDefaults {
    /// Verify pulled bytes against the recorded hash before renaming
    /// into place. Default on for archive destinations (`spec.md`
    /// §4.7 step 7).
    pub verify_on_pull: bool,
    /// Per-destination-node concurrent pull cap (`spec.md` §4.7).
    pub concurrent_pulls: usize,
}

impl Default for IoClassDefaults {
    fn default() -> Self {
        IoClassDefaults { verify_on_pull: true, concurrent_pulls: 2 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// This host's name, as it appears in `storage_node.daemon_host`.
    /// Defaults to the machine's hostname when omitted.
    pub hostname: Option<String>,

    /// Connection string for the Data Index (Postgres).
    pub database_url: String,

    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,

    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    #[serde(default = "default_stale_temp_age")]
    pub stale_temp_age_secs: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional Prometheus-text metrics endpoint port.
    pub metrics_port: Option<u16>,

    /// Extension module names to load at startup, in order
    /// (`spec.md` §4.9).
    #[serde(default)]
    pub extensions: Vec<String>,

    #[serde(default)]
    pub io_class_defaults: HashMap<String, IoClassDefaults>,

    /// Maximum pending requests fetched per node/group per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,

    /// Transfer backend preference: `auto`, `bbcp`, `rsync`, or
    /// `local-copy` (`spec.md` §9 open question). `auto` tries `bbcp`
    /// when `bbcp_path` is configured, else falls back to `rsync`.
    #[serde(default = "default_backend_preference")]
    pub backend_preference: String,

    #[serde(default)]
    pub bbcp_path: String,

    #[serde(default = "default_rsync_path")]
    pub rsync_path: String,

    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u64,
}

fn default_worker_count() -> usize {
    buildcfg::DEFAULT_WORKER_COUNT
}
fn default_update_interval() -> u64 {
    buildcfg::DEFAULT_UPDATE_INTERVAL_SECS
}
fn default_shutdown_grace() -> u64 {
    buildcfg::DEFAULT_SHUTDOWN_GRACE_SECS
}
fn default_stale_temp_age() -> u64 {
    buildcfg::DEFAULT_STALE_TEMP_AGE_SECS
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_batch_size() -> i64 {
    100
}
fn default_backend_preference() -> String {
    "auto".to_string()
}
fn default_rsync_path() -> String {
    "rsync".to_string()
}
fn default_transfer_timeout() -> u64 {
    6 * 3600
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            bail!("database_url must not be empty");
        }
        if self.worker_count == 0 {
            bail!("worker_count must be at least 1");
        }
        if self.update_interval_secs == 0 {
            bail!("update_interval_secs must be at least 1");
        }
        Ok(())
    }

    /// Resolve this daemon's own hostname, used to match
    /// `storage_node.daemon_host` (`spec.md` §3).
    pub fn resolve_hostname(&self) -> Result<String> {
        if let Some(h) = &self.hostname {
            return Ok(h.clone());
        }
        let uname = nix::sys::utsname::uname();
        Ok(uname.nodename().to_string())
    }

    pub fn io_class_defaults(&self, io_class: &str) -> IoClassDefaults {
        self.io_class_defaults.get(io_class).cloned().unwrap_or_default()
    }

    pub fn backend_kind(&self) -> crate::transfer::BackendKind {
        match self.backend_preference.as_str() {
            "bbcp" => crate::transfer::BackendKind::Bbcp,
            "rsync" => crate::transfer::BackendKind::Rsync,
            "local-copy" => crate::transfer::BackendKind::LocalCopy,
            _ => crate::transfer::BackendKind::Auto,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_database_url() {
        let cfg = DaemonConfig {
            hostname: None,
            database_url: "".into(),
            worker_count: 4,
            update_interval_secs: 10,
            shutdown_grace_secs: 30,
            stale_temp_age_secs: 3600,
            log_level: "info".into(),
            metrics_port: None,
            extensions: vec![],
            io_class_defaults: HashMap::new(),
            batch_size: 100,
            backend_preference: "auto".into(),
            bbcp_path: String::new(),
            rsync_path: "rsync".into(),
            transfer_timeout_secs: 21600,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_minimal_yaml() {
        let yaml = "database_url: postgres://localhost/alpenhorn\n";
        let cfg: DaemonConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.worker_count, buildcfg::DEFAULT_WORKER_COUNT);
        assert_eq!(cfg.update_interval_secs, buildcfg::DEFAULT_UPDATE_INTERVAL_SECS);
        assert!(cfg.extensions.is_empty());
    }
}
