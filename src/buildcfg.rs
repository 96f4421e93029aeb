//! Compile-time configuration constants.

/// Default directory for the daemon's own configuration file.
pub const CONFIGDIR: &str = "/etc/alpenhorn";

#[macro_export]
macro_rules! ALPENHORN_RUN_DIR_M { () => ("/run/alpenhorn") }

#[macro_export]
macro_rules! ALPENHORN_LOG_DIR_M { () => ("/var/log/alpenhorn") }

/// namespaced directory for in-memory (tmpfs) run state
pub const ALPENHORN_RUN_DIR: &str = ALPENHORN_RUN_DIR_M!();

/// namespaced directory for persistent logging
pub const ALPENHORN_LOG_DIR: &str = ALPENHORN_LOG_DIR_M!();

/// Default path of the daemon's YAML configuration file, used when
/// `ALPENHORN_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = concat!("/etc/alpenhorn", "/alpenhornd.yaml");

/// Default worker pool size.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default interval between update loop ticks.
pub const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 10;

/// Default grace period given to in-progress tasks during shutdown.
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

/// Default age after which an abandoned hidden temp file is considered stale.
pub const DEFAULT_STALE_TEMP_AGE_SECS: u64 = 3600;

/// Name of the marker file that proves a node root has been initialised.
pub const NODE_MARKER_NAME: &str = "ALPENHORN_NODE";

/// Environment variable used to override the configuration file path.
pub const CONFIG_ENV_VAR: &str = "ALPENHORN_CONFIG";

/// Prepend the daemon's configuration directory to a file name.
#[macro_export]
macro_rules! configdir {
    ($subdir:expr) => (concat!("/etc/alpenhorn", $subdir))
}

/// Prepend the run directory to a file name.
#[macro_export]
macro_rules! rundir {
    ($subdir:expr) => {
        concat!(ALPENHORN_RUN_DIR_M!(), $subdir)
    };
}
