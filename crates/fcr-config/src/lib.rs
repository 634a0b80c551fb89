//! Process-level configuration loading for the Fleet Command Runner.
//!
//! Layered the same way this workspace's shared configuration crate loads
//! settings: built-in defaults, an optional `fcr.toml`/`config.toml` file,
//! a `.env` file (via `dotenvy`), and finally `FCR_`-prefixed environment
//! variables, in increasing precedence.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum FcrConfigError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FcrConfigError>;

/// All process-level knobs the RPC/CLI harness feeds into the core, plus
/// the per-component timeouts the core needs to operate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FcrConfig {
    /// TCP listen port for the RPC harness.
    pub port: u16,
    /// Max devices handled locally by one `bulk_run` before sharding to peers.
    pub lb_threshold: usize,
    /// Seconds subtracted from a forwarded bulk deadline to account for peer RPC overhead.
    pub remote_call_overhead_secs: u64,
    /// Seconds to wait for in-flight commands to finish on shutdown.
    pub exit_max_wait_secs: u64,
    /// Seconds between device inventory refreshes.
    pub device_db_update_interval_secs: u64,
    /// Optional substring filter applied to device names on inventory refresh.
    pub device_name_filter: Option<String>,
    /// Size of the blocking-call worker pool (DNS, inventory fetch, SSH I/O).
    pub max_default_executor_threads: usize,
    /// Ceiling on concurrently active device units before `bulk_run_local` sheds load.
    pub max_active_device_units: usize,
    /// `tracing` filter directive, e.g. "info" or "fcr_core=debug,warn".
    pub log_level: String,
    /// Mirrors the Python asyncio debug flag; enables extra tracing instrumentation.
    pub asyncio_debug: bool,
    /// Default connect+setup timeout in seconds.
    pub open_timeout_secs: u64,
    /// Default per-command timeout in seconds.
    pub read_timeout_secs: u64,
    /// Default idle timeout in seconds before a persistent session is swept.
    pub idle_timeout_secs: u64,
    /// Default TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Path to the vendor profile JSON document, if any.
    pub vendor_config_path: Option<String>,
}

impl Default for FcrConfig {
    fn default() -> Self {
        Self {
            port: 4409,
            lb_threshold: 100,
            remote_call_overhead_secs: 2,
            exit_max_wait_secs: 30,
            device_db_update_interval_secs: 300,
            device_name_filter: None,
            max_default_executor_threads: 4,
            max_active_device_units: 16,
            log_level: "info".to_string(),
            asyncio_debug: false,
            open_timeout_secs: 15,
            read_timeout_secs: 30,
            idle_timeout_secs: 600,
            connect_timeout_secs: 10,
            vendor_config_path: None,
        }
    }
}

impl FcrConfig {
    pub fn remote_call_overhead(&self) -> Duration {
        Duration::from_secs(self.remote_call_overhead_secs)
    }

    pub fn exit_max_wait(&self) -> Duration {
        Duration::from_secs(self.exit_max_wait_secs)
    }

    pub fn device_db_update_interval(&self) -> Duration {
        Duration::from_secs(self.device_db_update_interval_secs)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Load configuration from (in increasing precedence) built-in defaults,
    /// an optional `fcr.toml`/`config.toml` in the current or workspace root
    /// directory, a `.env` file, and `FCR_`-prefixed environment variables.
    pub fn load() -> Result<Self> {
        // Best-effort: a missing .env is not an error.
        let _ = dotenvy::dotenv();

        let mut builder = Config::builder().add_source(Config::try_from(&FcrConfig::default())?);

        if let Some(path) = find_config_file() {
            debug!(path = %path.display(), "loading fcr config file");
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("FCR")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let fcr_config: FcrConfig = config.try_deserialize()?;
        Ok(fcr_config)
    }

    /// Load configuration starting from a specific file rather than searching
    /// the working directory; used by tests and by callers with a known path.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let builder = Config::builder()
            .add_source(Config::try_from(&FcrConfig::default())?)
            .add_source(File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("FCR")
                    .separator("_")
                    .try_parsing(true),
            );
        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }
}

fn find_config_file() -> Option<PathBuf> {
    for name in ["fcr.toml", "config.toml"] {
        let path = PathBuf::from(name);
        if path.exists() {
            return Some(path);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let cfg = FcrConfig::default();
        assert_eq!(cfg.lb_threshold, 100);
        assert_eq!(cfg.max_default_executor_threads, 4);
        assert_eq!(cfg.open_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "lb_threshold = 7\nlog_level = \"debug\"").unwrap();
        let cfg = FcrConfig::load_from(file.path()).unwrap();
        assert_eq!(cfg.lb_threshold, 7);
        assert_eq!(cfg.log_level, "debug");
        // Untouched fields keep their defaults.
        assert_eq!(cfg.port, 4409);
    }

    #[test]
    fn env_overrides_file() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "lb_threshold = 7").unwrap();
        std::env::set_var("FCR_LB_THRESHOLD", "42");
        let cfg = FcrConfig::load_from(file.path()).unwrap();
        std::env::remove_var("FCR_LB_THRESHOLD");
        assert_eq!(cfg.lb_threshold, 42);
    }
}
