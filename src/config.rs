//! Configuration loaded with Figment.
//!
//! Sources, later ones overriding earlier ones:
//! 1. `config/tracebuf.toml` (or an explicit file); a missing file is fine
//! 2. Environment variables prefixed with `TRACEBUF_`, `__` separating
//!    nested keys
//!
//! Every field has a default, so an empty environment yields a usable config.
//!
//! # Example
//! ```no_run
//! use tracebuf::config::Config;
//!
//! // TRACEBUF_LIVE__ORDER_DELAY_MS=50 overrides [live] order_delay_ms
//! let config = Config::load()?;
//! config.validate()?;
//! println!("reorder window: {} ms", config.live.order_delay_ms);
//! # Ok::<(), tracebuf::error::TraceError>(())
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{TraceError, TraceResult};

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/tracebuf.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "TRACEBUF_";

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const VALID_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Diagnostic logging of the tool itself
    #[serde(default)]
    pub logging: LoggingSection,
    /// Live decoding
    #[serde(default)]
    pub live: LiveSection,
}

/// `[logging]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    /// trace, debug, info, warn or error
    #[serde(default = "default_level")]
    pub level: String,
    /// pretty, compact or json
    #[serde(default = "default_format")]
    pub format: String,
    /// Include source file and line in log lines.
    #[serde(default)]
    pub with_file_and_line: bool,
    /// Include thread names in log lines.
    #[serde(default = "default_true")]
    pub with_thread_names: bool,
    /// Colour the output.
    #[serde(default = "default_true")]
    pub with_ansi: bool,
}

/// `[live]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveSection {
    /// Reorder buffer capacity in tracepoints (0 = unbounded)
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// How far behind the newest timestamp an entry must be to be released
    #[serde(default = "default_order_delay_ms")]
    pub order_delay_ms: u64,
    /// Sleep between polls of an idle buffer
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Regex on tracebuffer names
    #[serde(default = "default_filter")]
    pub tracebuffer_filter: String,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "compact".to_string()
}

fn default_true() -> bool {
    true
}

fn default_buffer_size() -> usize {
    100_000
}

fn default_order_delay_ms() -> u64 {
    25
}

fn default_poll_interval_ms() -> u64 {
    5
}

fn default_filter() -> String {
    "^.*$".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl Default for LiveSection {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            order_delay_ms: default_order_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            tracebuffer_filter: default_filter(),
        }
    }
}

impl LiveSection {
    /// `order_delay_ms` as a duration.
    pub fn order_delay(&self) -> Duration {
        Duration::from_millis(self.order_delay_ms)
    }

    /// `poll_interval_ms` as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> TraceResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> TraceResult<Self> {
        let config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Check values serde cannot check.
    pub fn validate(&self) -> TraceResult<()> {
        let level = self.logging.level.to_lowercase();
        if !VALID_LEVELS.contains(&level.as_str()) {
            return Err(TraceError::Configuration(format!(
                "Invalid logging.level '{}'. Must be one of: {}",
                self.logging.level,
                VALID_LEVELS.join(", ")
            )));
        }

        let format = self.logging.format.to_lowercase();
        if !VALID_FORMATS.contains(&format.as_str()) {
            return Err(TraceError::Configuration(format!(
                "Invalid logging.format '{}'. Must be one of: {}",
                self.logging.format,
                VALID_FORMATS.join(", ")
            )));
        }

        if self.live.poll_interval_ms == 0 {
            return Err(TraceError::Configuration(
                "live.poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        // Nanosecond arithmetic on the delay must not overflow.
        if self.live.order_delay_ms > u64::MAX / 1_000_000 {
            return Err(TraceError::Configuration(format!(
                "live.order_delay_ms {} is too large",
                self.live.order_delay_ms
            )));
        }

        regex::Regex::new(&self.live.tracebuffer_filter).map_err(|e| {
            TraceError::Configuration(format!(
                "Invalid live.tracebuffer_filter '{}': {e}",
                self.live.tracebuffer_filter
            ))
        })?;

        Ok(())
    }
}
