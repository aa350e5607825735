//! Engine configuration module.
//!
//! This module provides configuration loading for the storage engine from
//! environment variables. Every value has a default, so an empty environment
//! yields a usable configuration.
//!
//! # Environment Variables
//!
//! - `ENGINE_PAGE_SIZE`: Page size in bytes (default: `8192`)
//! - `ENGINE_CACHE_PAGES`: Number of frames in the page cache (default: `1024`)
//! - `ENGINE_PREFETCH_START_TIMEOUT_MS`: How long a pre-fetcher waits for its
//!   cursor to bind (default: `5000`)
//! - `ENGINE_PREFETCH_DIRECTION_TIMEOUT_MS`: How long a pre-fetcher waits for
//!   the cursor to move (default: `1000`)
//! - `ENGINE_PREFETCH_SPIN_ITERATIONS`: Busy-wait iterations before parking
//!   (default: `32`)
//! - `ENGINE_PREFETCH_PAUSE_US`: Park duration once spinning is over
//!   (default: `100`)
//! - `ENGINE_PREFETCH_MAX_DISTANCE`: Upper bound on pages read ahead
//!   (default: `64`)
//! - `ENGINE_LOG_ROTATION_THRESHOLD`: Log file size that triggers rotation
//!   (default: `268435456`)
//! - `ENGINE_LOG_READ_AHEAD`: Read-ahead window of log channels
//!   (default: `65536`)
//! - `ENGINE_FAIL_ON_CORRUPTED_LOG_FILES`: `true` or `false` (default: `true`)
//! - `ENGINE_TX_METADATA_CACHE_SIZE`: Transaction metadata cache capacity
//!   (default: `100000`)
//! - `ENGINE_TREE_RESTART_LIMIT`: Seeker restarts tolerated before a tree is
//!   declared inconsistent (default: `1024`)
//!
//! # Invariants
//!
//! - `page_size` is a multiple of 8 and at least `MIN_PAGE_SIZE`
//! - `cache_pages` is at least `MIN_CACHE_PAGES`
//! - `log_read_ahead` and `tx_metadata_cache_size` are positive

use std::str::FromStr;
use std::time::Duration;

/// Engine configuration.
///
/// # Pre-conditions
///
/// When constructed via `from_env()`:
/// - All set values must parse for their respective types
///
/// # Post-conditions
///
/// - The returned configuration passes `validate()`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Size of every cached page in bytes.
    pub page_size: usize,
    /// Number of frames in the page cache.
    pub cache_pages: usize,
    /// Wait for the observed cursor to bind before a pre-fetcher gives up.
    pub prefetch_start_timeout: Duration,
    /// Wait for the observed cursor to move before a pre-fetcher gives up.
    pub prefetch_direction_timeout: Duration,
    /// Busy-wait iterations before a pre-fetcher parks.
    pub prefetch_spin_iterations: u32,
    /// Park duration of an idle pre-fetcher.
    pub prefetch_pause: Duration,
    /// Maximum number of pages a pre-fetcher stays ahead of its cursor.
    pub prefetch_max_distance: u64,
    /// Log file size in bytes after which the appender rotates.
    pub log_rotation_threshold: u64,
    /// Read-ahead window of log channels, also the reverse replay chunk size.
    pub log_read_ahead: usize,
    /// Whether corrupt log entries abort reverse scans.
    pub fail_on_corrupted_log_files: bool,
    /// Capacity of the transaction metadata cache.
    pub tx_metadata_cache_size: usize,
    /// Seeker restarts tolerated before reporting tree inconsistency.
    pub tree_restart_limit: u32,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: Self::DEFAULT_PAGE_SIZE,
            cache_pages: Self::DEFAULT_CACHE_PAGES,
            prefetch_start_timeout: Duration::from_millis(5000),
            prefetch_direction_timeout: Duration::from_millis(1000),
            prefetch_spin_iterations: 32,
            prefetch_pause: Duration::from_micros(100),
            prefetch_max_distance: 64,
            log_rotation_threshold: Self::DEFAULT_LOG_ROTATION_THRESHOLD,
            log_read_ahead: Self::DEFAULT_LOG_READ_AHEAD,
            fail_on_corrupted_log_files: true,
            tx_metadata_cache_size: 100_000,
            tree_restart_limit: 1024,
        }
    }
}

impl EngineConfig {
    /// Default page size.
    pub const DEFAULT_PAGE_SIZE: usize = 8192;
    /// Smallest page a tree node fits in.
    pub const MIN_PAGE_SIZE: usize = 256;
    /// Default number of cache frames.
    pub const DEFAULT_CACHE_PAGES: usize = 1024;
    /// Fault-in plus one pinned page per cursor needs at least this many frames.
    pub const MIN_CACHE_PAGES: usize = 2;
    /// Default log rotation threshold (256 MiB).
    pub const DEFAULT_LOG_ROTATION_THRESHOLD: u64 = 256 * 1024 * 1024;
    /// Default log read-ahead window (64 KiB).
    pub const DEFAULT_LOG_READ_AHEAD: usize = 64 * 1024;

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but does not parse, or if the
    /// resulting configuration is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// `from_env` delegates here; tests pass a map-backed closure instead of
    /// mutating the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            page_size: load(&lookup, "ENGINE_PAGE_SIZE", defaults.page_size)?,
            cache_pages: load(&lookup, "ENGINE_CACHE_PAGES", defaults.cache_pages)?,
            prefetch_start_timeout: Duration::from_millis(load(
                &lookup,
                "ENGINE_PREFETCH_START_TIMEOUT_MS",
                duration_millis(defaults.prefetch_start_timeout),
            )?),
            prefetch_direction_timeout: Duration::from_millis(load(
                &lookup,
                "ENGINE_PREFETCH_DIRECTION_TIMEOUT_MS",
                duration_millis(defaults.prefetch_direction_timeout),
            )?),
            prefetch_spin_iterations: load(
                &lookup,
                "ENGINE_PREFETCH_SPIN_ITERATIONS",
                defaults.prefetch_spin_iterations,
            )?,
            prefetch_pause: Duration::from_micros(load(
                &lookup,
                "ENGINE_PREFETCH_PAUSE_US",
                u64::try_from(defaults.prefetch_pause.as_micros()).unwrap_or(u64::MAX),
            )?),
            prefetch_max_distance: load(
                &lookup,
                "ENGINE_PREFETCH_MAX_DISTANCE",
                defaults.prefetch_max_distance,
            )?,
            log_rotation_threshold: load(
                &lookup,
                "ENGINE_LOG_ROTATION_THRESHOLD",
                defaults.log_rotation_threshold,
            )?,
            log_read_ahead: load(&lookup, "ENGINE_LOG_READ_AHEAD", defaults.log_read_ahead)?,
            fail_on_corrupted_log_files: load(
                &lookup,
                "ENGINE_FAIL_ON_CORRUPTED_LOG_FILES",
                defaults.fail_on_corrupted_log_files,
            )?,
            tx_metadata_cache_size: load(
                &lookup,
                "ENGINE_TX_METADATA_CACHE_SIZE",
                defaults.tx_metadata_cache_size,
            )?,
            tree_restart_limit: load(
                &lookup,
                "ENGINE_TREE_RESTART_LIMIT",
                defaults.tree_restart_limit,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants listed in the module documentation.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` naming the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size < Self::MIN_PAGE_SIZE || self.page_size % 8 != 0 {
            return Err(invalid(
                "ENGINE_PAGE_SIZE",
                format!(
                    "{} must be a multiple of 8 and at least {}",
                    self.page_size,
                    Self::MIN_PAGE_SIZE
                ),
            ));
        }
        if self.cache_pages < Self::MIN_CACHE_PAGES {
            return Err(invalid(
                "ENGINE_CACHE_PAGES",
                format!("must be at least {}", Self::MIN_CACHE_PAGES),
            ));
        }
        if self.log_read_ahead == 0 {
            return Err(invalid("ENGINE_LOG_READ_AHEAD", "must be positive".to_string()));
        }
        if self.tx_metadata_cache_size == 0 {
            return Err(invalid(
                "ENGINE_TX_METADATA_CACHE_SIZE",
                "must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn invalid(name: &str, message: String) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        message,
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Load and parse one variable, falling back to `default` when unset.
fn load<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(value) => value.trim().parse::<T>().map_err(|_| {
            invalid(name, format!("'{value}' is not a valid {}", std::any::type_name::<T>()))
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = EngineConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.page_size, 8192);
        assert!(config.fail_on_corrupted_log_files);
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("ENGINE_PAGE_SIZE", "512"),
            ("ENGINE_CACHE_PAGES", "16"),
            ("ENGINE_PREFETCH_PAUSE_US", "250"),
            ("ENGINE_FAIL_ON_CORRUPTED_LOG_FILES", "false"),
        ]))
        .unwrap();
        assert_eq!(config.page_size, 512);
        assert_eq!(config.cache_pages, 16);
        assert_eq!(config.prefetch_pause, Duration::from_micros(250));
        assert!(!config.fail_on_corrupted_log_files);
    }

    #[test]
    fn test_unparsable_value_is_rejected() {
        let error =
            EngineConfig::from_lookup(lookup_from(&[("ENGINE_CACHE_PAGES", "many")])).unwrap_err();
        let ConfigError::InvalidValue { name, .. } = error;
        assert_eq!(name, "ENGINE_CACHE_PAGES");
    }

    #[test]
    fn test_page_size_must_be_word_aligned() {
        let error =
            EngineConfig::from_lookup(lookup_from(&[("ENGINE_PAGE_SIZE", "1001")])).unwrap_err();
        assert!(error.to_string().contains("multiple of 8"));
    }

    #[test]
    fn test_config_error_display_invalid() {
        let error = ConfigError::InvalidValue {
            name: "TEST_VAR".to_string(),
            message: "bad value".to_string(),
        };
        assert_eq!(error.to_string(), "invalid value for TEST_VAR: bad value");
    }
}
