//! Connection and migration configuration.
//!
//! Two typed records cover the per-instance connection parameters and the
//! migration behavior knobs. Values come from environment variables with CLI
//! overrides layered on top by the binary; `Config::validate` collects every
//! rejection at once so the operator sees the full list instead of a
//! whack-a-mole sequence.

use std::env;

use serde::{Deserialize, Serialize};

/// Default platform endpoint, used when no base URL override is supplied.
pub const DEFAULT_BASE_URL: &str = "https://api.tracehub.example.com";

/// Hard ceiling for bulk POST payload sizes accepted by the platform.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Hard ceiling for the dataset worker pool.
pub const MAX_WORKERS: usize = 10;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConnectionConfig {
    /// API key sent as `X-API-Key` on every request.
    pub api_key: String,
    /// Instance base URL, with or without the `/api/v1` suffix.
    pub base_url: String,
    /// Whether to verify TLS certificates. Disable only for self-hosted
    /// instances with private CAs.
    pub verify_tls: bool,
    /// Connect+read timeout per request, in seconds.
    pub timeout_seconds: u64,
    /// Maximum attempts for retryable failures.
    pub max_retries: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            verify_tls: true,
            timeout_seconds: 30,
            max_retries: 3,
        }
    }
}

impl ConnectionConfig {
    /// Normalized API base: trailing slashes removed, `/api/v1` appended when
    /// the operator supplied a bare host URL.
    pub fn api_base(&self) -> String {
        normalize_api_base(&self.base_url)
    }
}

/// Normalize a base URL for the JSON API.
pub fn normalize_api_base(base_url: &str) -> String {
    let clean = base_url.trim_end_matches('/');
    if clean.ends_with("/api/v1") || clean.ends_with("/api/v2") {
        clean.to_string()
    } else {
        format!("{}/api/v1", clean)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MigrationConfig {
    /// Records per bulk POST (examples, runs).
    pub batch_size: usize,
    /// Dataset migrations running in parallel.
    pub concurrent_workers: usize,
    /// Log what would happen without writing anything to the destination.
    pub dry_run: bool,
    /// When a destination resource already matches by name, skip it instead
    /// of patching it in place.
    pub skip_existing: bool,
    /// Keep processing remaining items after a per-item failure.
    pub resume_on_error: bool,
    /// Log each outbound request and the per-record decisions.
    pub verbose: bool,
    /// Stream examples page by page instead of loading a dataset's examples
    /// into memory.
    pub stream_examples: bool,
    /// Page size for streamed listings.
    pub chunk_size: usize,
    /// Minimum delay between outbound requests, in seconds.
    pub rate_limit_delay: f64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            concurrent_workers: 4,
            dry_run: false,
            skip_existing: true,
            resume_on_error: true,
            verbose: false,
            stream_examples: true,
            chunk_size: 1000,
            rate_limit_delay: 0.1,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Config {
    pub source: ConnectionConfig,
    pub destination: ConnectionConfig,
    pub migration: MigrationConfig,
}

impl Config {
    /// Build a configuration from the process environment.
    ///
    /// `TRACEHUB_OLD_*` variables describe the source instance,
    /// `TRACEHUB_NEW_*` the destination, and `MIGRATION_*` the behavior
    /// knobs. Absent variables fall back to defaults; the CLI may override
    /// individual fields afterwards.
    pub fn from_env() -> Self {
        let verify_tls = env_bool("TRACEHUB_VERIFY_SSL", true);

        let source = ConnectionConfig {
            api_key: env::var("TRACEHUB_OLD_API_KEY").unwrap_or_default(),
            base_url: env::var("TRACEHUB_OLD_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            verify_tls,
            ..ConnectionConfig::default()
        };

        let destination = ConnectionConfig {
            api_key: env::var("TRACEHUB_NEW_API_KEY").unwrap_or_default(),
            base_url: env::var("TRACEHUB_NEW_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            verify_tls,
            ..ConnectionConfig::default()
        };

        let migration = MigrationConfig {
            batch_size: env_parse("MIGRATION_BATCH_SIZE", 100),
            concurrent_workers: env_parse("MIGRATION_WORKERS", 4),
            dry_run: env_bool("MIGRATION_DRY_RUN", false),
            verbose: env_bool("MIGRATION_VERBOSE", false),
            skip_existing: env_bool("MIGRATION_SKIP_EXISTING", true),
            stream_examples: env_bool("MIGRATION_STREAM_EXAMPLES", true),
            chunk_size: env_parse("MIGRATION_CHUNK_SIZE", 1000),
            rate_limit_delay: env_parse("MIGRATION_RATE_LIMIT_DELAY", 0.1),
            ..MigrationConfig::default()
        };

        Config {
            source,
            destination,
            migration,
        }
    }

    /// Validate the configuration, returning every rejection at once.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.source.api_key.is_empty() {
            errors.push("source API key is required (TRACEHUB_OLD_API_KEY)".to_string());
        }
        if self.destination.api_key.is_empty() {
            errors.push("destination API key is required (TRACEHUB_NEW_API_KEY)".to_string());
        }
        if self.migration.batch_size == 0 {
            errors.push("batch size must be positive".to_string());
        }
        if self.migration.batch_size > MAX_BATCH_SIZE {
            errors.push(format!(
                "batch size must not exceed {} (got {})",
                MAX_BATCH_SIZE, self.migration.batch_size
            ));
        }
        if self.migration.concurrent_workers == 0 {
            errors.push("concurrent workers must be positive".to_string());
        }
        if self.migration.concurrent_workers > MAX_WORKERS {
            errors.push(format!(
                "concurrent workers must not exceed {} (got {})",
                MAX_WORKERS, self.migration.concurrent_workers
            ));
        }
        if self.migration.rate_limit_delay < 0.0 {
            errors.push("rate limit delay must not be negative".to_string());
        }
        if self.migration.chunk_size == 0 {
            errors.push("chunk size must be positive".to_string());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => {
            let v = v.to_ascii_lowercase();
            if default {
                v != "false" && v != "0" && v != "no"
            } else {
                v == "true" || v == "1" || v == "yes"
            }
        }
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.source.api_key = "src-key".to_string();
        config.destination.api_key = "dst-key".to_string();
        config
    }

    #[test]
    fn test_api_base_normalization() {
        assert_eq!(
            normalize_api_base("https://host.example.com"),
            "https://host.example.com/api/v1"
        );
        assert_eq!(
            normalize_api_base("https://host.example.com/"),
            "https://host.example.com/api/v1"
        );
        assert_eq!(
            normalize_api_base("https://host.example.com/api/v1"),
            "https://host.example.com/api/v1"
        );
        assert_eq!(
            normalize_api_base("https://host.example.com/api/v2/"),
            "https://host.example.com/api/v2"
        );
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.migration.batch_size = 5000;
        config.migration.concurrent_workers = 0;

        let errors = config.validate().unwrap_err();
        // missing both keys + batch size + workers
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn test_validate_accepts_defaults_with_keys() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_oversized_pool() {
        let mut config = valid_config();
        config.migration.concurrent_workers = 64;
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("workers"));
    }
}
