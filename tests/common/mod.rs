//! Shared fixtures for the integration suites: a configuration pointing at
//! mock servers, with request pacing disabled so the suites run fast.

#![allow(dead_code)]

use tempfile::TempDir;
use trace_migrate::config::Config;
use trace_migrate::migrate::MigrationContext;
use trace_migrate::session::SessionStore;

pub fn test_config(source_url: &str, dest_url: &str) -> Config {
    let mut config = Config::default();
    config.source.api_key = "source-test-key".to_string();
    config.source.base_url = source_url.to_string();
    config.destination.api_key = "dest-test-key".to_string();
    config.destination.base_url = dest_url.to_string();
    config.migration.rate_limit_delay = 0.0;
    config
}

/// A context whose session store writes into a throwaway directory. The
/// `TempDir` guard must outlive the context.
pub fn test_context(
    source_url: &str,
    dest_url: &str,
) -> (std::sync::Arc<MigrationContext>, TempDir) {
    let dir = TempDir::new().expect("tempdir");
    let store = SessionStore::with_dir(dir.path());
    let ctx = MigrationContext::new(test_config(source_url, dest_url), store).expect("context");
    (std::sync::Arc::new(ctx), dir)
}
