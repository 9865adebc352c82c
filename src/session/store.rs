//! Session persistence.
//!
//! One JSON file per session under `~/.trace-migrate/state/`, created on
//! first save. Reads are snapshots; writes replace the whole file so a
//! partially written session is never observable. Derived statistics are
//! embedded at save time purely so `list_sessions` can show progress without
//! replaying every item; they are recomputed from the items whenever the
//! state itself is loaded.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::SessionState;
use crate::errors::MigrateError;

const SESSION_PREFIX: &str = "migration_";

/// Summary row for the session listing.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub source_url: String,
    pub destination_url: String,
    /// Statistics as saved with the file; informational only.
    pub statistics: Option<Value>,
}

pub struct SessionStore {
    state_dir: PathBuf,
}

impl SessionStore {
    /// Store rooted at the default per-user state directory.
    pub fn new() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            state_dir: home.join(".trace-migrate").join("state"),
        }
    }

    /// Store rooted at an explicit directory (tests, alternate homes).
    pub fn with_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &PathBuf {
        &self.state_dir
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.state_dir.join(format!("{session_id}.json"))
    }

    /// Start a new session keyed by the current unix timestamp.
    pub fn create_session(&self, source_url: &str, destination_url: &str) -> SessionState {
        let session_id = format!("{}{}", SESSION_PREFIX, Utc::now().timestamp());
        SessionState::new(session_id, source_url, destination_url)
    }

    /// Persist the state, replacing any previous file for this session.
    pub fn save(&self, state: &SessionState) -> Result<(), MigrateError> {
        fs::create_dir_all(&self.state_dir)?;

        let mut body = serde_json::to_value(state)
            .map_err(|e| MigrateError::State(format!("serialize session: {e}")))?;
        if let Value::Object(map) = &mut body {
            let stats = serde_json::to_value(state.statistics())
                .map_err(|e| MigrateError::State(format!("serialize statistics: {e}")))?;
            map.insert("statistics".to_string(), stats);
        }
        let rendered = serde_json::to_string_pretty(&body)
            .map_err(|e| MigrateError::State(format!("render session: {e}")))?;

        fs::write(self.session_path(&state.session_id), rendered)?;
        Ok(())
    }

    /// Load a session by ID; `None` when no file exists for it.
    pub fn load_session(&self, session_id: &str) -> Result<Option<SessionState>, MigrateError> {
        let path = self.session_path(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let state = serde_json::from_str(&raw)
            .map_err(|e| MigrateError::State(format!("parse session {session_id}: {e}")))?;
        Ok(Some(state))
    }

    /// List saved sessions, most recently updated first. Unreadable files
    /// are skipped with a warning rather than failing the listing.
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>, MigrateError> {
        let mut summaries = Vec::new();
        let entries = match fs::read_dir(&self.state_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(summaries),
            Err(err) => return Err(err.into()),
        };

        for entry in entries {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with(SESSION_PREFIX) || !name.ends_with(".json") {
                continue;
            }
            let raw = match fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(err) => {
                    tracing::warn!("skipping unreadable session file {:?}: {}", path, err);
                    continue;
                }
            };
            let body: Value = match serde_json::from_str(&raw) {
                Ok(body) => body,
                Err(err) => {
                    tracing::warn!("skipping corrupt session file {:?}: {}", path, err);
                    continue;
                }
            };
            summaries.push(SessionSummary {
                session_id: body
                    .get("session_id")
                    .and_then(Value::as_str)
                    .unwrap_or_else(|| name.trim_end_matches(".json"))
                    .to_string(),
                started_at: parse_timestamp(body.get("started_at")),
                updated_at: parse_timestamp(body.get("updated_at")),
                source_url: body
                    .get("source_url")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                destination_url: body
                    .get("destination_url")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                statistics: body.get("statistics").cloned(),
            });
        }

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    /// Delete a session file; `false` when it did not exist.
    pub fn delete_session(&self, session_id: &str) -> Result<bool, MigrateError> {
        let path = self.session_path(session_id);
        if path.exists() {
            fs::remove_file(path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<DateTime<Utc>>().ok())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::resource::ResourceKind;
    use crate::session::{MigrationItem, MigrationStatus};

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let store = SessionStore::with_dir(dir.path());

        let mut state = store.create_session("https://old", "https://new");
        state.add_item(MigrationItem::new(ResourceKind::Dataset, "src-1", "x"));
        state.update_item(
            "dataset_src-1",
            MigrationStatus::Completed,
            Some("dst-1"),
            None,
        );
        store.save(&state).expect("save");

        let loaded = store
            .load_session(&state.session_id)
            .expect("load")
            .expect("present");
        assert_eq!(loaded.session_id, state.session_id);
        assert_eq!(
            loaded.mapped(ResourceKind::Dataset, "src-1").as_deref(),
            Some("dst-1")
        );
        assert_eq!(loaded.items.len(), 1);
    }

    #[test]
    fn test_missing_session_is_none() {
        let dir = TempDir::new().expect("tempdir");
        let store = SessionStore::with_dir(dir.path());
        assert!(
            store
                .load_session("migration_0")
                .expect("load")
                .is_none()
        );
    }

    #[test]
    fn test_list_and_delete() {
        let dir = TempDir::new().expect("tempdir");
        let store = SessionStore::with_dir(dir.path());

        let first = store.create_session("https://old", "https://new");
        store.save(&first).expect("save");
        let mut second =
            SessionState::new("migration_9999999999".to_string(), "https://old", "https://new");
        second.updated_at = Utc::now() + chrono::Duration::seconds(5);
        store.save(&second).expect("save");

        let listed = store.list_sessions().expect("list");
        assert_eq!(listed.len(), 2);
        // Most recently updated first.
        assert_eq!(listed[0].session_id, "migration_9999999999");
        assert!(listed[0].statistics.is_some());

        assert!(store.delete_session(&first.session_id).expect("delete"));
        assert!(!store.delete_session(&first.session_id).expect("delete"));
        assert_eq!(store.list_sessions().expect("list").len(), 1);
    }

    #[test]
    fn test_corrupt_file_skipped_in_listing() {
        let dir = TempDir::new().expect("tempdir");
        let store = SessionStore::with_dir(dir.path());
        let state = store.create_session("https://old", "https://new");
        store.save(&state).expect("save");
        std::fs::write(dir.path().join("migration_bad.json"), "{not json").expect("write");

        assert_eq!(store.list_sessions().expect("list").len(), 1);
    }
}
