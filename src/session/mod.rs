//! Migration session state.
//!
//! A session records every item the operator selected for migration, its
//! current status, and the cross-kind ID-map table that rewrites foreign
//! keys. The state is a plain serde object persisted as one JSON file per
//! session (see [`store`]); statistics are always derived from the items on
//! read, never trusted from disk.
//!
//! # Status Transitions
//!
//! ```text
//! Pending ──▶ InProgress ──▶ Completed
//!                 │
//!                 ├──▶ Failed   (eligible for resume, up to the attempt
//!                 │              ceiling)
//!                 └──▶ Skipped  (policy outcome, terminal)
//! ```

pub mod store;

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::resource::ResourceKind;

pub use store::{SessionStore, SessionSummary};

/// Attempt ceiling for resumed items.
pub const MAX_ATTEMPTS: u32 = 3;

/// Lifecycle status of a migration item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Selected but not yet picked up by a worker.
    Pending,
    /// A worker is migrating it right now. Items left in this state by an
    /// interrupted process are treated as pending on resume.
    InProgress,
    /// Written (or confirmed present) on the destination.
    Completed,
    /// The last attempt failed; `error` holds the reason.
    Failed,
    /// Deliberately not written (policy or unmapped dependency).
    Skipped,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::InProgress => "in_progress",
            MigrationStatus::Completed => "completed",
            MigrationStatus::Failed => "failed",
            MigrationStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One selected resource and its migration progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationItem {
    /// Stable item key, `<kind>_<source_id>`.
    pub id: String,
    pub kind: ResourceKind,
    pub name: String,
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_id: Option<String>,
    pub status: MigrationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
}

impl MigrationItem {
    pub fn new(kind: ResourceKind, source_id: &str, name: &str) -> Self {
        Self {
            id: format!("{}_{}", kind.as_str(), source_id),
            kind,
            name: name.to_string(),
            source_id: source_id.to_string(),
            destination_id: None,
            status: MigrationStatus::Pending,
            error: None,
            attempts: 0,
            last_attempt: None,
            metadata: serde_json::Map::new(),
        }
    }
}

/// Per-kind status counts.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct KindCounts {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub skipped: usize,
}

/// Derived view over a session's items; computed on read, never stored as
/// authority.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatistics {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub skipped: usize,
    pub by_kind: HashMap<ResourceKind, KindCounts>,
    pub completion_percentage: f64,
    pub elapsed_seconds: f64,
}

/// The persisted state of one migration session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source_url: String,
    pub destination_url: String,
    #[serde(default)]
    pub items: HashMap<String, MigrationItem>,
    /// kind -> { source_id -> destination_id }
    #[serde(default)]
    pub id_maps: HashMap<ResourceKind, HashMap<String, String>>,
}

impl SessionState {
    pub fn new(session_id: String, source_url: &str, destination_url: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            started_at: now,
            updated_at: now,
            source_url: source_url.to_string(),
            destination_url: destination_url.to_string(),
            items: HashMap::new(),
            id_maps: HashMap::new(),
        }
    }

    /// Register an item for processing. Re-adding a known item re-queues it
    /// as Pending but keeps its attempt history, so the resume ceiling keeps
    /// counting across restarts.
    pub fn add_item(&mut self, item: MigrationItem) {
        match self.items.get_mut(&item.id) {
            Some(existing) => existing.status = MigrationStatus::Pending,
            None => {
                self.items.insert(item.id.clone(), item);
            }
        }
        self.updated_at = Utc::now();
    }

    /// Advance an item's status, recording the destination ID in the ID-map
    /// table when one is supplied.
    pub fn update_item(
        &mut self,
        item_id: &str,
        status: MigrationStatus,
        destination_id: Option<&str>,
        error: Option<&str>,
    ) {
        let Some(item) = self.items.get_mut(item_id) else {
            tracing::warn!("status update for unknown item {}", item_id);
            return;
        };
        item.status = status;
        item.attempts += 1;
        item.last_attempt = Some(Utc::now());
        if let Some(error) = error {
            item.error = Some(error.to_string());
        }
        if let Some(dest) = destination_id {
            item.destination_id = Some(dest.to_string());
            let kind = item.kind;
            let source_id = item.source_id.clone();
            self.id_maps
                .entry(kind)
                .or_default()
                .insert(source_id, dest.to_string());
        }
        self.updated_at = Utc::now();
    }

    /// Record one source -> destination pair in the ID-map table.
    pub fn record_mapping(&mut self, kind: ResourceKind, source_id: &str, dest_id: &str) {
        self.id_maps
            .entry(kind)
            .or_default()
            .insert(source_id.to_string(), dest_id.to_string());
        self.updated_at = Utc::now();
    }

    /// Merge a batch of pairs into one kind's map. Existing entries are
    /// overwritten pair-wise; the map itself is never replaced wholesale.
    pub fn merge_mappings(&mut self, kind: ResourceKind, pairs: &HashMap<String, String>) {
        if pairs.is_empty() {
            return;
        }
        let map = self.id_maps.entry(kind).or_default();
        for (source_id, dest_id) in pairs {
            map.insert(source_id.clone(), dest_id.clone());
        }
        self.updated_at = Utc::now();
    }

    pub fn mapping(&self, kind: ResourceKind) -> Option<&HashMap<String, String>> {
        self.id_maps.get(&kind)
    }

    pub fn mapped(&self, kind: ResourceKind, source_id: &str) -> Option<String> {
        self.id_maps.get(&kind)?.get(source_id).cloned()
    }

    pub fn pending_items(&self, kind: Option<ResourceKind>) -> Vec<MigrationItem> {
        self.items
            .values()
            .filter(|item| item.status == MigrationStatus::Pending)
            .filter(|item| kind.is_none_or(|k| item.kind == k))
            .cloned()
            .collect()
    }

    /// Failed items still under the attempt ceiling.
    pub fn failed_items(&self, max_attempts: u32) -> Vec<MigrationItem> {
        self.items
            .values()
            .filter(|item| item.status == MigrationStatus::Failed && item.attempts < max_attempts)
            .cloned()
            .collect()
    }

    /// A session can be resumed while it still has pending or failed items.
    pub fn is_resumable(&self) -> bool {
        self.items.values().any(|item| {
            item.status == MigrationStatus::Pending
                || item.status == MigrationStatus::InProgress
                || (item.status == MigrationStatus::Failed && item.attempts < MAX_ATTEMPTS)
        })
    }

    pub fn statistics(&self) -> SessionStatistics {
        let mut stats = SessionStatistics {
            total: self.items.len(),
            completed: 0,
            failed: 0,
            pending: 0,
            in_progress: 0,
            skipped: 0,
            by_kind: HashMap::new(),
            completion_percentage: 0.0,
            elapsed_seconds: (self.updated_at - self.started_at).num_milliseconds() as f64
                / 1000.0,
        };

        for item in self.items.values() {
            let counts = stats.by_kind.entry(item.kind).or_default();
            counts.total += 1;
            match item.status {
                MigrationStatus::Completed => {
                    stats.completed += 1;
                    counts.completed += 1;
                }
                MigrationStatus::Failed => {
                    stats.failed += 1;
                    counts.failed += 1;
                }
                MigrationStatus::Pending => {
                    stats.pending += 1;
                    counts.pending += 1;
                }
                MigrationStatus::InProgress => {
                    stats.in_progress += 1;
                    counts.in_progress += 1;
                }
                MigrationStatus::Skipped => {
                    stats.skipped += 1;
                    counts.skipped += 1;
                }
            }
        }

        if stats.total > 0 {
            stats.completion_percentage =
                (stats.completed + stats.skipped) as f64 / stats.total as f64 * 100.0;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SessionState {
        SessionState::new(
            "migration_1700000000".to_string(),
            "https://old.example.com",
            "https://new.example.com",
        )
    }

    #[test]
    fn test_update_records_mapping() {
        let mut state = state();
        state.add_item(MigrationItem::new(ResourceKind::Dataset, "src-1", "x"));

        state.update_item(
            "dataset_src-1",
            MigrationStatus::Completed,
            Some("dst-1"),
            None,
        );

        assert_eq!(
            state.mapped(ResourceKind::Dataset, "src-1").as_deref(),
            Some("dst-1")
        );
        let item = &state.items["dataset_src-1"];
        assert_eq!(item.status, MigrationStatus::Completed);
        assert_eq!(item.attempts, 1);
    }

    #[test]
    fn test_merge_does_not_replace() {
        let mut state = state();
        state.record_mapping(ResourceKind::Example, "a", "a2");

        let mut more = HashMap::new();
        more.insert("b".to_string(), "b2".to_string());
        state.merge_mappings(ResourceKind::Example, &more);

        let map = state.mapping(ResourceKind::Example).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["a"], "a2");
        assert_eq!(map["b"], "b2");
    }

    #[test]
    fn test_resumable_definition() {
        let mut state = state();
        assert!(!state.is_resumable());

        state.add_item(MigrationItem::new(ResourceKind::Dataset, "src-1", "x"));
        assert!(state.is_resumable());

        state.update_item(
            "dataset_src-1",
            MigrationStatus::Completed,
            Some("dst-1"),
            None,
        );
        assert!(!state.is_resumable());

        state.add_item(MigrationItem::new(ResourceKind::Dataset, "src-2", "y"));
        state.update_item(
            "dataset_src-2",
            MigrationStatus::Failed,
            None,
            Some("boom"),
        );
        assert!(state.is_resumable());
    }

    #[test]
    fn test_failed_items_respect_attempt_ceiling() {
        let mut state = state();
        state.add_item(MigrationItem::new(ResourceKind::Dataset, "src-1", "x"));
        for _ in 0..3 {
            state.update_item("dataset_src-1", MigrationStatus::Failed, None, Some("boom"));
        }
        assert!(state.failed_items(MAX_ATTEMPTS).is_empty());
        assert_eq!(state.failed_items(10).len(), 1);
    }

    #[test]
    fn test_statistics_completion() {
        let mut state = state();
        state.add_item(MigrationItem::new(ResourceKind::Dataset, "a", "a"));
        state.add_item(MigrationItem::new(ResourceKind::Dataset, "b", "b"));
        state.update_item("dataset_a", MigrationStatus::Completed, Some("a2"), None);
        state.update_item("dataset_b", MigrationStatus::Skipped, None, None);

        let stats = state.statistics();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.skipped, 1);
        assert!((stats.completion_percentage - 100.0).abs() < f64::EPSILON);
        assert_eq!(stats.by_kind[&ResourceKind::Dataset].total, 2);
    }
}
