//! The resource-graph migration engine.
//!
//! One migrator per resource kind, sharing the upsert contract
//! ([`ResourceMigrator`]) and a common [`MigrationContext`] that owns the two
//! HTTP clients, the configuration, and the session state behind a single
//! coarse lock. The [`orchestrator`] composes the kind migrators, fanning
//! datasets out across a bounded worker pool and sequencing the cross-kind
//! phases so every foreign key is rewritten through an already-populated
//! ID-map.
//!
//! # Migration Flow
//!
//! ```text
//!  ①  Datasets ──── examples stream with it (hash-indexed upsert,
//!        │          attachment staging via presigned URLs)
//!        ▼
//!  ②  Experiments  (per dataset, needs dataset map)
//!        │
//!        ▼
//!  ③  Runs         (per experiment, sorted by dotted_order so parents
//!        │          land before children; trace IDs rewritten)
//!        ▼
//!  ④  Feedback     (per experiment, needs run map)
//!
//!  ⑤  Prompts      (independent; commit DAG replayed root→tip)
//!  ⑥  Queues       (independent)
//!  ⑦  Rules        (needs project + dataset maps)
//!  ⑧  Charts       (needs project + dataset + section maps)
//! ```

pub mod attachment;
pub mod chart;
pub mod dataset;
pub mod experiment;
pub mod feedback;
pub mod orchestrator;
pub mod prompt;
pub mod queue;
pub mod rule;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::client::ApiClient;
use crate::config::Config;
use crate::errors::MigrateError;
use crate::resource::ResourceKind;
use crate::session::{MigrationItem, MigrationStatus, SessionState, SessionStore};

/// What the upsert actually did on the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Created,
    Updated,
    SkippedExisting,
}

/// Result of migrating one resource.
#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub destination_id: String,
    pub action: UpsertAction,
}

impl MigrationOutcome {
    pub fn created(destination_id: impl Into<String>) -> Self {
        Self {
            destination_id: destination_id.into(),
            action: UpsertAction::Created,
        }
    }

    pub fn updated(destination_id: impl Into<String>) -> Self {
        Self {
            destination_id: destination_id.into(),
            action: UpsertAction::Updated,
        }
    }

    pub fn skipped_existing(destination_id: impl Into<String>) -> Self {
        Self {
            destination_id: destination_id.into(),
            action: UpsertAction::SkippedExisting,
        }
    }
}

/// Shared contract every kind migrator offers.
///
/// `list` is the listing any selector front-end consumes; `find_existing`
/// resolves the kind's matching key on the destination; `migrate` performs
/// the composed upsert for one source resource, recursing into children.
/// Policy skips surface as `MigrateError::Skipped` /
/// `MigrateError::UnmappedReference`, which the orchestrator records as
/// Skipped rather than Failed.
#[async_trait]
pub trait ResourceMigrator: Send + Sync {
    fn kind(&self) -> ResourceKind;

    async fn list(&self) -> Result<Vec<Value>, MigrateError>;

    async fn find_existing(
        &self,
        name: &str,
        scope: Option<&str>,
    ) -> Result<Option<String>, MigrateError>;

    async fn migrate(&self, source_id: &str) -> Result<MigrationOutcome, MigrateError>;
}

/// Everything a migrator needs, passed explicitly instead of living in
/// process-wide singletons: configuration, the two transports, the session
/// store, and the mutable session state behind one coarse lock.
pub struct MigrationContext {
    pub config: Config,
    pub source: ApiClient,
    pub dest: ApiClient,
    pub store: SessionStore,
    state: Mutex<SessionState>,
}

impl MigrationContext {
    /// Build a context with a fresh session.
    pub fn new(config: Config, store: SessionStore) -> Result<Self, MigrateError> {
        let state = store.create_session(&config.source.base_url, &config.destination.base_url);
        Self::with_state(config, store, state)
    }

    /// Build a context around an existing (resumed) session.
    pub fn with_state(
        config: Config,
        store: SessionStore,
        state: SessionState,
    ) -> Result<Self, MigrateError> {
        let source = ApiClient::new(&config.source, &config.migration)?;
        let dest = ApiClient::new(&config.destination, &config.migration)?;
        Ok(Self {
            config,
            source,
            dest,
            store,
            state: Mutex::new(state),
        })
    }

    pub fn dry_run(&self) -> bool {
        self.config.migration.dry_run
    }

    pub fn skip_existing(&self) -> bool {
        self.config.migration.skip_existing
    }

    pub fn batch_size(&self) -> usize {
        self.config.migration.batch_size
    }

    pub async fn session_id(&self) -> String {
        self.state.lock().await.session_id.clone()
    }

    /// Write the whole session file under the lock.
    pub async fn save_state(&self) -> Result<(), MigrateError> {
        let state = self.state.lock().await;
        self.store.save(&state)
    }

    pub async fn add_item(&self, item: MigrationItem) {
        let mut state = self.state.lock().await;
        state.add_item(item);
    }

    /// Advance an item and persist the session in one critical section.
    pub async fn update_item(
        &self,
        item_id: &str,
        status: MigrationStatus,
        destination_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), MigrateError> {
        let mut state = self.state.lock().await;
        state.update_item(item_id, status, destination_id, error);
        self.store.save(&state)
    }

    pub async fn record_mapping(&self, kind: ResourceKind, source_id: &str, dest_id: &str) {
        let mut state = self.state.lock().await;
        state.record_mapping(kind, source_id, dest_id);
    }

    /// Merge a batch of pairs into one kind's map under the lock.
    pub async fn merge_mappings(&self, kind: ResourceKind, pairs: &HashMap<String, String>) {
        let mut state = self.state.lock().await;
        state.merge_mappings(kind, pairs);
    }

    pub async fn mapped(&self, kind: ResourceKind, source_id: &str) -> Option<String> {
        self.state.lock().await.mapped(kind, source_id)
    }

    /// Clone one kind's map out of the lock for read-heavy phases.
    pub async fn mapping_snapshot(&self, kind: ResourceKind) -> HashMap<String, String> {
        self.state
            .lock()
            .await
            .mapping(kind)
            .cloned()
            .unwrap_or_default()
    }

    /// Run a closure against the locked state.
    pub async fn with_state_mut<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut state = self.state.lock().await;
        f(&mut state)
    }
}

/// Per-kind `{created, updated, skipped, failed}` counters for the trailing
/// summary.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct KindReport {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub by_kind: HashMap<ResourceKind, KindReport>,
}

impl MigrationReport {
    pub fn record_outcome(&mut self, kind: ResourceKind, action: UpsertAction) {
        let counts = self.by_kind.entry(kind).or_default();
        match action {
            UpsertAction::Created => counts.created += 1,
            UpsertAction::Updated => counts.updated += 1,
            UpsertAction::SkippedExisting => counts.skipped += 1,
        }
    }

    pub fn record_skip(&mut self, kind: ResourceKind) {
        self.by_kind.entry(kind).or_default().skipped += 1;
    }

    pub fn record_failure(&mut self, kind: ResourceKind) {
        self.by_kind.entry(kind).or_default().failed += 1;
    }

    pub fn record_created(&mut self, kind: ResourceKind, count: usize) {
        self.by_kind.entry(kind).or_default().created += count;
    }

    pub fn merge(&mut self, other: &MigrationReport) {
        for (kind, counts) in &other.by_kind {
            let mine = self.by_kind.entry(*kind).or_default();
            mine.created += counts.created;
            mine.updated += counts.updated;
            mine.skipped += counts.skipped;
            mine.failed += counts.failed;
        }
    }

    pub fn failed_total(&self) -> usize {
        self.by_kind.values().map(|c| c.failed).sum()
    }
}

/// Drop top-level null fields from an object payload. The platform rejects
/// explicit nulls on several write endpoints.
pub(crate) fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .collect(),
        ),
        other => other,
    }
}

/// Recursively drop null fields from objects and null elements from arrays.
/// Evaluator sub-objects come back from the API with `"prompt": null`-style
/// fields that fail validation when sent back.
pub(crate) fn clean_nulls_deep(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, clean_nulls_deep(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .filter(|v| !v.is_null())
                .map(clean_nulls_deep)
                .collect(),
        ),
        other => other,
    }
}

/// Borrow a string field off a JSON object.
pub(crate) fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// Build a source-ID -> destination-ID map for a listing endpoint by
/// matching record names across the two instances. Names are the matching
/// key for every kind; an unmatched source record simply stays unmapped.
pub(crate) async fn build_name_map(
    source: &ApiClient,
    dest: &ApiClient,
    path: &str,
) -> Result<HashMap<String, String>, MigrateError> {
    let source_records = source.paginate(path, Vec::new(), 100).collect().await?;
    let dest_records = dest.paginate(path, Vec::new(), 100).collect().await?;

    let dest_by_name: HashMap<&str, &str> = dest_records
        .iter()
        .filter_map(|r| Some((str_field(r, "name")?, str_field(r, "id")?)))
        .collect();

    let mut map = HashMap::new();
    for record in &source_records {
        let (Some(name), Some(source_id)) = (str_field(record, "name"), str_field(record, "id"))
        else {
            continue;
        };
        if let Some(dest_id) = dest_by_name.get(name) {
            map.insert(source_id.to_string(), (*dest_id).to_string());
        }
    }
    Ok(map)
}

/// The display name of a record: `name`, falling back to `display_name`.
pub(crate) fn record_name(value: &Value) -> &str {
    str_field(value, "name")
        .or_else(|| str_field(value, "display_name"))
        .unwrap_or("unnamed")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_strip_nulls_top_level_only() {
        let cleaned = strip_nulls(json!({
            "name": "x",
            "description": null,
            "nested": {"keep": null}
        }));
        assert_eq!(cleaned, json!({"name": "x", "nested": {"keep": null}}));
    }

    #[test]
    fn test_clean_nulls_deep() {
        let cleaned = clean_nulls_deep(json!({
            "structured": {"prompt": null, "hub_ref": "o/r:latest"},
            "list": [null, {"schema": null, "keep": 1}]
        }));
        assert_eq!(
            cleaned,
            json!({
                "structured": {"hub_ref": "o/r:latest"},
                "list": [{"keep": 1}]
            })
        );
    }

    #[test]
    fn test_report_accumulation() {
        let mut report = MigrationReport::default();
        report.record_outcome(ResourceKind::Dataset, UpsertAction::Created);
        report.record_outcome(ResourceKind::Dataset, UpsertAction::SkippedExisting);
        report.record_failure(ResourceKind::Rule);

        let mut total = MigrationReport::default();
        total.merge(&report);
        assert_eq!(total.by_kind[&ResourceKind::Dataset].created, 1);
        assert_eq!(total.by_kind[&ResourceKind::Dataset].skipped, 1);
        assert_eq!(total.failed_total(), 1);
    }
}
