//! Experiment and run migration.
//!
//! Experiments (the platform calls them "sessions") match by
//! `(name, reference_dataset)`. Their free-form `extra` object may embed
//! evaluator configurations that the destination validates strictly, so
//! missing `type`/`feedback_key` fields are inferred before write.
//!
//! Runs are the tricky part: they form trees keyed by `parent_run_id`, share
//! their root's ID as `trace_id`, and carry a `dotted_order` lineage string
//! whose last segment's UUID must equal the run's own ID. Source runs are
//! sorted by `dotted_order` so parents are always written before children,
//! every run gets a fresh UUID, and the lineage string is regenerated
//! segment by segment through the accumulated ID-map.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::{
    MigrationContext, MigrationOutcome, ResourceMigrator, record_name, str_field, strip_nulls,
};
use crate::canonical::fingerprint;
use crate::errors::MigrateError;
use crate::resource::ResourceKind;

/// Locations inside `extra` where evaluator lists appear.
const EVALUATOR_KEYS: [&str; 3] = [
    "evaluators",
    "comparative_experiment_evaluators",
    "dataset_evaluators",
];

/// Outcome of a run migration pass.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub migrated: usize,
    pub skipped: usize,
    /// source run ID -> destination run ID
    pub mapping: HashMap<String, String>,
}

/// Rebuild a `dotted_order` lineage string against new run IDs.
///
/// Each dot-separated segment is `{timestamp}Z{uuid}`. Earlier segments map
/// their UUID through `id_map` (falling back to the original when unmapped);
/// the last segment is forced to `new_run_id` because the platform requires
/// it to equal the run's own ID.
pub fn regenerate_dotted_order(
    dotted_order: &str,
    id_map: &HashMap<String, String>,
    new_run_id: &str,
) -> String {
    let parts: Vec<&str> = dotted_order.split('.').collect();
    let last = parts.len().saturating_sub(1);
    let mut rebuilt = Vec::with_capacity(parts.len());

    for (i, part) in parts.iter().enumerate() {
        let Some(z_idx) = part.rfind('Z').filter(|idx| idx + 1 < part.len()) else {
            // No UUID portion to rewrite; keep the segment untouched.
            rebuilt.push((*part).to_string());
            continue;
        };
        let (timestamp, old_uuid) = part.split_at(z_idx + 1);
        if i == last {
            rebuilt.push(format!("{timestamp}{new_run_id}"));
        } else {
            let mapped = id_map
                .get(old_uuid)
                .map(String::as_str)
                .unwrap_or(old_uuid);
            rebuilt.push(format!("{timestamp}{mapped}"));
        }
    }
    rebuilt.join(".")
}

/// Infer an evaluator `type` from marker fields. `None` means nothing
/// recognizable was present.
fn infer_evaluator_type(evaluator: &Map<String, Value>) -> Option<String> {
    for key in ["evaluator_type", "eval_type", "__type__"] {
        if let Some(explicit) = evaluator.get(key).and_then(Value::as_str) {
            if !explicit.is_empty() {
                return Some(explicit.to_string());
            }
        }
    }
    let code_markers = ["code", "function", "func", "source_code", "python_code"];
    if code_markers.iter().any(|k| evaluator.contains_key(*k)) {
        return Some("Code".to_string());
    }
    let llm_markers = ["llm", "model", "model_name", "llm_config", "prompt_template"];
    if llm_markers.iter().any(|k| evaluator.contains_key(*k)) {
        return Some("LLM".to_string());
    }
    if let Some(class_name) = evaluator.get("__class__") {
        let class_name = class_name.to_string().to_ascii_lowercase();
        if class_name.contains("llm") || class_name.contains("chat") || class_name.contains("model")
        {
            return Some("LLM".to_string());
        }
        return Some("Code".to_string());
    }
    None
}

/// Infer an evaluator `feedback_key` from naming fields.
fn infer_feedback_key(evaluator: &Map<String, Value>) -> Option<String> {
    for key in ["key", "name", "feedback_name", "metric_name"] {
        if let Some(value) = evaluator.get(key).and_then(Value::as_str) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    evaluator
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Ensure every evaluator embedded in an experiment's `extra` carries the
/// `type` and `feedback_key` fields the destination validates. Inference is
/// heuristic; the ambiguous default is "Code" and is always warned about so
/// operators can audit it.
pub fn normalize_evaluators(extra: Option<&Value>) -> Option<Value> {
    let mut extra = extra?.clone();
    if !extra.is_object() {
        return Some(extra);
    }
    let root = extra.as_object_mut()?;

    for key in EVALUATOR_KEYS {
        let Some(Value::Array(evaluators)) = root.get_mut(key) else {
            continue;
        };
        for entry in evaluators.iter_mut() {
            let Some(evaluator) = entry.as_object_mut() else {
                continue;
            };

            let missing_type = evaluator
                .get("type")
                .and_then(Value::as_str)
                .is_none_or(str::is_empty);
            if missing_type {
                let inferred = match infer_evaluator_type(evaluator) {
                    Some(inferred) => inferred,
                    None => {
                        let evaluator_name = evaluator
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or("unnamed");
                        tracing::warn!(
                            "evaluator '{}' has no recognizable type markers, defaulting to 'Code'",
                            evaluator_name
                        );
                        "Code".to_string()
                    }
                };
                evaluator.insert("type".to_string(), Value::String(inferred));
            }

            let missing_key = evaluator
                .get("feedback_key")
                .and_then(Value::as_str)
                .is_none_or(str::is_empty);
            if missing_key {
                let inferred = infer_feedback_key(evaluator).unwrap_or_else(|| {
                    let synthetic = match evaluator.get("name").and_then(Value::as_str) {
                        Some(name) => format!("{name}_key"),
                        None => {
                            let digest = fingerprint(&Value::Object(evaluator.clone()));
                            format!("evaluator_{}", &digest[..8])
                        }
                    };
                    tracing::warn!(
                        "evaluator missing feedback_key, generated '{}'",
                        synthetic
                    );
                    synthetic
                });
                evaluator.insert("feedback_key".to_string(), Value::String(inferred));
            }
        }
    }

    Some(extra)
}

pub struct ExperimentMigrator {
    ctx: Arc<MigrationContext>,
}

impl ExperimentMigrator {
    pub fn new(ctx: Arc<MigrationContext>) -> Self {
        Self { ctx }
    }

    /// List a dataset's experiments with full details (the listing endpoint
    /// omits `extra`, which is where evaluators live).
    pub async fn list_experiments(&self, dataset_id: &str) -> Result<Vec<Value>, MigrateError> {
        let query = vec![("reference_dataset".to_string(), dataset_id.to_string())];
        let summaries = self
            .ctx
            .source
            .paginate("/sessions", query, 100)
            .collect()
            .await?;

        let mut experiments = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(id) = str_field(&summary, "id") else {
                experiments.push(summary);
                continue;
            };
            match self.ctx.source.get(&format!("/sessions/{id}"), &[]).await {
                Ok(full) => experiments.push(full),
                Err(err) => {
                    tracing::warn!("falling back to summary for experiment {}: {}", id, err);
                    experiments.push(summary);
                }
            }
        }
        Ok(experiments)
    }

    pub async fn find_existing_experiment(
        &self,
        name: &str,
        dest_dataset_id: &str,
    ) -> Result<Option<String>, MigrateError> {
        let query = vec![("reference_dataset".to_string(), dest_dataset_id.to_string())];
        let mut pager = self.ctx.dest.paginate("/sessions", query, 100);
        while let Some(page) = pager.next_page().await? {
            for experiment in page {
                if str_field(&experiment, "name") == Some(name) {
                    return Ok(experiment
                        .get("id")
                        .and_then(Value::as_str)
                        .map(str::to_string));
                }
            }
        }
        Ok(None)
    }

    pub async fn update_experiment(
        &self,
        experiment_id: &str,
        experiment: &Value,
    ) -> Result<(), MigrateError> {
        if self.ctx.dry_run() {
            tracing::info!(
                "[dry run] would update experiment '{}' ({})",
                record_name(experiment),
                experiment_id
            );
            return Ok(());
        }
        let payload = strip_nulls(json!({
            "name": record_name(experiment),
            "description": experiment.get("description"),
            "extra": normalize_evaluators(experiment.get("extra")),
            "trace_tier": experiment.get("trace_tier"),
        }));
        self.ctx
            .dest
            .patch(&format!("/sessions/{experiment_id}"), &payload)
            .await?;
        Ok(())
    }

    /// Upsert one experiment under an already-mapped destination dataset.
    pub async fn create_experiment(
        &self,
        experiment: &Value,
        dest_dataset_id: &str,
    ) -> Result<MigrationOutcome, MigrateError> {
        let name = record_name(experiment);

        if let Some(existing_id) = self.find_existing_experiment(name, dest_dataset_id).await? {
            if self.ctx.skip_existing() {
                tracing::debug!("experiment '{}' already exists, skipping write", name);
                return Ok(MigrationOutcome::skipped_existing(existing_id));
            }
            self.update_experiment(&existing_id, experiment).await?;
            return Ok(MigrationOutcome::updated(existing_id));
        }

        if self.ctx.dry_run() {
            tracing::info!("[dry run] would create experiment '{}'", name);
            return Ok(MigrationOutcome::created(format!(
                "dry-run-{}",
                str_field(experiment, "id").unwrap_or("experiment")
            )));
        }

        let payload = strip_nulls(json!({
            "name": name,
            "description": experiment.get("description"),
            "reference_dataset_id": dest_dataset_id,
            "start_time": experiment.get("start_time"),
            "end_time": experiment.get("end_time"),
            "extra": normalize_evaluators(experiment.get("extra")),
            "trace_tier": experiment.get("trace_tier"),
        }));

        let response = self.ctx.dest.post("/sessions", &payload).await?;
        let new_id = str_field(&response, "id").ok_or_else(|| {
            MigrateError::protocol("/sessions", "create response carried no `id` field")
        })?;
        Ok(MigrationOutcome::created(new_id))
    }

    /// Migrate runs for the given source experiments.
    ///
    /// Every run receives a fresh UUID; trace IDs and dotted orders are
    /// rewritten through the accumulating run/trace maps, so within one
    /// experiment the source ordering by `dotted_order` guarantees parents
    /// are transformed before their children.
    pub async fn migrate_runs(
        &self,
        experiment_ids: &[String],
        experiment_map: &HashMap<String, String>,
        example_map: &HashMap<String, String>,
    ) -> Result<RunSummary, MigrateError> {
        let mut summary = RunSummary::default();
        if self.ctx.dry_run() {
            tracing::info!("[dry run] would migrate runs");
            return Ok(summary);
        }

        let mut trace_map: HashMap<String, String> = HashMap::new();
        let mut batch: Vec<Value> = Vec::new();
        let batch_size = self.ctx.batch_size();

        for experiment_id in experiment_ids {
            let mut payload = json!({
                "session": [experiment_id],
                "skip_pagination": false,
            });

            loop {
                let response = match self.ctx.source.post("/runs/query", &payload).await {
                    Ok(response) => response,
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        tracing::warn!(
                            "querying runs for experiment {} failed: {}",
                            experiment_id,
                            err
                        );
                        break;
                    }
                };

                let mut runs = response
                    .get("runs")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                if runs.is_empty() {
                    break;
                }

                // Lexicographic order on dotted_order puts every parent
                // before its children.
                runs.sort_by(|a, b| {
                    let a_key = str_field(a, "dotted_order").unwrap_or("");
                    let b_key = str_field(b, "dotted_order").unwrap_or("");
                    a_key.cmp(b_key)
                });

                for run in &runs {
                    match self.transform_run(
                        run,
                        experiment_map,
                        example_map,
                        &mut summary.mapping,
                        &mut trace_map,
                    ) {
                        Some(migrated) => {
                            batch.push(migrated);
                            if batch.len() >= batch_size {
                                summary.migrated += self.create_runs_batch(&mut batch).await?;
                            }
                        }
                        None => summary.skipped += 1,
                    }
                }

                let next_cursor = response
                    .get("cursors")
                    .and_then(|c| c.get("next"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                match next_cursor {
                    Some(cursor) => {
                        payload["cursor"] = Value::String(cursor);
                    }
                    None => break,
                }
            }
        }

        summary.migrated += self.create_runs_batch(&mut batch).await?;

        tracing::debug!(
            "run migration complete: {} migrated, {} skipped",
            summary.migrated,
            summary.skipped
        );
        Ok(summary)
    }

    /// Rewrite one source run for the destination, or `None` when its
    /// experiment was never mapped.
    fn transform_run(
        &self,
        run: &Value,
        experiment_map: &HashMap<String, String>,
        example_map: &HashMap<String, String>,
        run_map: &mut HashMap<String, String>,
        trace_map: &mut HashMap<String, String>,
    ) -> Option<Value> {
        let source_run_id = str_field(run, "id").unwrap_or_default().to_string();
        let source_session_id = str_field(run, "session_id").unwrap_or_default();

        let Some(dest_session_id) = experiment_map.get(source_session_id) else {
            tracing::warn!(
                "skipping run {}: session {} is not in the experiment map",
                source_run_id,
                source_session_id
            );
            return None;
        };

        let source_parent_id = str_field(run, "parent_run_id");
        let mapped_parent = source_parent_id.and_then(|p| run_map.get(p).cloned());

        let new_run_id = Uuid::new_v4().to_string();
        let source_trace_id = str_field(run, "trace_id");

        let new_trace_id = if source_parent_id.is_none() {
            // Root run: trace_id must equal the run's own ID, and children
            // look their trace up through this mapping.
            if let Some(source_trace_id) = source_trace_id {
                trace_map.insert(source_trace_id.to_string(), new_run_id.clone());
            }
            new_run_id.clone()
        } else {
            match source_trace_id.and_then(|t| trace_map.get(t).cloned()) {
                Some(mapped) => mapped,
                None => {
                    // Should be unreachable once runs are sorted; fall back
                    // to the run's own ID rather than dropping the record.
                    tracing::warn!(
                        "run {} references trace {:?} with no mapped root; \
                         falling back to its own ID",
                        source_run_id,
                        source_trace_id
                    );
                    new_run_id.clone()
                }
            }
        };

        run_map.insert(source_run_id.clone(), new_run_id.clone());

        // Earlier dotted-order segments may name either runs or trace roots.
        let mut combined = run_map.clone();
        combined.extend(trace_map.clone());
        let new_dotted_order = str_field(run, "dotted_order")
            .map(|d| regenerate_dotted_order(d, &combined, &new_run_id));

        let mapped_example = str_field(run, "reference_example_id")
            .and_then(|e| example_map.get(e).cloned());

        Some(strip_nulls(json!({
            "id": new_run_id,
            "name": str_field(run, "name").unwrap_or_default(),
            "inputs": run.get("inputs"),
            "outputs": run.get("outputs"),
            "run_type": str_field(run, "run_type").unwrap_or("chain"),
            "start_time": run.get("start_time"),
            "end_time": run.get("end_time"),
            "extra": run.get("extra"),
            "error": run.get("error"),
            "serialized": run.get("serialized").cloned().unwrap_or_else(|| json!({})),
            "parent_run_id": mapped_parent,
            "events": run.get("events").cloned().unwrap_or_else(|| json!([])),
            "tags": run.get("tags").cloned().unwrap_or_else(|| json!([])),
            "trace_id": new_trace_id,
            "dotted_order": new_dotted_order,
            "session_id": dest_session_id,
            "reference_example_id": mapped_example,
        })))
    }

    /// Flush a run batch through the bulk ingest endpoint.
    async fn create_runs_batch(&self, batch: &mut Vec<Value>) -> Result<usize, MigrateError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let runs = std::mem::take(batch);
        let count = runs.len();
        let payload = json!({ "post": runs });

        match self.ctx.dest.post("/runs/batch", &payload).await {
            Ok(response) => {
                if let Some(errors) = response.get("errors").and_then(Value::as_array) {
                    if !errors.is_empty() {
                        tracing::warn!(
                            "run batch reported {} error(s); first: {}",
                            errors.len(),
                            errors[0]
                        );
                        return Ok(count.saturating_sub(errors.len()));
                    }
                }
                Ok(count)
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                tracing::warn!("run batch of {} failed: {}", count, err);
                Ok(0)
            }
        }
    }
}

#[async_trait]
impl ResourceMigrator for ExperimentMigrator {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Experiment
    }

    async fn list(&self) -> Result<Vec<Value>, MigrateError> {
        self.ctx
            .source
            .paginate("/sessions", Vec::new(), 100)
            .collect()
            .await
    }

    async fn find_existing(
        &self,
        name: &str,
        scope: Option<&str>,
    ) -> Result<Option<String>, MigrateError> {
        let Some(dataset_id) = scope else {
            return Err(MigrateError::validation(
                "experiment lookup requires a destination dataset scope",
            ));
        };
        self.find_existing_experiment(name, dataset_id).await
    }

    async fn migrate(&self, source_id: &str) -> Result<MigrationOutcome, MigrateError> {
        let experiment = self
            .ctx
            .source
            .get(&format!("/sessions/{source_id}"), &[])
            .await?;
        let Some(dataset_id) = str_field(&experiment, "reference_dataset_id") else {
            return Err(MigrateError::skipped(format!(
                "experiment {source_id} has no reference dataset"
            )));
        };
        let Some(dest_dataset_id) = self.ctx.mapped(ResourceKind::Dataset, dataset_id).await
        else {
            return Err(MigrateError::UnmappedReference {
                kind: "dataset",
                id: dataset_id.to_string(),
            });
        };
        self.create_experiment(&experiment, &dest_dataset_id).await
    }
}

#[cfg(test)]
mod tests {
    use quickcheck::quickcheck;

    use super::*;

    #[test]
    fn test_dotted_order_last_segment_forced() {
        let map = HashMap::from([
            ("uuid-r".to_string(), "new-r".to_string()),
            ("uuid-a".to_string(), "new-a".to_string()),
        ]);
        let rebuilt = regenerate_dotted_order(
            "20260203T003519695988Zuuid-r.20260203T003520000000Zuuid-a.20260203T003521000000Zuuid-b",
            &map,
            "new-b",
        );
        assert_eq!(
            rebuilt,
            "20260203T003519695988Znew-r.20260203T003520000000Znew-a.20260203T003521000000Znew-b"
        );
    }

    #[test]
    fn test_dotted_order_unmapped_segment_kept() {
        let rebuilt =
            regenerate_dotted_order("T1Zunknown.T2Zself", &HashMap::new(), "fresh");
        assert_eq!(rebuilt, "T1Zunknown.T2Zfresh");
    }

    #[test]
    fn test_dotted_order_malformed_segment_untouched() {
        // A segment with no Z separator passes through unchanged, but the
        // final well-formed segment is still forced to the new ID.
        let rebuilt = regenerate_dotted_order("noseparator.T2Zold", &HashMap::new(), "fresh");
        assert_eq!(rebuilt, "noseparator.T2Zfresh");
    }

    quickcheck! {
        fn prop_dotted_order_deterministic(ids: Vec<u32>) -> bool {
            let dotted: Vec<String> = ids
                .iter()
                .map(|id| format!("20260101T000000000000Zuuid-{id}"))
                .collect();
            if dotted.is_empty() {
                return true;
            }
            let dotted = dotted.join(".");
            let map = HashMap::from([("uuid-1".to_string(), "mapped-1".to_string())]);
            let first = regenerate_dotted_order(&dotted, &map, "final-id");
            let second = regenerate_dotted_order(&dotted, &map, "final-id");
            first == second && first.ends_with("Zfinal-id")
        }
    }

    #[test]
    fn test_evaluator_type_inference() {
        let extra = json!({
            "evaluators": [
                {"name": "checker", "code": "def run(): ..."},
                {"name": "grader", "prompt_template": "grade this"},
                {"name": "mystery"},
                {"type": "LLM", "feedback_key": "set"},
            ]
        });
        let normalized = normalize_evaluators(Some(&extra)).unwrap();
        let evaluators = normalized["evaluators"].as_array().unwrap();
        assert_eq!(evaluators[0]["type"], "Code");
        assert_eq!(evaluators[1]["type"], "LLM");
        assert_eq!(evaluators[2]["type"], "Code");
        assert_eq!(evaluators[3]["type"], "LLM");
    }

    #[test]
    fn test_feedback_key_inference() {
        let extra = json!({
            "evaluators": [
                {"name": "accuracy", "code": "x"},
                {"metric_name": "recall", "code": "x"},
            ]
        });
        let normalized = normalize_evaluators(Some(&extra)).unwrap();
        let evaluators = normalized["evaluators"].as_array().unwrap();
        assert_eq!(evaluators[0]["feedback_key"], "accuracy");
        assert_eq!(evaluators[1]["feedback_key"], "recall");
    }

    #[test]
    fn test_normalize_preserves_unrelated_extra() {
        let extra = json!({"metadata": {"revision": 7}});
        let normalized = normalize_evaluators(Some(&extra)).unwrap();
        assert_eq!(normalized, extra);
        assert!(normalize_evaluators(None).is_none());
    }
}
