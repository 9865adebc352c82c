//! Automation rule migration.
//!
//! Rules are scoped to a project, a dataset, or both; the platform rejects a
//! rule with neither. Matching on the destination is by name **and** scope,
//! so two rules sharing a name under different scopes never collide.
//!
//! Project and dataset ID maps are built lazily by matching names across the
//! two instances; missing destination projects can optionally be created
//! from their source copies. Evaluator sub-objects are recursively cleaned
//! of null fields before send, and v3+ evaluators that the API returns as
//! flat fields (`evaluator_prompt_handle`, `evaluator_commit_hash_or_tag`,
//! `evaluator_variable_mapping`) are reconstructed into the canonical
//! `evaluators[0].structured` object. The embedded model is harvested from
//! the prompt manifest (source first, destination fallback); a rule whose
//! evaluator has no harvestable model is skipped, not best-effort created.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::prompt::split_handle;
use super::{
    MigrationContext, MigrationOutcome, ResourceMigrator, clean_nulls_deep, str_field,
};
use crate::errors::MigrateError;
use crate::resource::ResourceKind;

const RULES_ENDPOINT: &str = "/runs/rules";

/// Fields the rules PATCH endpoint accepts. `group_by` is CREATE-only.
const PATCH_FIELDS: [&str; 23] = [
    "display_name",
    "session_id",
    "is_enabled",
    "dataset_id",
    "sampling_rate",
    "filter",
    "trace_filter",
    "tree_filter",
    "backfill_from",
    "use_corrections_dataset",
    "num_few_shot_examples",
    "extend_only",
    "transient",
    "add_to_annotation_queue_id",
    "add_to_dataset_id",
    "add_to_dataset_prefer_correction",
    "evaluators",
    "code_evaluators",
    "alerts",
    "webhooks",
    "evaluator_version",
    "create_alignment_queue",
    "include_extended_stats",
];

/// Fields the rules CREATE endpoint accepts.
const CREATE_FIELDS: [&str; 24] = [
    "display_name",
    "session_id",
    "is_enabled",
    "dataset_id",
    "sampling_rate",
    "filter",
    "trace_filter",
    "tree_filter",
    "backfill_from",
    "use_corrections_dataset",
    "num_few_shot_examples",
    "extend_only",
    "transient",
    "add_to_annotation_queue_id",
    "add_to_dataset_id",
    "add_to_dataset_prefer_correction",
    "evaluators",
    "code_evaluators",
    "alerts",
    "webhooks",
    "evaluator_version",
    "create_alignment_queue",
    "include_extended_stats",
    "group_by",
];

/// Manifest root types whose `kwargs.last` is the model.
const MODEL_BEARING_TYPES: [&str; 2] = ["RunnableSequence", "PromptPlayground"];

#[derive(Debug, Clone, Default)]
pub struct RuleOptions {
    /// Drop the project reference and rely on the dataset scope alone.
    pub strip_project_reference: bool,
    /// Create destination projects that exist only on the source.
    pub ensure_project: bool,
    /// Write rules with `is_enabled=false` so the server accepts them
    /// before their secrets (e.g. model API keys) are provisioned.
    pub create_disabled: bool,
    /// Explicit source -> destination project overrides, applied on top of
    /// the name-matched map.
    pub project_overrides: HashMap<String, String>,
}

pub struct RuleMigrator {
    ctx: Arc<MigrationContext>,
    project_map: tokio::sync::Mutex<Option<HashMap<String, String>>>,
    dataset_map: tokio::sync::Mutex<Option<HashMap<String, String>>>,
}

/// Keep only the named fields of an object payload.
fn filter_fields(payload: Map<String, Value>, allowed: &[&str]) -> Map<String, Value> {
    let (kept, dropped): (Vec<_>, Vec<_>) = payload
        .into_iter()
        .partition(|(k, _)| allowed.contains(&k.as_str()));
    if !dropped.is_empty() {
        tracing::debug!(
            "excluded field(s) not accepted by the endpoint: {:?}",
            dropped.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>()
        );
    }
    kept.into_iter().collect()
}

/// Extract the model configuration from a prompt manifest.
///
/// Model-bearing manifests carry their type tag as the last element of the
/// `id` path and the model as `kwargs.last`.
pub fn extract_model(manifest: &Value) -> Option<Value> {
    let type_name = manifest
        .get("id")
        .and_then(Value::as_array)
        .and_then(|path| path.last())
        .and_then(Value::as_str)?;
    if !MODEL_BEARING_TYPES.contains(&type_name) {
        tracing::debug!("manifest type '{}' carries no model", type_name);
        return None;
    }
    manifest
        .get("kwargs")
        .and_then(|kwargs| kwargs.get("last"))
        .filter(|model| !model.is_null())
        .cloned()
}

impl RuleMigrator {
    pub fn new(ctx: Arc<MigrationContext>) -> Self {
        Self {
            ctx,
            project_map: tokio::sync::Mutex::new(None),
            dataset_map: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn list_rules(&self) -> Result<Vec<Value>, MigrateError> {
        match self
            .ctx
            .source
            .paginate(RULES_ENDPOINT, Vec::new(), 100)
            .collect()
            .await
        {
            Ok(rules) => Ok(rules),
            Err(MigrateError::NotFound { .. }) => {
                tracing::warn!("rules endpoint not found on source");
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn get_rule(&self, rule_id: &str) -> Result<Option<Value>, MigrateError> {
        match self
            .ctx
            .source
            .get(&format!("{RULES_ENDPOINT}/{rule_id}"), &[])
            .await
        {
            Ok(rule) => Ok(Some(rule)),
            Err(MigrateError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Find a destination rule by name and scope. A name hit under a
    /// different scope is not a match.
    pub async fn find_existing_rule(
        &self,
        name: &str,
        session_id: Option<&str>,
        dataset_id: Option<&str>,
    ) -> Result<Option<String>, MigrateError> {
        let mut pager = self.ctx.dest.paginate(RULES_ENDPOINT, Vec::new(), 100);
        while let Some(page) = pager.next_page().await? {
            for rule in page {
                let rule_name = str_field(&rule, "display_name")
                    .or_else(|| str_field(&rule, "name"));
                if rule_name != Some(name) {
                    continue;
                }
                let rule_dataset = str_field(&rule, "dataset_id");
                let rule_session = str_field(&rule, "session_id");

                let matched = match (dataset_id, session_id) {
                    (Some(dataset), _) if rule_dataset == Some(dataset) => true,
                    (_, Some(session)) if rule_session == Some(session) => true,
                    (None, None) => rule_dataset.is_none() && rule_session.is_none(),
                    _ => false,
                };
                if matched {
                    return Ok(rule.get("id").and_then(Value::as_str).map(str::to_string));
                }
            }
        }
        Ok(None)
    }

    /// Lazily build the project map by matching names; optionally create
    /// projects missing from the destination.
    pub async fn project_map(
        &self,
        create_missing: bool,
        overrides: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, MigrateError> {
        let mut cache = self.project_map.lock().await;
        if cache.is_none() {
            let mut source_projects: Vec<Value> = self
                .ctx
                .source
                .paginate("/sessions", Vec::new(), 100)
                .collect()
                .await?;
            let dest_projects: Vec<Value> = self
                .ctx
                .dest
                .paginate("/sessions", Vec::new(), 100)
                .collect()
                .await?;

            let dest_by_name: HashMap<&str, &str> = dest_projects
                .iter()
                .filter_map(|p| Some((str_field(p, "name")?, str_field(p, "id")?)))
                .collect();

            let mut map = HashMap::new();
            let mut created = 0usize;
            for project in source_projects.drain(..) {
                let (Some(name), Some(source_id)) =
                    (str_field(&project, "name"), str_field(&project, "id"))
                else {
                    continue;
                };
                if let Some(dest_id) = dest_by_name.get(name) {
                    map.insert(source_id.to_string(), (*dest_id).to_string());
                } else if create_missing && !self.ctx.dry_run() {
                    match self.create_project(&project).await {
                        Ok(new_id) => {
                            map.insert(source_id.to_string(), new_id);
                            created += 1;
                        }
                        Err(err) if err.is_fatal() => return Err(err),
                        Err(err) => {
                            tracing::warn!("failed to create project '{}': {}", name, err);
                        }
                    }
                }
            }
            tracing::debug!(
                "project map built: {} matched, {} created",
                map.len() - created,
                created
            );
            *cache = Some(map);
        }

        let mut map = cache.clone().unwrap_or_default();
        for (source_id, dest_id) in overrides {
            map.insert(source_id.clone(), dest_id.clone());
        }
        Ok(map)
    }

    async fn create_project(&self, project: &Value) -> Result<String, MigrateError> {
        let payload = super::strip_nulls(json!({
            "name": project.get("name"),
            "description": project.get("description"),
            "metadata": project.get("metadata"),
            "start_time": project.get("start_time"),
            "end_time": project.get("end_time"),
            "extra": project.get("extra"),
        }));
        let response = self.ctx.dest.post("/sessions", &payload).await?;
        str_field(&response, "id")
            .map(str::to_string)
            .ok_or_else(|| {
                MigrateError::protocol("/sessions", "project create response carried no id")
            })
    }

    /// Lazily build the dataset map by matching names.
    pub async fn dataset_map(&self) -> Result<HashMap<String, String>, MigrateError> {
        let mut cache = self.dataset_map.lock().await;
        if cache.is_none() {
            let map =
                super::build_name_map(&self.ctx.source, &self.ctx.dest, "/datasets").await?;
            tracing::debug!("dataset map built: {} matched", map.len());
            *cache = Some(map);
        }
        Ok(cache.clone().unwrap_or_default())
    }

    /// Fetch a prompt manifest with its model serialization.
    async fn fetch_manifest(
        &self,
        handle: &str,
        commit: &str,
        from_source: bool,
    ) -> Option<Value> {
        let (owner, repo) = split_handle(handle);
        let client = if from_source {
            &self.ctx.source
        } else {
            &self.ctx.dest
        };
        let which = if from_source { "source" } else { "destination" };

        match client
            .get(
                &format!("/commits/{owner}/{repo}/{commit}"),
                &[("include_model", "true".to_string())],
            )
            .await
        {
            Ok(response) => response.get("manifest").cloned().filter(|m| !m.is_null()),
            Err(MigrateError::NotFound { .. }) => {
                tracing::warn!("prompt '{}' not found on {}", handle, which);
                None
            }
            Err(err) => {
                tracing::warn!(
                    "failed to fetch manifest for '{}' from {}: {}",
                    handle,
                    which,
                    err
                );
                None
            }
        }
    }

    /// Harvest the evaluator model: source prompt first, destination prompt
    /// as fallback.
    async fn harvest_model(&self, handle: &str, commit: &str) -> Option<Value> {
        if let Some(manifest) = self.fetch_manifest(handle, commit, true).await {
            if let Some(model) = extract_model(&manifest) {
                return Some(model);
            }
        }
        let manifest = self.fetch_manifest(handle, commit, false).await?;
        extract_model(&manifest)
    }

    /// Build the `evaluators` array for the destination payload.
    ///
    /// Rules already carrying an `evaluators` array are cleaned and reused;
    /// v3+ rules carrying flat evaluator fields are reconstructed into
    /// `evaluators[0].structured = {hub_ref, variable_mapping, model}`.
    /// Returns a skip error when a v3+ evaluator has no harvestable model.
    async fn resolve_evaluators(&self, rule: &Value) -> Result<Option<Value>, MigrateError> {
        if let Some(evaluators) = rule.get("evaluators").filter(|e| {
            e.as_array().is_some_and(|list| !list.is_empty())
        }) {
            return Ok(Some(clean_nulls_deep(evaluators.clone())));
        }

        let Some(handle) = str_field(rule, "evaluator_prompt_handle") else {
            return Ok(None);
        };
        let commit = str_field(rule, "evaluator_commit_hash_or_tag").unwrap_or("latest");
        let hub_ref = format!("{handle}:{commit}");
        tracing::debug!("reconstructing v3+ evaluator with hub_ref {}", hub_ref);

        let Some(model) = self.harvest_model(handle, commit).await else {
            return Err(MigrateError::skipped(format!(
                "evaluator prompt '{handle}' exposes no model configuration \
                 (needs a RunnableSequence/PromptPlayground manifest)"
            )));
        };

        let mut structured = Map::new();
        structured.insert("hub_ref".to_string(), Value::String(hub_ref));
        if let Some(mapping) = rule.get("evaluator_variable_mapping") {
            if !mapping.is_null() {
                structured.insert("variable_mapping".to_string(), mapping.clone());
            }
        }
        structured.insert("model".to_string(), model);

        Ok(Some(json!([{ "structured": structured }])))
    }

    /// Create or update one rule on the destination.
    pub async fn create_rule(
        &self,
        rule: &Value,
        options: &RuleOptions,
    ) -> Result<MigrationOutcome, MigrateError> {
        let display_name = str_field(rule, "display_name")
            .or_else(|| str_field(rule, "name"))
            .map(str::to_string)
            .unwrap_or_else(|| {
                let id = str_field(rule, "id").unwrap_or("unknown");
                tracing::warn!("rule {} has no display name; synthesizing one", id);
                format!("Rule {id}")
            });

        if self.ctx.dry_run() {
            tracing::info!("[dry run] would create rule '{}'", display_name);
            return Ok(MigrationOutcome::created(format!(
                "dry-run-{}",
                str_field(rule, "id").unwrap_or("rule")
            )));
        }

        let project_map = self
            .project_map(options.ensure_project, &options.project_overrides)
            .await?;
        let dataset_map = self.dataset_map().await?;

        let source_enabled = rule
            .get("is_enabled")
            .or_else(|| rule.get("enabled"))
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let is_enabled = if options.create_disabled {
            if source_enabled {
                tracing::debug!(
                    "creating rule '{}' disabled so missing secrets do not fail validation",
                    display_name
                );
            }
            false
        } else {
            source_enabled
        };

        let mut payload = Map::new();
        payload.insert("display_name".to_string(), Value::String(display_name.clone()));
        payload.insert("is_enabled".to_string(), Value::Bool(is_enabled));
        payload.insert(
            "sampling_rate".to_string(),
            rule.get("sampling_rate").cloned().unwrap_or(json!(1.0)),
        );
        for field in [
            "filter",
            "trace_filter",
            "tree_filter",
            "backfill_from",
            "num_few_shot_examples",
            "add_to_annotation_queue_id",
            "add_to_dataset_prefer_correction",
            "evaluator_version",
            "use_corrections_dataset",
            "extend_only",
            "transient",
            "include_extended_stats",
        ] {
            if let Some(value) = rule.get(field) {
                if !value.is_null() {
                    payload.insert(field.to_string(), value.clone());
                }
            }
        }

        // The add-to-dataset action references a dataset by ID; remap it
        // when the dataset has a destination counterpart.
        if let Some(source_target) = str_field(rule, "add_to_dataset_id") {
            match dataset_map.get(source_target) {
                Some(mapped) => {
                    payload.insert("add_to_dataset_id".to_string(), json!(mapped));
                }
                None => {
                    tracing::warn!(
                        "add_to_dataset_id {} has no destination counterpart; keeping source ID",
                        source_target
                    );
                    payload.insert("add_to_dataset_id".to_string(), json!(source_target));
                }
            }
        }

        if let Some(evaluators) = self.resolve_evaluators(rule).await? {
            payload.insert("evaluators".to_string(), evaluators);
        }
        if let Some(code_evaluators) = rule.get("code_evaluators").filter(|v| !v.is_null()) {
            payload.insert(
                "code_evaluators".to_string(),
                clean_nulls_deep(code_evaluators.clone()),
            );
        }
        for field in ["alerts", "webhooks", "group_by"] {
            if let Some(value) = rule.get(field).filter(|v| !v.is_null()) {
                payload.insert(field.to_string(), value.clone());
            }
        }

        // Scope resolution: the payload must carry a mapped project ID, a
        // mapped dataset ID, or both.
        let source_session = str_field(rule, "session_id");
        let source_dataset = str_field(rule, "dataset_id");
        let dest_session = source_session.and_then(|id| project_map.get(id).cloned());
        let dest_dataset = source_dataset.and_then(|id| dataset_map.get(id).cloned());

        if options.strip_project_reference {
            match &dest_dataset {
                Some(dataset_id) => {
                    payload.insert("dataset_id".to_string(), json!(dataset_id));
                }
                None => {
                    return Err(MigrateError::skipped(format!(
                        "rule '{display_name}' cannot drop its project reference: \
                         no mapped dataset to scope it to"
                    )));
                }
            }
        } else {
            // A rule that names a dataset must keep that dataset: writing it
            // with only the project scope would silently change what the
            // rule applies to.
            if let Some(source_dataset_id) = source_dataset {
                match &dest_dataset {
                    Some(dataset_id) => {
                        payload.insert("dataset_id".to_string(), json!(dataset_id));
                    }
                    None => {
                        return Err(MigrateError::skipped(format!(
                            "rule '{display_name}' references dataset {source_dataset_id} \
                             with no destination counterpart"
                        )));
                    }
                }
            }
            if let Some(session_id) = &dest_session {
                payload.insert("session_id".to_string(), json!(session_id));
            } else if source_session.is_some() {
                tracing::warn!(
                    "rule '{}': source project {} has no destination counterpart",
                    display_name,
                    source_session.unwrap_or_default()
                );
            }
            if dest_session.is_none() && dest_dataset.is_none() {
                return Err(MigrateError::skipped(format!(
                    "rule '{display_name}' has no mapped project or dataset scope"
                )));
            }
        }

        let scope_session = payload
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let scope_dataset = payload
            .get("dataset_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        if let Some(existing_id) = self
            .find_existing_rule(
                &display_name,
                scope_session.as_deref(),
                scope_dataset.as_deref(),
            )
            .await?
        {
            if self.ctx.skip_existing() {
                tracing::debug!("rule '{}' already exists, skipping write", display_name);
                return Ok(MigrationOutcome::skipped_existing(existing_id));
            }
            let patch = Value::Object(filter_fields(payload, &PATCH_FIELDS));
            self.ctx
                .dest
                .patch(&format!("{RULES_ENDPOINT}/{existing_id}"), &patch)
                .await?;
            return Ok(MigrationOutcome::updated(existing_id));
        }

        let create = Value::Object(filter_fields(payload, &CREATE_FIELDS));
        let response = self.ctx.dest.post(RULES_ENDPOINT, &create).await?;
        let new_id = str_field(&response, "id").ok_or_else(|| {
            MigrateError::protocol(RULES_ENDPOINT, "rule create response carried no id")
        })?;
        tracing::debug!("created rule '{}' -> {}", display_name, new_id);
        Ok(MigrationOutcome::created(new_id))
    }

    /// Migrate one rule by source ID.
    pub async fn migrate_rule(
        &self,
        rule_id: &str,
        options: &RuleOptions,
    ) -> Result<MigrationOutcome, MigrateError> {
        let Some(rule) = self.get_rule(rule_id).await? else {
            return Err(MigrateError::not_found(RULES_ENDPOINT, rule_id));
        };
        let outcome = self.create_rule(&rule, options).await?;
        self.ctx
            .record_mapping(ResourceKind::Rule, rule_id, &outcome.destination_id)
            .await;
        Ok(outcome)
    }
}

#[async_trait]
impl ResourceMigrator for RuleMigrator {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Rule
    }

    async fn list(&self) -> Result<Vec<Value>, MigrateError> {
        self.list_rules().await
    }

    async fn find_existing(
        &self,
        name: &str,
        scope: Option<&str>,
    ) -> Result<Option<String>, MigrateError> {
        self.find_existing_rule(name, None, scope).await
    }

    async fn migrate(&self, source_id: &str) -> Result<MigrationOutcome, MigrateError> {
        self.migrate_rule(source_id, &RuleOptions::default()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_model_from_sequence() {
        let manifest = json!({
            "id": ["langchain", "schema", "runnable", "RunnableSequence"],
            "kwargs": {
                "first": {"id": ["prompt"]},
                "last": {"id": ["chat_model"], "kwargs": {"temperature": 0.0}},
            }
        });
        let model = extract_model(&manifest).unwrap();
        assert_eq!(model["id"], json!(["chat_model"]));
    }

    #[test]
    fn test_extract_model_rejects_plain_prompt() {
        let manifest = json!({
            "id": ["langchain", "prompts", "chat", "ChatPromptTemplate"],
            "kwargs": {"messages": []}
        });
        assert!(extract_model(&manifest).is_none());
    }

    #[test]
    fn test_extract_model_requires_last() {
        let manifest = json!({
            "id": ["x", "PromptPlayground"],
            "kwargs": {"first": {}}
        });
        assert!(extract_model(&manifest).is_none());
    }

    #[test]
    fn test_filter_fields_drops_create_only_on_patch() {
        let mut payload = Map::new();
        payload.insert("display_name".to_string(), json!("r"));
        payload.insert("group_by".to_string(), json!("thread"));
        payload.insert("bogus".to_string(), json!(1));

        let patched = filter_fields(payload.clone(), &PATCH_FIELDS);
        assert!(patched.contains_key("display_name"));
        assert!(!patched.contains_key("group_by"));
        assert!(!patched.contains_key("bogus"));

        let created = filter_fields(payload, &CREATE_FIELDS);
        assert!(created.contains_key("group_by"));
        assert!(!created.contains_key("bogus"));
    }
}
