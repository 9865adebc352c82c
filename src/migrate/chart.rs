//! Dashboard chart migration.
//!
//! The chart listing is a POST that returns either a flat chart list or a
//! sectioned dashboard tree; sectioned charts are tagged with their source
//! section title so the section can be recreated by title on the
//! destination. Before a chart is written, every project/dataset reference
//! buried in its `series[].filters`, `common_filters.session[]`, and
//! top-level ID fields is rewritten through the name-matched maps. Sections
//! are best effort: a create that fails with a `section_id` is retried once
//! without it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{Value, json};

use super::{
    MigrationContext, MigrationOutcome, ResourceMigrator, build_name_map, str_field, strip_nulls,
};
use crate::client::ApiClient;
use crate::errors::MigrateError;
use crate::resource::ResourceKind;

/// A chart pulled from a listing, with its section context when the
/// response was a sectioned dashboard tree.
#[derive(Debug, Clone)]
pub struct ChartEntry {
    pub chart: Value,
    pub section_title: Option<String>,
    pub section_description: Option<String>,
}

/// Listing body: metadata only, anchored to a short trailing window.
fn charts_request_body() -> Value {
    let start_time = (Utc::now() - Duration::days(1)).to_rfc3339();
    json!({
        "timezone": "UTC",
        "omit_data": true,
        "start_time": start_time,
        "end_time": null,
        "stride": {"days": 0, "hours": 0, "minutes": 15},
        "after_index": null,
        "tag_value_id": null,
    })
}

/// Flatten a charts response into entries, tagging sectioned charts with
/// their section title and description.
fn flatten_charts(response: &Value) -> Vec<ChartEntry> {
    let mut entries = Vec::new();
    match response {
        Value::Array(charts) => {
            for chart in charts {
                entries.push(ChartEntry {
                    chart: chart.clone(),
                    section_title: None,
                    section_description: None,
                });
            }
        }
        Value::Object(map) => {
            if let Some(Value::Array(sections)) = map.get("sections") {
                for section in sections {
                    let title = str_field(section, "title").map(str::to_string);
                    let description = str_field(section, "description").map(str::to_string);
                    if let Some(Value::Array(charts)) = section.get("charts") {
                        for chart in charts {
                            entries.push(ChartEntry {
                                chart: chart.clone(),
                                section_title: title.clone(),
                                section_description: description.clone(),
                            });
                        }
                    }
                }
            } else if let Some(Value::Array(charts)) = map.get("charts") {
                for chart in charts {
                    entries.push(ChartEntry {
                        chart: chart.clone(),
                        section_title: None,
                        section_description: None,
                    });
                }
            } else {
                entries.push(ChartEntry {
                    chart: response.clone(),
                    section_title: None,
                    section_description: None,
                });
            }
        }
        _ => {}
    }
    entries
}

/// Recursively rewrite project/dataset references through the ID maps.
///
/// Touches `project_id`/`session_id` (project map), `dataset_id` (dataset
/// map), and `session` arrays inside `common_filters`. Unmapped IDs are left
/// in place.
pub fn rewrite_ids(
    value: &mut Value,
    project_map: &HashMap<String, String>,
    dataset_map: &HashMap<String, String>,
) {
    match value {
        Value::Object(map) => {
            for key in ["project_id", "session_id"] {
                if let Some(Value::String(id)) = map.get(key) {
                    if let Some(mapped) = project_map.get(id) {
                        map.insert(key.to_string(), Value::String(mapped.clone()));
                    }
                }
            }
            if let Some(Value::String(id)) = map.get("dataset_id") {
                if let Some(mapped) = dataset_map.get(id) {
                    map.insert("dataset_id".to_string(), Value::String(mapped.clone()));
                }
            }
            if let Some(Value::Array(sessions)) = map.get_mut("session") {
                for session in sessions.iter_mut() {
                    if let Value::String(id) = session {
                        if let Some(mapped) = project_map.get(id) {
                            *session = Value::String(mapped.clone());
                        }
                    }
                }
            }
            for (_, nested) in map.iter_mut() {
                rewrite_ids(nested, project_map, dataset_map);
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_ids(item, project_map, dataset_map);
            }
        }
        _ => {}
    }
}

pub struct ChartMigrator {
    ctx: Arc<MigrationContext>,
    project_map: tokio::sync::Mutex<Option<HashMap<String, String>>>,
    dataset_map: tokio::sync::Mutex<Option<HashMap<String, String>>>,
    /// Destination section title -> section ID.
    section_map: tokio::sync::Mutex<Option<HashMap<String, String>>>,
}

impl ChartMigrator {
    pub fn new(ctx: Arc<MigrationContext>) -> Self {
        Self {
            ctx,
            project_map: tokio::sync::Mutex::new(None),
            dataset_map: tokio::sync::Mutex::new(None),
            section_map: tokio::sync::Mutex::new(None),
        }
    }

    async fn list_charts_on(&self, client: &ApiClient) -> Result<Vec<ChartEntry>, MigrateError> {
        let response = client.post("/charts", &charts_request_body()).await?;
        Ok(flatten_charts(&response))
    }

    pub async fn list_source_charts(&self) -> Result<Vec<ChartEntry>, MigrateError> {
        self.list_charts_on(&self.ctx.source).await
    }

    async fn project_map(&self) -> Result<HashMap<String, String>, MigrateError> {
        let mut cache = self.project_map.lock().await;
        if cache.is_none() {
            *cache = Some(build_name_map(&self.ctx.source, &self.ctx.dest, "/sessions").await?);
        }
        Ok(cache.clone().unwrap_or_default())
    }

    async fn dataset_map(&self) -> Result<HashMap<String, String>, MigrateError> {
        let mut cache = self.dataset_map.lock().await;
        if cache.is_none() {
            *cache = Some(build_name_map(&self.ctx.source, &self.ctx.dest, "/datasets").await?);
        }
        Ok(cache.clone().unwrap_or_default())
    }

    /// Destination sections keyed by title, built from the dest listing.
    async fn section_map(&self) -> Result<HashMap<String, String>, MigrateError> {
        let mut cache = self.section_map.lock().await;
        if cache.is_none() {
            let mut map = HashMap::new();
            match self.ctx.dest.post("/charts", &charts_request_body()).await {
                Ok(response) => {
                    if let Some(Value::Array(sections)) = response.get("sections") {
                        for section in sections {
                            if let (Some(title), Some(id)) =
                                (str_field(section, "title"), str_field(section, "id"))
                            {
                                map.insert(title.to_string(), id.to_string());
                            }
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!("failed to list destination sections: {}", err);
                }
            }
            *cache = Some(map);
        }
        Ok(cache.clone().unwrap_or_default())
    }

    /// Look up a destination section by title, creating it when absent.
    async fn ensure_section(
        &self,
        title: &str,
        description: Option<&str>,
    ) -> Result<Option<String>, MigrateError> {
        if let Some(existing) = self.section_map().await?.get(title) {
            return Ok(Some(existing.clone()));
        }

        let payload = json!({
            "title": title,
            "description": description.unwrap_or(""),
            "index": 0,
        });
        match self.ctx.dest.post("/charts/section", &payload).await {
            Ok(response) => {
                let Some(id) = str_field(&response, "id").map(str::to_string) else {
                    return Ok(None);
                };
                tracing::debug!("created dashboard section '{}' -> {}", title, id);
                let mut cache = self.section_map.lock().await;
                if let Some(map) = cache.as_mut() {
                    map.insert(title.to_string(), id.clone());
                }
                Ok(Some(id))
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                tracing::warn!("failed to create section '{}': {}", title, err);
                Ok(None)
            }
        }
    }

    /// Find a destination chart by title, narrowed by section when given.
    pub async fn find_existing_chart(
        &self,
        title: &str,
        section_id: Option<&str>,
    ) -> Result<Option<String>, MigrateError> {
        let charts = self.list_charts_on(&self.ctx.dest).await?;
        for entry in charts {
            let chart_title = str_field(&entry.chart, "title")
                .or_else(|| str_field(&entry.chart, "name"));
            if chart_title != Some(title) {
                continue;
            }
            let chart_section = str_field(&entry.chart, "section_id");
            if section_id.is_none() || chart_section == section_id {
                return Ok(entry
                    .chart
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string));
            }
        }
        Ok(None)
    }

    async fn update_chart(&self, chart_id: &str, chart: &Value) -> Result<(), MigrateError> {
        let payload = strip_nulls(json!({
            "title": str_field(chart, "title").or_else(|| str_field(chart, "name")),
            "chart_type": chart.get("chart_type"),
            "series": chart.get("series"),
            "description": chart.get("description"),
            "index": chart.get("index"),
            "metadata": chart.get("metadata"),
            "section_id": chart.get("section_id"),
            "common_filters": chart.get("common_filters"),
        }));
        self.ctx
            .dest
            .patch(&format!("/charts/{chart_id}"), &payload)
            .await?;
        Ok(())
    }

    /// Upsert one chart whose IDs have already been rewritten.
    async fn create_chart(&self, entry: &ChartEntry) -> Result<MigrationOutcome, MigrateError> {
        let chart = &entry.chart;
        let title = str_field(chart, "title")
            .or_else(|| str_field(chart, "name"))
            .unwrap_or("Untitled Chart")
            .to_string();

        if self.ctx.dry_run() {
            tracing::info!("[dry run] would create chart '{}'", title);
            return Ok(MigrationOutcome::created(format!(
                "dry-run-{}",
                str_field(chart, "id").unwrap_or("chart")
            )));
        }

        let series = chart.get("series").cloned().unwrap_or_else(|| json!([]));
        if series.as_array().is_some_and(Vec::is_empty) {
            return Err(MigrateError::skipped(format!(
                "chart '{title}' has no series"
            )));
        }

        let mut payload = strip_nulls(json!({
            "title": title,
            "chart_type": str_field(chart, "chart_type").unwrap_or("line"),
            "series": series,
            "description": chart.get("description"),
            "index": chart.get("index"),
            "metadata": chart.get("metadata"),
            "section_id": chart.get("section_id"),
            "common_filters": chart.get("common_filters"),
        }));

        if let Some(section_title) = &entry.section_title {
            if let Some(section_id) = self
                .ensure_section(section_title, entry.section_description.as_deref())
                .await?
            {
                payload["section_id"] = json!(section_id);
            }
        }

        let section_id = str_field(&payload, "section_id").map(str::to_string);
        if let Some(existing_id) = self
            .find_existing_chart(&title, section_id.as_deref())
            .await?
        {
            if self.ctx.skip_existing() {
                tracing::debug!("chart '{}' already exists, skipping write", title);
                return Ok(MigrationOutcome::skipped_existing(existing_id));
            }
            self.update_chart(&existing_id, chart).await?;
            return Ok(MigrationOutcome::updated(existing_id));
        }

        let response = match self.ctx.dest.post("/charts/create", &payload).await {
            Ok(response) => response,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                // Sections are best effort; retry once without the linkage.
                let Some(obj) = payload.as_object_mut() else {
                    return Err(err);
                };
                if obj.remove("section_id").is_none() {
                    return Err(err);
                }
                tracing::debug!(
                    "chart '{}' create failed with section_id ({}), retrying without it",
                    title,
                    err
                );
                self.ctx.dest.post("/charts/create", &payload).await?
            }
        };

        let new_id = str_field(&response, "id").ok_or_else(|| {
            MigrateError::protocol("/charts/create", "chart create response carried no id")
        })?;
        tracing::debug!("created chart '{}' -> {}", title, new_id);
        Ok(MigrationOutcome::created(new_id))
    }

    /// Migrate one chart entry: rewrite its references, then upsert.
    pub async fn migrate_chart(
        &self,
        entry: &ChartEntry,
    ) -> Result<MigrationOutcome, MigrateError> {
        let source_id = str_field(&entry.chart, "id")
            .map(str::to_string)
            .ok_or_else(|| MigrateError::skipped("chart record has no id"))?;

        let project_map = self.project_map().await?;
        let dataset_map = self.dataset_map().await?;

        let mut rewritten = entry.clone();
        rewrite_ids(&mut rewritten.chart, &project_map, &dataset_map);

        let outcome = self.create_chart(&rewritten).await?;
        self.ctx
            .record_mapping(ResourceKind::Chart, &source_id, &outcome.destination_id)
            .await;
        Ok(outcome)
    }
}

#[async_trait]
impl ResourceMigrator for ChartMigrator {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Chart
    }

    async fn list(&self) -> Result<Vec<Value>, MigrateError> {
        Ok(self
            .list_source_charts()
            .await?
            .into_iter()
            .map(|entry| entry.chart)
            .collect())
    }

    async fn find_existing(
        &self,
        name: &str,
        scope: Option<&str>,
    ) -> Result<Option<String>, MigrateError> {
        self.find_existing_chart(name, scope).await
    }

    async fn migrate(&self, source_id: &str) -> Result<MigrationOutcome, MigrateError> {
        let charts = self.list_source_charts().await?;
        let entry = charts
            .into_iter()
            .find(|entry| str_field(&entry.chart, "id") == Some(source_id))
            .ok_or_else(|| MigrateError::not_found("/charts", source_id))?;
        self.migrate_chart(&entry).await
    }
}
