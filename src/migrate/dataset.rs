//! Dataset and example migration.
//!
//! Datasets match by name. Examples stream page by page from the source and
//! upsert against a destination-side table indexed by the SHA-256 of their
//! canonical-JSON inputs: a hash hit refreshes outputs/metadata with a PATCH
//! (attachments are never re-uploaded), a miss is created. Plain examples go
//! through the bulk endpoint in batches with binary-split failure isolation;
//! examples carrying attachments take the one-at-a-time path because the
//! attachment-capable endpoint is single-record.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::attachment::AttachmentClient;
use super::{
    MigrationContext, MigrationOutcome, ResourceMigrator, UpsertAction, record_name, str_field,
    strip_nulls,
};
use crate::canonical::fingerprint;
use crate::errors::MigrateError;
use crate::resource::ResourceKind;

/// Outcome of one dataset's example migration.
#[derive(Debug, Default)]
pub struct ExampleSummary {
    /// source example ID -> destination example ID
    pub mapping: HashMap<String, String>,
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
}

pub struct DatasetMigrator {
    ctx: Arc<MigrationContext>,
    source_blobs: AttachmentClient,
    dest_blobs: AttachmentClient,
}

impl DatasetMigrator {
    pub fn new(ctx: Arc<MigrationContext>) -> Result<Self, MigrateError> {
        let source_blobs = AttachmentClient::new(ctx.config.source.verify_tls)?;
        let dest_blobs = AttachmentClient::new(ctx.config.destination.verify_tls)?;
        Ok(Self {
            ctx,
            source_blobs,
            dest_blobs,
        })
    }

    pub async fn list_datasets(&self) -> Result<Vec<Value>, MigrateError> {
        let datasets = self
            .ctx
            .source
            .paginate("/datasets", Vec::new(), 100)
            .collect()
            .await?;
        tracing::debug!("fetched {} dataset(s) from source", datasets.len());
        Ok(datasets)
    }

    pub async fn get_dataset(&self, dataset_id: &str) -> Result<Value, MigrateError> {
        let response = self
            .ctx
            .source
            .get(&format!("/datasets/{dataset_id}"), &[])
            .await?;
        if !response.is_object() {
            return Err(MigrateError::protocol(
                "/datasets/{id}",
                format!("expected an object for dataset {dataset_id}"),
            ));
        }
        Ok(response)
    }

    /// Resolve a dataset name on the destination. Duplicate names are an
    /// observable warning; the first match wins.
    pub async fn find_existing_dataset(
        &self,
        name: &str,
    ) -> Result<Option<String>, MigrateError> {
        let response = match self
            .ctx
            .dest
            .get("/datasets", &[("name", name.to_string())])
            .await
        {
            Ok(response) => response,
            Err(MigrateError::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(err),
        };

        let matches = match response {
            Value::Array(items) => items,
            other if other.is_object() => vec![other],
            _ => Vec::new(),
        };
        if matches.len() > 1 {
            tracing::warn!(
                "multiple destination datasets named '{}'; using the first",
                name
            );
        }
        Ok(matches
            .first()
            .and_then(|d| str_field(d, "id"))
            .map(str::to_string))
    }

    pub async fn create_dataset(&self, dataset: &Value) -> Result<String, MigrateError> {
        let name = record_name(dataset);
        if self.ctx.dry_run() {
            tracing::info!("[dry run] would create dataset '{}'", name);
            return Ok(format!(
                "dry-run-{}",
                str_field(dataset, "id").unwrap_or("dataset")
            ));
        }

        let payload = strip_nulls(json!({
            "name": name,
            "description": str_field(dataset, "description").unwrap_or(""),
            "created_at": dataset.get("created_at"),
            "inputs_schema_definition": dataset.get("inputs_schema_definition"),
            "outputs_schema_definition": dataset.get("outputs_schema_definition"),
            "externally_managed": dataset.get("externally_managed").and_then(Value::as_bool).unwrap_or(false),
            "transformations": dataset.get("transformations").cloned().unwrap_or_else(|| json!([])),
            "data_type": str_field(dataset, "data_type").unwrap_or("kv"),
            "metadata": dataset.get("metadata"),
        }));

        let response = self.ctx.dest.post("/datasets", &payload).await?;
        str_field(&response, "id")
            .map(str::to_string)
            .ok_or_else(|| {
                MigrateError::protocol("/datasets", "create response carried no `id` field")
            })
    }

    pub async fn update_dataset(
        &self,
        dest_id: &str,
        dataset: &Value,
    ) -> Result<(), MigrateError> {
        let name = record_name(dataset);
        if self.ctx.dry_run() {
            tracing::info!("[dry run] would update dataset '{}' ({})", name, dest_id);
            return Ok(());
        }

        let payload = strip_nulls(json!({
            "name": name,
            "description": str_field(dataset, "description").unwrap_or(""),
            "inputs_schema_definition": dataset.get("inputs_schema_definition"),
            "outputs_schema_definition": dataset.get("outputs_schema_definition"),
            "transformations": dataset.get("transformations").cloned().unwrap_or_else(|| json!([])),
            "metadata": dataset.get("metadata"),
        }));

        self.ctx
            .dest
            .patch(&format!("/datasets/{dest_id}"), &payload)
            .await?;
        tracing::debug!("updated dataset '{}' ({})", name, dest_id);
        Ok(())
    }

    /// Destination examples indexed by their inputs fingerprint, used for
    /// upsert matching.
    pub async fn existing_examples_by_hash(
        &self,
        dest_dataset_id: &str,
    ) -> Result<HashMap<String, Value>, MigrateError> {
        let query = vec![
            ("dataset".to_string(), dest_dataset_id.to_string()),
            ("select".to_string(), "inputs".to_string()),
            ("select".to_string(), "outputs".to_string()),
            ("select".to_string(), "metadata".to_string()),
        ];
        let mut by_hash = HashMap::new();
        let mut pager = self.ctx.dest.paginate("/examples", query, 100);
        while let Some(page) = pager.next_page().await? {
            for example in page {
                if let Some(inputs) = example.get("inputs") {
                    if !inputs.is_null() {
                        by_hash.insert(fingerprint(inputs), example);
                    }
                }
            }
        }
        Ok(by_hash)
    }

    async fn update_example(
        &self,
        example_id: &str,
        example: &Value,
    ) -> Result<(), MigrateError> {
        let payload = strip_nulls(json!({
            "inputs": example.get("inputs"),
            "outputs": example.get("outputs"),
            "metadata": example.get("metadata"),
        }));
        self.ctx
            .dest
            .patch(&format!("/examples/{example_id}"), &payload)
            .await?;
        Ok(())
    }

    fn example_payload(dest_dataset_id: &str, example: &Value) -> Value {
        let split = example
            .get("metadata")
            .and_then(|m| m.get("dataset_split"))
            .and_then(Value::as_str)
            .unwrap_or("base");
        strip_nulls(json!({
            "dataset_id": dest_dataset_id,
            "inputs": example.get("inputs").cloned().unwrap_or_else(|| json!({})),
            "outputs": example.get("outputs").cloned().unwrap_or_else(|| json!({})),
            "metadata": example.get("metadata").cloned().unwrap_or_else(|| json!({})),
            "created_at": example.get("created_at"),
            "split": split,
        }))
    }

    /// Stream examples from the source and upsert them into the destination
    /// dataset.
    pub async fn migrate_examples(
        &self,
        source_dataset_id: &str,
        dest_dataset_id: &str,
    ) -> Result<ExampleSummary, MigrateError> {
        let mut summary = ExampleSummary::default();
        if self.ctx.dry_run() {
            tracing::info!("[dry run] would migrate examples of {}", source_dataset_id);
            return Ok(summary);
        }

        let existing = self.existing_examples_by_hash(dest_dataset_id).await?;
        if !existing.is_empty() {
            tracing::debug!(
                "found {} existing example(s) in destination dataset {}",
                existing.len(),
                dest_dataset_id
            );
        }

        let query = vec![
            ("dataset".to_string(), source_dataset_id.to_string()),
            ("select".to_string(), "attachment_urls".to_string()),
            ("select".to_string(), "outputs".to_string()),
            ("select".to_string(), "metadata".to_string()),
        ];
        let batch_size = self.ctx.batch_size();
        let mut batch: Vec<(String, Value)> = Vec::new();

        let mut pager = self.ctx.source.paginate("/examples", query, 100);
        while let Some(page) = pager.next_page().await? {
            for example in page {
                let Some(source_id) = str_field(&example, "id").map(str::to_string) else {
                    tracing::warn!("source example without an id, skipping");
                    continue;
                };

                let inputs = example.get("inputs").cloned().unwrap_or_else(|| json!({}));
                let hash = fingerprint(&inputs);

                if let Some(found) = existing.get(&hash) {
                    // Hash hit: refresh outputs/metadata in place, never
                    // re-upload attachments.
                    let Some(existing_id) = str_field(found, "id").map(str::to_string) else {
                        continue;
                    };
                    match self.update_example(&existing_id, &example).await {
                        Ok(()) => {
                            summary.mapping.insert(source_id, existing_id);
                            summary.updated += 1;
                        }
                        Err(err) => {
                            tracing::warn!("failed to update example {}: {}", existing_id, err);
                            summary.failed += 1;
                        }
                    }
                    continue;
                }

                let has_attachments = example
                    .get("attachment_urls")
                    .and_then(Value::as_object)
                    .is_some_and(|m| !m.is_empty());

                if has_attachments {
                    match self
                        .create_example_with_attachments(dest_dataset_id, &example)
                        .await
                    {
                        Ok(Some(new_id)) => {
                            summary.mapping.insert(source_id, new_id);
                            summary.created += 1;
                        }
                        Ok(None) => summary.failed += 1,
                        Err(err) if err.is_fatal() => return Err(err),
                        Err(err) => {
                            tracing::warn!(
                                "failed to create example {} with attachments: {}",
                                source_id,
                                err
                            );
                            summary.failed += 1;
                        }
                    }
                    continue;
                }

                batch.push((
                    source_id,
                    Self::example_payload(dest_dataset_id, &example),
                ));
                if batch.len() >= batch_size {
                    self.flush_batch(&mut batch, &mut summary).await?;
                }
            }
        }

        self.flush_batch(&mut batch, &mut summary).await?;

        tracing::debug!(
            "example migration for {}: {} created, {} updated, {} failed",
            source_dataset_id,
            summary.created,
            summary.updated,
            summary.failed
        );
        Ok(summary)
    }

    async fn flush_batch(
        &self,
        batch: &mut Vec<(String, Value)>,
        summary: &mut ExampleSummary,
    ) -> Result<(), MigrateError> {
        if batch.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(batch);
        let payloads: Vec<Value> = pending.iter().map(|(_, p)| p.clone()).collect();
        let result = self
            .ctx
            .dest
            .post_batch("/examples/bulk", payloads, self.ctx.batch_size())
            .await?;

        for ((source_id, _), slot) in pending.iter().zip(result.slots()) {
            match slot {
                Ok(body) => {
                    if let Some(new_id) = str_field(body, "id") {
                        summary.mapping.insert(source_id.clone(), new_id.to_string());
                    }
                    summary.created += 1;
                }
                Err(reason) => {
                    tracing::warn!("example {} failed in bulk create: {}", source_id, reason);
                    summary.failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Single-record path for examples with attachments: create the example,
    /// then obtain an upload URL per attachment and PUT the staged bytes.
    async fn create_example_with_attachments(
        &self,
        dest_dataset_id: &str,
        example: &Value,
    ) -> Result<Option<String>, MigrateError> {
        let attachment_urls = example
            .get("attachment_urls")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        // Stage every attachment before creating the example so a download
        // failure does not leave a half-populated record behind.
        let mut staged = Vec::new();
        for (key, info) in &attachment_urls {
            match self.source_blobs.stage(key, info).await {
                Ok(Some(attachment)) => staged.push(attachment),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!("failed to download attachment '{}': {}", key, err);
                }
            }
        }

        let payload = json!({
            "dataset_id": dest_dataset_id,
            "inputs": example.get("inputs").cloned().unwrap_or_else(|| json!({})),
            "outputs": example.get("outputs").cloned().unwrap_or_else(|| json!({})),
            "metadata": example.get("metadata").cloned().unwrap_or_else(|| json!({})),
        });
        let response = self.ctx.dest.post("/examples", &payload).await?;
        let Some(example_id) = str_field(&response, "id").map(str::to_string) else {
            tracing::warn!("example create response carried no id");
            return Ok(None);
        };

        for attachment in &staged {
            let upload = self
                .ctx
                .dest
                .post(
                    &format!("/examples/{example_id}/attachments"),
                    &json!({
                        "name": attachment.name,
                        "content_type": attachment.mime_type,
                    }),
                )
                .await;
            let upload = match upload {
                Ok(upload) => upload,
                Err(err) => {
                    tracing::warn!(
                        "no upload URL for attachment '{}' on example {}: {}",
                        attachment.name,
                        example_id,
                        err
                    );
                    continue;
                }
            };
            let Some(url) = str_field(&upload, "presigned_url")
                .or_else(|| str_field(&upload, "upload_url"))
            else {
                tracing::warn!(
                    "upload response for attachment '{}' carried no URL",
                    attachment.name
                );
                continue;
            };
            match self.dest_blobs.upload(url, attachment).await {
                Ok(()) => tracing::debug!(
                    "uploaded attachment '{}' ({} bytes) for example {}",
                    attachment.name,
                    attachment.size,
                    example_id
                ),
                Err(err) => tracing::warn!(
                    "failed to upload attachment '{}' for example {}: {}",
                    attachment.name,
                    example_id,
                    err
                ),
            }
        }

        Ok(Some(example_id))
    }

    /// Upsert one dataset and, when requested, stream its examples.
    pub async fn migrate_dataset(
        &self,
        dataset_id: &str,
        include_examples: bool,
    ) -> Result<(MigrationOutcome, ExampleSummary), MigrateError> {
        let dataset = self.get_dataset(dataset_id).await?;
        let name = record_name(&dataset);

        let outcome = match self.find_existing_dataset(name).await? {
            Some(existing_id) if self.ctx.skip_existing() => {
                tracing::debug!("dataset '{}' already exists, skipping write", name);
                MigrationOutcome::skipped_existing(existing_id)
            }
            Some(existing_id) => {
                self.update_dataset(&existing_id, &dataset).await?;
                MigrationOutcome::updated(existing_id)
            }
            None => {
                let new_id = self.create_dataset(&dataset).await?;
                tracing::debug!("created dataset '{}' -> {}", name, new_id);
                MigrationOutcome::created(new_id)
            }
        };

        self.ctx
            .record_mapping(ResourceKind::Dataset, dataset_id, &outcome.destination_id)
            .await;

        // A skipped dataset skips its children too; that is what makes a
        // second run with skip_existing a no-op.
        let mut summary = ExampleSummary::default();
        if include_examples && outcome.action != UpsertAction::SkippedExisting {
            summary = self
                .migrate_examples(dataset_id, &outcome.destination_id)
                .await?;
            self.ctx
                .merge_mappings(ResourceKind::Example, &summary.mapping)
                .await;
        }

        Ok((outcome, summary))
    }
}

#[async_trait]
impl ResourceMigrator for DatasetMigrator {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Dataset
    }

    async fn list(&self) -> Result<Vec<Value>, MigrateError> {
        self.list_datasets().await
    }

    async fn find_existing(
        &self,
        name: &str,
        _scope: Option<&str>,
    ) -> Result<Option<String>, MigrateError> {
        self.find_existing_dataset(name).await
    }

    async fn migrate(&self, source_id: &str) -> Result<MigrationOutcome, MigrateError> {
        let (outcome, _) = self.migrate_dataset(source_id, true).await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_payload_split_default() {
        let example = json!({
            "id": "e1",
            "inputs": {"q": 1},
            "outputs": null,
            "metadata": {"difficulty": "easy"},
        });
        let payload = DatasetMigrator::example_payload("ds-2", &example);
        assert_eq!(payload["split"], "base");
        assert_eq!(payload["dataset_id"], "ds-2");
        assert_eq!(payload["outputs"], json!({}));
    }

    #[test]
    fn test_example_payload_split_from_metadata() {
        let example = json!({
            "inputs": {"q": 1},
            "metadata": {"dataset_split": "validation"},
        });
        let payload = DatasetMigrator::example_payload("ds-2", &example);
        assert_eq!(payload["split"], "validation");
    }

    #[test]
    fn test_example_payload_drops_null_created_at() {
        let example = json!({"inputs": {"q": 1}, "created_at": null});
        let payload = DatasetMigrator::example_payload("ds-2", &example);
        assert!(payload.get("created_at").is_none());
    }
}
