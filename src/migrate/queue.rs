//! Annotation queue migration.
//!
//! Queues match by name. The listing endpoint has no name filter, so lookup
//! walks the destination listing. PATCH on an existing queue omits the
//! immutable fields (creation timestamps and session linkage arrays) the
//! server rejects on update.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{
    MigrationContext, MigrationOutcome, ResourceMigrator, record_name, str_field, strip_nulls,
};
use crate::errors::MigrateError;
use crate::resource::ResourceKind;

pub struct QueueMigrator {
    ctx: Arc<MigrationContext>,
}

impl QueueMigrator {
    pub fn new(ctx: Arc<MigrationContext>) -> Self {
        Self { ctx }
    }

    pub async fn list_queues(&self) -> Result<Vec<Value>, MigrateError> {
        self.ctx
            .source
            .paginate("/annotation-queues", Vec::new(), 100)
            .collect()
            .await
    }

    pub async fn get_queue(&self, queue_id: &str) -> Result<Value, MigrateError> {
        self.ctx
            .source
            .get(&format!("/annotation-queues/{queue_id}"), &[])
            .await
    }

    pub async fn find_existing_queue(&self, name: &str) -> Result<Option<String>, MigrateError> {
        let mut pager = self.ctx.dest.paginate("/annotation-queues", Vec::new(), 100);
        while let Some(page) = pager.next_page().await? {
            for queue in page {
                if str_field(&queue, "name") == Some(name) {
                    return Ok(queue
                        .get("id")
                        .and_then(Value::as_str)
                        .map(str::to_string));
                }
            }
        }
        Ok(None)
    }

    pub async fn update_queue(&self, queue_id: &str, queue: &Value) -> Result<(), MigrateError> {
        if self.ctx.dry_run() {
            tracing::info!(
                "[dry run] would update annotation queue '{}' ({})",
                record_name(queue),
                queue_id
            );
            return Ok(());
        }
        // created_at/updated_at and the session linkage arrays are immutable
        // on PATCH.
        let payload = strip_nulls(json!({
            "name": record_name(queue),
            "description": queue.get("description"),
            "num_reviewers_per_item": queue.get("num_reviewers_per_item"),
            "enable_reservations": queue.get("enable_reservations"),
            "reservation_minutes": queue.get("reservation_minutes"),
            "rubric_items": queue.get("rubric_items"),
            "rubric_instructions": queue.get("rubric_instructions"),
        }));
        self.ctx
            .dest
            .patch(&format!("/annotation-queues/{queue_id}"), &payload)
            .await?;
        Ok(())
    }

    /// Upsert one queue, optionally pointing its default dataset at an
    /// already-migrated destination dataset.
    pub async fn create_queue(
        &self,
        queue: &Value,
        default_dataset_id: Option<&str>,
    ) -> Result<MigrationOutcome, MigrateError> {
        let name = record_name(queue);

        if let Some(existing_id) = self.find_existing_queue(name).await? {
            if self.ctx.skip_existing() {
                tracing::debug!("annotation queue '{}' already exists, skipping write", name);
                return Ok(MigrationOutcome::skipped_existing(existing_id));
            }
            self.update_queue(&existing_id, queue).await?;
            return Ok(MigrationOutcome::updated(existing_id));
        }

        if self.ctx.dry_run() {
            tracing::info!("[dry run] would create annotation queue '{}'", name);
            return Ok(MigrationOutcome::created(format!(
                "dry-run-{}",
                str_field(queue, "id").unwrap_or("queue")
            )));
        }

        let payload = strip_nulls(json!({
            "name": name,
            "description": queue.get("description"),
            "created_at": queue.get("created_at"),
            "updated_at": queue.get("updated_at"),
            "default_dataset": default_dataset_id,
            "num_reviewers_per_item": queue.get("num_reviewers_per_item").cloned().unwrap_or(json!(1)),
            "enable_reservations": queue.get("enable_reservations").cloned().unwrap_or(json!(false)),
            "reservation_minutes": queue.get("reservation_minutes").cloned().unwrap_or(json!(60)),
            "rubric_items": queue.get("rubric_items").cloned().unwrap_or_else(|| json!([])),
            "rubric_instructions": queue.get("rubric_instructions"),
            "session_ids": [],
        }));

        let response = self.ctx.dest.post("/annotation-queues", &payload).await?;
        let new_id = str_field(&response, "id").ok_or_else(|| {
            MigrateError::protocol(
                "/annotation-queues",
                "create response carried no `id` field",
            )
        })?;
        Ok(MigrationOutcome::created(new_id))
    }

    /// Upsert one queue by source ID, remapping its default dataset through
    /// the dataset map when present.
    pub async fn migrate_queue(&self, queue_id: &str) -> Result<MigrationOutcome, MigrateError> {
        let queue = self.get_queue(queue_id).await?;

        let default_dataset = match str_field(&queue, "default_dataset") {
            Some(source_dataset_id) => {
                let mapped = self
                    .ctx
                    .mapped(ResourceKind::Dataset, source_dataset_id)
                    .await;
                if mapped.is_none() {
                    tracing::warn!(
                        "queue '{}' default dataset {} is not mapped; leaving it unset",
                        record_name(&queue),
                        source_dataset_id
                    );
                }
                mapped
            }
            None => None,
        };

        let outcome = self
            .create_queue(&queue, default_dataset.as_deref())
            .await?;
        self.ctx
            .record_mapping(ResourceKind::Queue, queue_id, &outcome.destination_id)
            .await;
        Ok(outcome)
    }
}

#[async_trait]
impl ResourceMigrator for QueueMigrator {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Queue
    }

    async fn list(&self) -> Result<Vec<Value>, MigrateError> {
        self.list_queues().await
    }

    async fn find_existing(
        &self,
        name: &str,
        _scope: Option<&str>,
    ) -> Result<Option<String>, MigrateError> {
        self.find_existing_queue(name).await
    }

    async fn migrate(&self, source_id: &str) -> Result<MigrationOutcome, MigrateError> {
        self.migrate_queue(source_id).await
    }
}
