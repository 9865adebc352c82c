//! Feedback migration.
//!
//! Feedback records hang off runs and are fetched per experiment session
//! with plain offset pagination (the endpoint wraps pages in a `feedback`
//! field). The platform has no batch feedback endpoint, so creation is one
//! record at a time. A record whose run was never mapped is skipped with a
//! visible reason rather than written with a dangling reference.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};

use super::{MigrationContext, str_field, strip_nulls};
use crate::errors::MigrateError;

/// Run-ID chunk size for the per-run listing; keeps the query string well
/// under URL length limits.
const RUN_CHUNK: usize = 50;

#[derive(Debug, Default)]
pub struct FeedbackSummary {
    pub found: usize,
    pub migrated: usize,
    pub skipped: usize,
}

pub struct FeedbackMigrator {
    ctx: Arc<MigrationContext>,
}

impl FeedbackMigrator {
    pub fn new(ctx: Arc<MigrationContext>) -> Self {
        Self { ctx }
    }

    /// Fetch all feedback for one experiment session.
    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<Value>, MigrateError> {
        let query = vec![("session".to_string(), session_id.to_string())];
        self.ctx
            .source
            .paginate("/feedback", query, 100)
            .with_items_key("feedback")
            .collect()
            .await
    }

    /// Fetch feedback for an explicit run set, chunked to keep URLs short.
    pub async fn list_for_runs(&self, run_ids: &[String]) -> Result<Vec<Value>, MigrateError> {
        let mut all = Vec::new();
        for chunk in run_ids.chunks(RUN_CHUNK) {
            let query = vec![("run".to_string(), chunk.join(","))];
            let page = self
                .ctx
                .source
                .paginate("/feedback", query, 100)
                .with_items_key("feedback")
                .collect()
                .await?;
            all.extend(page);
        }
        Ok(all)
    }

    /// Create one feedback record on the destination.
    pub async fn create_feedback(&self, feedback: &Value) -> Result<(), MigrateError> {
        if self.ctx.dry_run() {
            tracing::info!(
                "[dry run] would create feedback '{}'",
                str_field(feedback, "key").unwrap_or("unnamed")
            );
            return Ok(());
        }
        self.ctx.dest.post("/feedback", feedback).await?;
        Ok(())
    }

    /// Rewrite one source feedback record against the run map, or `None`
    /// when its run was never migrated.
    fn transform_feedback(
        feedback: &Value,
        run_map: &HashMap<String, String>,
    ) -> Option<Value> {
        let key = str_field(feedback, "key")?;
        let dest_run_id = match str_field(feedback, "run_id") {
            Some(source_run_id) => match run_map.get(source_run_id) {
                Some(dest) => Some(dest.clone()),
                None => {
                    tracing::warn!(
                        "skipping feedback '{}': run {} is not in the run map",
                        key,
                        source_run_id
                    );
                    return None;
                }
            },
            None => None,
        };

        Some(strip_nulls(json!({
            "run_id": dest_run_id,
            "key": key,
            "score": feedback.get("score"),
            "value": feedback.get("value"),
            "comment": feedback.get("comment"),
            "correction": feedback.get("correction"),
            "feedback_source": feedback.get("feedback_source"),
        })))
    }

    /// Migrate all feedback attached to the given experiments.
    pub async fn migrate_for_experiments(
        &self,
        experiment_map: &HashMap<String, String>,
        run_map: &HashMap<String, String>,
    ) -> Result<FeedbackSummary, MigrateError> {
        let mut summary = FeedbackSummary::default();
        if experiment_map.is_empty() {
            return Ok(summary);
        }

        for source_experiment_id in experiment_map.keys() {
            let feedbacks = match self.list_for_session(source_experiment_id).await {
                Ok(feedbacks) => feedbacks,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        "failed to list feedback for experiment {}: {}",
                        source_experiment_id,
                        err
                    );
                    continue;
                }
            };
            if feedbacks.is_empty() {
                continue;
            }
            summary.found += feedbacks.len();

            for feedback in &feedbacks {
                let Some(migrated) = Self::transform_feedback(feedback, run_map) else {
                    summary.skipped += 1;
                    continue;
                };
                match self.create_feedback(&migrated).await {
                    Ok(()) => summary.migrated += 1,
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        tracing::warn!(
                            "failed to create feedback '{}': {}",
                            str_field(&migrated, "key").unwrap_or("unnamed"),
                            err
                        );
                    }
                }
            }
        }

        tracing::debug!(
            "feedback migration: {} found, {} migrated, {} skipped",
            summary.found,
            summary.migrated,
            summary.skipped
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::pagination::extract_items;

    #[test]
    fn test_transform_maps_run() {
        let run_map = HashMap::from([("run-1".to_string(), "run-2".to_string())]);
        let feedback = json!({
            "run_id": "run-1",
            "key": "accuracy",
            "score": 0.9,
            "comment": null,
        });
        let migrated = FeedbackMigrator::transform_feedback(&feedback, &run_map).unwrap();
        assert_eq!(migrated["run_id"], "run-2");
        assert_eq!(migrated["key"], "accuracy");
        assert!(migrated.get("comment").is_none());
    }

    #[test]
    fn test_transform_skips_unmapped_run() {
        let feedback = json!({"run_id": "run-x", "key": "accuracy"});
        assert!(FeedbackMigrator::transform_feedback(&feedback, &HashMap::new()).is_none());
    }

    #[test]
    fn test_transform_allows_runless_feedback() {
        let feedback = json!({"key": "note", "comment": "general"});
        let migrated =
            FeedbackMigrator::transform_feedback(&feedback, &HashMap::new()).unwrap();
        assert!(migrated.get("run_id").is_none());
        assert_eq!(migrated["comment"], "general");
    }

    #[test]
    fn test_feedback_page_shape() {
        let body = json!({"feedback": [{"id": "f1"}, {"id": "f2"}]});
        assert_eq!(extract_items(&body, Some("feedback")).len(), 2);
    }
}
