//! Cross-kind orchestration.
//!
//! The orchestrator owns the phase ordering and the worker pool. Datasets
//! fan out across a bounded set of workers (each worker migrates one dataset
//! including its examples); the dependent phases then run in sequence,
//! consuming the ID maps the earlier phases populated. One item failing
//! never aborts the pool: the item is marked Failed in the session and the
//! run continues. Only authentication/authorization failures abort the whole
//! run, because no later request can succeed.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::chart::ChartMigrator;
use super::dataset::DatasetMigrator;
use super::experiment::ExperimentMigrator;
use super::feedback::FeedbackMigrator;
use super::prompt::{PromptMigrator, PromptOptions};
use super::queue::QueueMigrator;
use super::rule::{RuleMigrator, RuleOptions};
use super::{
    MigrationContext, MigrationOutcome, MigrationReport, ResourceMigrator, record_name, str_field,
};
use crate::errors::MigrateError;
use crate::resource::ResourceKind;
use crate::session::{MAX_ATTEMPTS, MigrationItem, MigrationStatus};

/// Phase selection for a full-tenant migration.
#[derive(Debug, Clone, Default)]
pub struct MigrateAllOptions {
    pub skip_datasets: bool,
    pub skip_experiments: bool,
    pub skip_prompts: bool,
    pub skip_queues: bool,
    pub skip_rules: bool,
    pub skip_charts: bool,
    pub prompt_options: PromptOptions,
    pub rule_options: RuleOptions,
}

pub struct Orchestrator {
    ctx: Arc<MigrationContext>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<MigrationContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<MigrationContext> {
        &self.ctx
    }

    /// Probe both instances before doing any work.
    pub async fn test_connections(&self) -> (Result<(), String>, Result<(), String>) {
        let source = self.ctx.source.test_connection().await;
        let dest = self.ctx.dest.test_connection().await;
        (source, dest)
    }

    /// Record an item's terminal state and fold it into the report.
    ///
    /// Policy skips (`Skipped`, `UnmappedReference`) are not failures; fatal
    /// auth errors abort the run after the item is marked.
    async fn finish_item(
        &self,
        report: &mut MigrationReport,
        kind: ResourceKind,
        item_id: &str,
        result: Result<MigrationOutcome, MigrateError>,
    ) -> Result<(), MigrateError> {
        match result {
            Ok(outcome) => {
                report.record_outcome(kind, outcome.action);
                self.ctx
                    .update_item(
                        item_id,
                        MigrationStatus::Completed,
                        Some(&outcome.destination_id),
                        None,
                    )
                    .await
            }
            Err(err @ (MigrateError::Skipped(_) | MigrateError::UnmappedReference { .. })) => {
                tracing::warn!("{}: {}", item_id, err);
                report.record_skip(kind);
                self.ctx
                    .update_item(item_id, MigrationStatus::Skipped, None, Some(&err.to_string()))
                    .await
            }
            Err(err) if err.is_fatal() => {
                self.ctx
                    .update_item(item_id, MigrationStatus::Failed, None, Some(&err.to_string()))
                    .await?;
                Err(err)
            }
            Err(err) => {
                tracing::warn!("{} failed: {}", item_id, err);
                report.record_failure(kind);
                self.ctx
                    .update_item(item_id, MigrationStatus::Failed, None, Some(&err.to_string()))
                    .await
            }
        }
    }

    /// Phase 1: fan datasets out across the worker pool.
    pub async fn migrate_datasets(
        &self,
        dataset_ids: Vec<String>,
        include_examples: bool,
        include_experiments: bool,
    ) -> Result<MigrationReport, MigrateError> {
        let mut report = MigrationReport::default();
        if dataset_ids.is_empty() {
            tracing::info!("no datasets selected");
            return Ok(report);
        }

        let migrator = Arc::new(DatasetMigrator::new(self.ctx.clone())?);

        for dataset_id in &dataset_ids {
            let name = match migrator.get_dataset(dataset_id).await {
                Ok(dataset) => record_name(&dataset).to_string(),
                Err(err) if err.is_fatal() => return Err(err),
                Err(_) => dataset_id.clone(),
            };
            self.ctx
                .add_item(MigrationItem::new(ResourceKind::Dataset, dataset_id, &name))
                .await;
        }
        self.ctx.save_state().await?;

        let workers = self.ctx.config.migration.concurrent_workers.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut pool: JoinSet<(String, Result<_, MigrateError>)> = JoinSet::new();

        for dataset_id in dataset_ids.iter().cloned() {
            let semaphore = semaphore.clone();
            let migrator = migrator.clone();
            let ctx = self.ctx.clone();
            pool.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            dataset_id,
                            Err(MigrateError::State("worker pool closed".to_string())),
                        );
                    }
                };
                let item_id = format!("dataset_{dataset_id}");
                if let Err(err) = ctx
                    .update_item(&item_id, MigrationStatus::InProgress, None, None)
                    .await
                {
                    tracing::warn!("could not persist in-progress state: {}", err);
                }
                let result = migrator.migrate_dataset(&dataset_id, include_examples).await;
                (dataset_id, result)
            });
        }

        let total = dataset_ids.len();
        let mut completed = 0usize;
        let mut fatal: Option<MigrateError> = None;

        while let Some(joined) = pool.join_next().await {
            let (dataset_id, result) = joined
                .map_err(|e| MigrateError::State(format!("dataset worker panicked: {e}")))?;
            completed += 1;
            let item_id = format!("dataset_{dataset_id}");

            let outcome = result.map(|(outcome, examples)| {
                report.record_created(ResourceKind::Example, examples.created);
                let example_counts =
                    report.by_kind.entry(ResourceKind::Example).or_default();
                example_counts.updated += examples.updated;
                example_counts.failed += examples.failed;
                outcome
            });
            match self
                .finish_item(&mut report, ResourceKind::Dataset, &item_id, outcome)
                .await
            {
                Ok(()) => {}
                Err(err) => {
                    // Drain the pool before surfacing the fatal error so the
                    // session file reflects every worker's final state.
                    fatal.get_or_insert(err);
                }
            }
            tracing::info!("datasets: {}/{} processed", completed, total);
        }

        if let Some(err) = fatal {
            return Err(err);
        }

        if include_experiments {
            let experiments = self.migrate_experiments_for_datasets(&dataset_ids).await?;
            report.merge(&experiments);
        }

        Ok(report)
    }

    /// Phases 2-4: experiments, then runs, then feedback, each consuming the
    /// maps populated before it.
    pub async fn migrate_experiments_for_datasets(
        &self,
        dataset_ids: &[String],
    ) -> Result<MigrationReport, MigrateError> {
        let mut report = MigrationReport::default();
        let migrator = ExperimentMigrator::new(self.ctx.clone());
        let dataset_map = self.ctx.mapping_snapshot(ResourceKind::Dataset).await;

        // Phase 2: experiments.
        let mut migrated_experiments: HashMap<String, String> = HashMap::new();
        for dataset_id in dataset_ids {
            let Some(dest_dataset_id) = dataset_map.get(dataset_id) else {
                tracing::warn!(
                    "skipping experiments of dataset {}: dataset was not migrated",
                    dataset_id
                );
                continue;
            };

            let experiments = match migrator.list_experiments(dataset_id).await {
                Ok(experiments) => experiments,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        "failed to list experiments for dataset {}: {}",
                        dataset_id,
                        err
                    );
                    continue;
                }
            };

            for experiment in &experiments {
                let Some(experiment_id) = str_field(experiment, "id").map(str::to_string)
                else {
                    continue;
                };
                let item = MigrationItem::new(
                    ResourceKind::Experiment,
                    &experiment_id,
                    record_name(experiment),
                );
                let item_id = item.id.clone();
                self.ctx.add_item(item).await;
                self.ctx
                    .update_item(&item_id, MigrationStatus::InProgress, None, None)
                    .await?;

                let result = migrator
                    .create_experiment(experiment, dest_dataset_id)
                    .await;
                if let Ok(outcome) = &result {
                    migrated_experiments
                        .insert(experiment_id.clone(), outcome.destination_id.clone());
                    self.ctx
                        .record_mapping(
                            ResourceKind::Experiment,
                            &experiment_id,
                            &outcome.destination_id,
                        )
                        .await;
                }
                self.finish_item(&mut report, ResourceKind::Experiment, &item_id, result)
                    .await?;
            }
        }

        if migrated_experiments.is_empty() {
            tracing::info!("no experiments migrated; skipping runs and feedback");
            return Ok(report);
        }

        // Phase 3: runs, strictly after every experiment of the phase.
        let example_map = self.ctx.mapping_snapshot(ResourceKind::Example).await;
        let experiment_ids: Vec<String> = migrated_experiments.keys().cloned().collect();
        let runs = migrator
            .migrate_runs(&experiment_ids, &migrated_experiments, &example_map)
            .await?;
        report.record_created(ResourceKind::Run, runs.migrated);
        for _ in 0..runs.skipped {
            report.record_skip(ResourceKind::Run);
        }
        self.ctx
            .merge_mappings(ResourceKind::Run, &runs.mapping)
            .await;
        self.ctx.save_state().await?;

        // Phase 4: feedback, through the run map.
        let feedback = FeedbackMigrator::new(self.ctx.clone());
        let summary = feedback
            .migrate_for_experiments(&migrated_experiments, &runs.mapping)
            .await?;
        report.record_created(ResourceKind::Feedback, summary.migrated);
        for _ in 0..summary.skipped {
            report.record_skip(ResourceKind::Feedback);
        }
        self.ctx.save_state().await?;

        Ok(report)
    }

    /// Phase 5: prompts (independent of the dataset graph).
    pub async fn migrate_prompts(
        &self,
        prompts: Vec<Value>,
        options: &PromptOptions,
    ) -> Result<MigrationReport, MigrateError> {
        let mut report = MigrationReport::default();
        let migrator = PromptMigrator::new(self.ctx.clone());

        for prompt in &prompts {
            let Some(handle) = str_field(prompt, "repo_handle").map(str::to_string) else {
                tracing::warn!("prompt record without repo_handle, skipping");
                report.record_skip(ResourceKind::Prompt);
                continue;
            };
            let item = MigrationItem::new(ResourceKind::Prompt, &handle, &handle);
            let item_id = item.id.clone();
            self.ctx.add_item(item).await;
            self.ctx
                .update_item(&item_id, MigrationStatus::InProgress, None, None)
                .await?;

            let result = migrator.migrate_prompt(prompt, options).await;
            self.finish_item(&mut report, ResourceKind::Prompt, &item_id, result)
                .await?;
        }
        Ok(report)
    }

    /// Phase 6: annotation queues.
    pub async fn migrate_queues(
        &self,
        queue_ids: Vec<String>,
    ) -> Result<MigrationReport, MigrateError> {
        let mut report = MigrationReport::default();
        let migrator = QueueMigrator::new(self.ctx.clone());

        for queue_id in &queue_ids {
            let name = match migrator.get_queue(queue_id).await {
                Ok(queue) => record_name(&queue).to_string(),
                Err(err) if err.is_fatal() => return Err(err),
                Err(_) => queue_id.clone(),
            };
            let item = MigrationItem::new(ResourceKind::Queue, queue_id, &name);
            let item_id = item.id.clone();
            self.ctx.add_item(item).await;
            self.ctx
                .update_item(&item_id, MigrationStatus::InProgress, None, None)
                .await?;

            let result = migrator.migrate_queue(queue_id).await;
            self.finish_item(&mut report, ResourceKind::Queue, &item_id, result)
                .await?;
        }
        Ok(report)
    }

    /// Phase 7: automation rules, after project and dataset maps exist.
    pub async fn migrate_rules(
        &self,
        rule_ids: Option<Vec<String>>,
        options: &RuleOptions,
    ) -> Result<MigrationReport, MigrateError> {
        let mut report = MigrationReport::default();
        let migrator = RuleMigrator::new(self.ctx.clone());

        let rules = migrator.list_rules().await?;
        let selected: Vec<&Value> = match &rule_ids {
            Some(ids) => rules
                .iter()
                .filter(|rule| {
                    str_field(rule, "id").is_some_and(|id| ids.iter().any(|sel| sel == id))
                })
                .collect(),
            None => rules.iter().collect(),
        };

        for rule in selected {
            let Some(rule_id) = str_field(rule, "id").map(str::to_string) else {
                continue;
            };
            let item = MigrationItem::new(ResourceKind::Rule, &rule_id, record_name(rule));
            let item_id = item.id.clone();
            self.ctx.add_item(item).await;
            self.ctx
                .update_item(&item_id, MigrationStatus::InProgress, None, None)
                .await?;

            let result = migrator.create_rule(rule, options).await;
            if let Ok(outcome) = &result {
                self.ctx
                    .record_mapping(ResourceKind::Rule, &rule_id, &outcome.destination_id)
                    .await;
            }
            self.finish_item(&mut report, ResourceKind::Rule, &item_id, result)
                .await?;
        }
        Ok(report)
    }

    /// Phase 8: dashboard charts, last because they reference everything.
    pub async fn migrate_charts(&self) -> Result<MigrationReport, MigrateError> {
        let mut report = MigrationReport::default();
        let migrator = ChartMigrator::new(self.ctx.clone());

        let charts = migrator.list_source_charts().await?;
        for entry in &charts {
            let Some(chart_id) = str_field(&entry.chart, "id").map(str::to_string) else {
                continue;
            };
            let title = str_field(&entry.chart, "title")
                .or_else(|| str_field(&entry.chart, "name"))
                .unwrap_or("Untitled Chart");
            let item = MigrationItem::new(ResourceKind::Chart, &chart_id, title);
            let item_id = item.id.clone();
            self.ctx.add_item(item).await;
            self.ctx
                .update_item(&item_id, MigrationStatus::InProgress, None, None)
                .await?;

            let result = migrator.migrate_chart(entry).await;
            self.finish_item(&mut report, ResourceKind::Chart, &item_id, result)
                .await?;
        }
        Ok(report)
    }

    /// Full-tenant migration in dependency order.
    pub async fn migrate_all(
        &self,
        options: &MigrateAllOptions,
    ) -> Result<MigrationReport, MigrateError> {
        let mut report = MigrationReport::default();

        if !options.skip_datasets {
            let migrator = DatasetMigrator::new(self.ctx.clone())?;
            let dataset_ids: Vec<String> = migrator
                .list_datasets()
                .await?
                .iter()
                .filter_map(|d| str_field(d, "id").map(str::to_string))
                .collect();
            let include_experiments = !options.skip_experiments;
            report.merge(
                &self
                    .migrate_datasets(dataset_ids, true, include_experiments)
                    .await?,
            );
        }

        if !options.skip_prompts {
            let migrator = PromptMigrator::new(self.ctx.clone());
            let prompts = migrator.list_prompts().await?;
            report.merge(&self.migrate_prompts(prompts, &options.prompt_options).await?);
        }

        if !options.skip_queues {
            let migrator = QueueMigrator::new(self.ctx.clone());
            let queue_ids: Vec<String> = migrator
                .list_queues()
                .await?
                .iter()
                .filter_map(|q| str_field(q, "id").map(str::to_string))
                .collect();
            report.merge(&self.migrate_queues(queue_ids).await?);
        }

        if !options.skip_rules {
            report.merge(&self.migrate_rules(None, &options.rule_options).await?);
        }

        if !options.skip_charts {
            report.merge(&self.migrate_charts().await?);
        }

        self.ctx.save_state().await?;
        Ok(report)
    }

    /// Resume a loaded session: pending and still-retryable failed items are
    /// the new input.
    ///
    /// Datasets go back through the worker pool (their children ride along);
    /// standalone kinds re-run through the shared migrator contract. Run and
    /// feedback items are children of their experiment and are reprocessed
    /// by resuming that experiment, never on their own.
    pub async fn resume(&self) -> Result<MigrationReport, MigrateError> {
        let (pending, failed) = self
            .ctx
            .with_state_mut(|state| {
                (state.pending_items(None), state.failed_items(MAX_ATTEMPTS))
            })
            .await;

        let mut dataset_ids = Vec::new();
        let mut standalone = Vec::new();
        let mut children = 0usize;
        for item in pending.into_iter().chain(failed) {
            match item.kind {
                ResourceKind::Dataset => dataset_ids.push(item.source_id.clone()),
                ResourceKind::Run | ResourceKind::Feedback | ResourceKind::Example => {
                    children += 1;
                }
                _ => standalone.push(item),
            }
        }
        if children > 0 {
            tracing::warn!(
                "{} child item(s) are reprocessed through their parent, not standalone",
                children
            );
        }
        if dataset_ids.is_empty() && standalone.is_empty() {
            tracing::info!("nothing to resume");
            return Ok(MigrationReport::default());
        }

        let mut report = MigrationReport::default();
        if !dataset_ids.is_empty() {
            tracing::info!("resuming {} dataset(s)", dataset_ids.len());
            report.merge(&self.migrate_datasets(dataset_ids, true, false).await?);
        }

        for item in standalone {
            let migrator: Box<dyn ResourceMigrator> = match item.kind {
                ResourceKind::Experiment => Box::new(ExperimentMigrator::new(self.ctx.clone())),
                ResourceKind::Queue => Box::new(QueueMigrator::new(self.ctx.clone())),
                ResourceKind::Prompt => Box::new(PromptMigrator::new(self.ctx.clone())),
                ResourceKind::Rule => Box::new(RuleMigrator::new(self.ctx.clone())),
                ResourceKind::Chart => Box::new(ChartMigrator::new(self.ctx.clone())),
                ResourceKind::Dataset
                | ResourceKind::Run
                | ResourceKind::Feedback
                | ResourceKind::Example => continue,
            };
            tracing::info!("resuming {} '{}'", migrator.kind(), item.name);
            self.ctx
                .update_item(&item.id, MigrationStatus::InProgress, None, None)
                .await?;
            let result = migrator.migrate(&item.source_id).await;
            self.finish_item(&mut report, item.kind, &item.id, result)
                .await?;
        }

        Ok(report)
    }
}
