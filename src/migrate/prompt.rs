//! Prompt repository migration.
//!
//! A prompt repo (`owner/handle`) contains a commit DAG whose manifests are
//! server-opaque: the engine never deserializes a model object, it pulls
//! each commit's raw manifest with `include_model=true` and posts it back
//! verbatim. DAG mode replays commits root to tip, threading `parent_commit`
//! through the destination's current latest hash (fetched per push); non-DAG
//! mode pushes only the latest manifest. Repo creation is attempted before
//! the first commit and a 409 there simply means the repo already exists.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{MigrationContext, MigrationOutcome, ResourceMigrator, str_field, strip_nulls};
use crate::errors::MigrateError;
use crate::resource::ResourceKind;

#[derive(Debug, Clone)]
pub struct PromptOptions {
    /// Replay the whole commit DAG instead of just the latest manifest.
    pub include_all_commits: bool,
    /// Treat an empty-detail 409 on commit push as "already up to date".
    /// The detection is brittle against server changes, so it can be turned
    /// off.
    pub conflict_means_synced: bool,
}

impl Default for PromptOptions {
    fn default() -> Self {
        Self {
            include_all_commits: false,
            conflict_means_synced: true,
        }
    }
}

/// One node of a prompt repo's commit DAG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptCommit {
    pub commit_hash: String,
    pub parent_commit_hash: Option<String>,
}

/// What a single commit push did on the destination.
#[derive(Debug, PartialEq, Eq)]
enum PushOutcome {
    Created(String),
    AlreadyUpToDate,
}

/// Split an `owner/handle` identifier; a bare handle belongs to the
/// tenant-default `-` owner.
pub fn split_handle(handle: &str) -> (&str, &str) {
    match handle.split_once('/') {
        Some((owner, repo)) => (owner, repo),
        None => ("-", handle),
    }
}

/// Order commits root to tip: parents always precede their children.
///
/// Commits whose parent is unknown (or absent) count as roots. Anything left
/// over after the walk (a cycle, or a parent outside the listing) is
/// appended in listing order so nothing is silently dropped.
pub fn order_root_to_tip(commits: Vec<PromptCommit>) -> Vec<PromptCommit> {
    let known: HashSet<String> = commits.iter().map(|c| c.commit_hash.clone()).collect();
    let mut emitted: HashSet<String> = HashSet::new();
    let mut ordered = Vec::with_capacity(commits.len());
    let mut remaining: Vec<PromptCommit> = commits;

    loop {
        let mut progressed = false;
        let mut rest = Vec::new();
        for commit in remaining {
            let ready = match &commit.parent_commit_hash {
                None => true,
                Some(parent) => !known.contains(parent.as_str()) || emitted.contains(parent),
            };
            if ready {
                emitted.insert(commit.commit_hash.clone());
                ordered.push(commit);
                progressed = true;
            } else {
                rest.push(commit);
            }
        }
        remaining = rest;
        if remaining.is_empty() {
            break;
        }
        if !progressed {
            tracing::warn!(
                "{} prompt commit(s) have unresolved parents; keeping listing order",
                remaining.len()
            );
            ordered.append(&mut remaining);
            break;
        }
    }
    ordered
}

pub struct PromptMigrator {
    ctx: Arc<MigrationContext>,
}

impl PromptMigrator {
    pub fn new(ctx: Arc<MigrationContext>) -> Self {
        Self { ctx }
    }

    /// List the tenant's private prompts from the source.
    pub async fn list_prompts(&self) -> Result<Vec<Value>, MigrateError> {
        let query = vec![
            ("is_public".to_string(), "false".to_string()),
            ("is_archived".to_string(), "false".to_string()),
        ];
        self.ctx
            .source
            .paginate("/prompts", query, 100)
            .with_items_key("repos")
            .collect()
            .await
    }

    /// List a repo's commits (hash + parent hash) from the source.
    pub async fn list_commits(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<PromptCommit>, MigrateError> {
        let raw = self
            .ctx
            .source
            .paginate(&format!("/commits/{owner}/{repo}"), Vec::new(), 100)
            .with_items_key("commits")
            .collect()
            .await?;

        Ok(raw
            .iter()
            .filter_map(|commit| {
                let hash = str_field(commit, "commit_hash")?;
                Some(PromptCommit {
                    commit_hash: hash.to_string(),
                    parent_commit_hash: str_field(commit, "parent_commit_hash")
                        .map(str::to_string),
                })
            })
            .collect())
    }

    /// Pull one commit's raw manifest (`latest` accepted) from the source,
    /// model serialization included.
    pub async fn pull_manifest(
        &self,
        owner: &str,
        repo: &str,
        commit: &str,
    ) -> Result<Option<Value>, MigrateError> {
        let response = self
            .ctx
            .source
            .get(
                &format!("/commits/{owner}/{repo}/{commit}"),
                &[("include_model", "true".to_string())],
            )
            .await?;
        Ok(response.get("manifest").cloned().filter(|m| !m.is_null()))
    }

    /// The destination repo's current latest commit hash, or `None` for a
    /// repo without commits (or that does not exist yet).
    async fn dest_latest_hash(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Option<String>, MigrateError> {
        match self
            .ctx
            .dest
            .get(&format!("/commits/{owner}/{repo}/latest"), &[])
            .await
        {
            Ok(response) => Ok(str_field(&response, "commit_hash")
                .or_else(|| {
                    response
                        .get("commit")
                        .and_then(|c| c.get("commit_hash"))
                        .and_then(Value::as_str)
                })
                .map(str::to_string)),
            Err(MigrateError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Create the destination repo; a conflict means it already exists.
    async fn ensure_repo(&self, handle: &str, prompt: &Value) -> Result<(), MigrateError> {
        let payload = strip_nulls(json!({
            "repo_handle": handle,
            "description": str_field(prompt, "description").unwrap_or(""),
            "readme": str_field(prompt, "readme").unwrap_or(""),
            "tags": prompt.get("tags").cloned().unwrap_or_else(|| json!([])),
            "is_public": false,
        }));
        match self.ctx.dest.post("/prompts", &payload).await {
            Ok(_) => {
                tracing::debug!("created prompt repo {}", handle);
                Ok(())
            }
            Err(MigrateError::Conflict { .. }) => {
                tracing::debug!("prompt repo {} already exists", handle);
                Ok(())
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                // The repo may exist in a form the probe cannot see; the
                // commit push below is the authoritative check.
                tracing::warn!("could not create prompt repo {}: {}", handle, err);
                Ok(())
            }
        }
    }

    /// Push one raw manifest, chaining it onto the destination's latest.
    async fn push_commit(
        &self,
        owner: &str,
        repo: &str,
        manifest: &Value,
        parent_commit: Option<&str>,
        options: &PromptOptions,
    ) -> Result<PushOutcome, MigrateError> {
        let payload = strip_nulls(json!({
            "manifest": manifest,
            "parent_commit": parent_commit,
        }));
        let endpoint = format!("/commits/{owner}/{repo}");

        match self.ctx.dest.post(&endpoint, &payload).await {
            Ok(response) => {
                let hash = str_field(&response, "commit_hash")
                    .or_else(|| {
                        response
                            .get("commit")
                            .and_then(|c| c.get("commit_hash"))
                            .and_then(Value::as_str)
                    })
                    .unwrap_or("unknown");
                Ok(PushOutcome::Created(hash.to_string()))
            }
            Err(MigrateError::Conflict { detail, .. })
                if options.conflict_means_synced
                    && (detail.is_empty() || detail == "no response body") =>
            {
                // The push carried parent_commit = destination latest, so an
                // empty-detail conflict is the server saying the commit is
                // already there.
                Ok(PushOutcome::AlreadyUpToDate)
            }
            Err(err) => Err(err),
        }
    }

    /// Migrate one prompt repo.
    pub async fn migrate_prompt(
        &self,
        prompt: &Value,
        options: &PromptOptions,
    ) -> Result<MigrationOutcome, MigrateError> {
        let Some(handle) = str_field(prompt, "repo_handle") else {
            return Err(MigrateError::skipped("prompt record has no repo_handle"));
        };
        if self.ctx.dry_run() {
            tracing::info!("[dry run] would migrate prompt {}", handle);
            return Ok(MigrationOutcome::created(handle));
        }

        let (owner, repo) = split_handle(handle);
        self.ensure_repo(handle, prompt).await?;

        let mut created = 0usize;
        let mut synced = 0usize;

        if options.include_all_commits {
            let commits = order_root_to_tip(self.list_commits(owner, repo).await?);
            tracing::debug!("replaying {} commit(s) for {}", commits.len(), handle);

            for commit in &commits {
                let manifest = match self.pull_manifest(owner, repo, &commit.commit_hash).await {
                    Ok(Some(manifest)) => manifest,
                    Ok(None) => {
                        tracing::warn!(
                            "commit {} of {} has no manifest, skipping",
                            &commit.commit_hash[..commit.commit_hash.len().min(16)],
                            handle
                        );
                        continue;
                    }
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        tracing::warn!(
                            "failed to pull commit {} of {}: {}",
                            &commit.commit_hash[..commit.commit_hash.len().min(16)],
                            handle,
                            err
                        );
                        continue;
                    }
                };

                let parent = self.dest_latest_hash(owner, repo).await?;
                match self
                    .push_commit(owner, repo, &manifest, parent.as_deref(), options)
                    .await
                {
                    Ok(PushOutcome::Created(hash)) => {
                        tracing::debug!(
                            "pushed commit {} -> {} for {}",
                            &commit.commit_hash[..commit.commit_hash.len().min(16)],
                            &hash[..hash.len().min(16)],
                            handle
                        );
                        created += 1;
                    }
                    Ok(PushOutcome::AlreadyUpToDate) => synced += 1,
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        tracing::warn!(
                            "failed to push commit {} of {}: {}",
                            &commit.commit_hash[..commit.commit_hash.len().min(16)],
                            handle,
                            err
                        );
                    }
                }
            }

            // A repo whose commit listing produced nothing usable still gets
            // its latest manifest.
            if created == 0 && synced == 0 {
                tracing::debug!("no commits replayed for {}, pushing latest only", handle);
                match self.migrate_latest(owner, repo, options).await? {
                    PushOutcome::Created(_) => created += 1,
                    PushOutcome::AlreadyUpToDate => synced += 1,
                }
            }
        } else {
            match self.migrate_latest(owner, repo, options).await? {
                PushOutcome::Created(_) => created += 1,
                PushOutcome::AlreadyUpToDate => synced += 1,
            }
        }

        self.ctx
            .record_mapping(ResourceKind::Prompt, handle, handle)
            .await;

        if created == 0 {
            Ok(MigrationOutcome::skipped_existing(handle))
        } else {
            Ok(MigrationOutcome::created(handle))
        }
    }

    async fn migrate_latest(
        &self,
        owner: &str,
        repo: &str,
        options: &PromptOptions,
    ) -> Result<PushOutcome, MigrateError> {
        let manifest = self
            .pull_manifest(owner, repo, "latest")
            .await?
            .ok_or_else(|| {
                MigrateError::skipped(format!("prompt {owner}/{repo} has no latest manifest"))
            })?;
        let parent = self.dest_latest_hash(owner, repo).await?;
        self.push_commit(owner, repo, &manifest, parent.as_deref(), options)
            .await
    }
}

#[async_trait]
impl ResourceMigrator for PromptMigrator {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Prompt
    }

    async fn list(&self) -> Result<Vec<Value>, MigrateError> {
        self.list_prompts().await
    }

    async fn find_existing(
        &self,
        name: &str,
        _scope: Option<&str>,
    ) -> Result<Option<String>, MigrateError> {
        let (owner, repo) = split_handle(name);
        Ok(self
            .dest_latest_hash(owner, repo)
            .await?
            .map(|_| name.to_string()))
    }

    async fn migrate(&self, source_id: &str) -> Result<MigrationOutcome, MigrateError> {
        let record = json!({ "repo_handle": source_id });
        self.migrate_prompt(&record, &PromptOptions::default()).await
    }
}
