//! Command-line front-end for the migration engine.
//!
//! The interactive selector UI lives outside this crate; these commands are
//! the non-interactive surface it drives. Data commands invoked without an
//! item selection print the source listing and exit, which is also the
//! contract any selector consumes.

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

use trace_migrate::config::Config;
use trace_migrate::errors::MigrateError;
use trace_migrate::migrate::orchestrator::{MigrateAllOptions, Orchestrator};
use trace_migrate::migrate::prompt::{PromptMigrator, PromptOptions};
use trace_migrate::migrate::queue::QueueMigrator;
use trace_migrate::migrate::rule::{RuleMigrator, RuleOptions};
use trace_migrate::migrate::{MigrationContext, MigrationReport};
use trace_migrate::migrate::dataset::DatasetMigrator;
use trace_migrate::session::SessionStore;

#[derive(Parser)]
#[command(
    name = "trace-migrate",
    version,
    about = "Migrate datasets, experiments, runs, feedback, prompts, rules, and dashboards between two platform instances"
)]
struct Cli {
    /// Source instance API key
    #[arg(long, env = "TRACEHUB_OLD_API_KEY", hide_env_values = true, global = true)]
    source_key: Option<String>,

    /// Destination instance API key
    #[arg(long, env = "TRACEHUB_NEW_API_KEY", hide_env_values = true, global = true)]
    dest_key: Option<String>,

    /// Source instance base URL
    #[arg(long, env = "TRACEHUB_OLD_BASE_URL", global = true)]
    source_url: Option<String>,

    /// Destination instance base URL
    #[arg(long, env = "TRACEHUB_NEW_BASE_URL", global = true)]
    dest_url: Option<String>,

    /// Disable TLS certificate verification (self-hosted private CAs)
    #[arg(long, global = true)]
    no_verify_tls: bool,

    /// Records per bulk POST
    #[arg(long, global = true)]
    batch_size: Option<usize>,

    /// Datasets migrated in parallel
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Log what would happen without writing to the destination
    #[arg(long, global = true)]
    dry_run: bool,

    /// Patch resources that already exist instead of skipping them
    #[arg(long, global = true)]
    update_existing: bool,

    /// Log each outbound request and per-record decision
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe both instances and report connectivity
    Test,
    /// Migrate datasets (with their examples); no selection prints the listing
    Datasets {
        /// Source dataset IDs
        ids: Vec<String>,
        /// Migrate every dataset on the source
        #[arg(long)]
        all: bool,
        /// Also migrate experiments, runs and feedback per dataset
        #[arg(long)]
        include_experiments: bool,
    },
    /// Migrate prompt repos; no selection prints the listing
    Prompts {
        /// Prompt repo handles (owner/name)
        handles: Vec<String>,
        /// Migrate every private prompt on the source
        #[arg(long)]
        all: bool,
        /// Replay the full commit history instead of the latest manifest
        #[arg(long)]
        include_all_commits: bool,
        /// Treat every commit-push 409 as a real failure (disables the
        /// "already up to date" detection)
        #[arg(long)]
        strict_conflicts: bool,
    },
    /// Migrate annotation queues; no selection prints the listing
    Queues {
        /// Source queue IDs
        ids: Vec<String>,
        /// Migrate every queue on the source
        #[arg(long)]
        all: bool,
    },
    /// Migrate automation rules; no selection prints the listing
    Rules {
        /// Source rule IDs
        ids: Vec<String>,
        /// Migrate every rule on the source
        #[arg(long)]
        all: bool,
        /// Drop project references and scope rules by dataset only
        #[arg(long)]
        strip_projects: bool,
        /// Create destination projects missing for a rule's scope
        #[arg(long)]
        ensure_projects: bool,
        /// Write rules disabled so missing secrets do not fail validation
        #[arg(long)]
        create_disabled: bool,
        /// Project ID mapping as inline JSON or a path to a JSON file
        #[arg(long)]
        project_mapping: Option<String>,
    },
    /// Migrate dashboard charts and their sections
    Charts,
    /// Migrate everything in dependency order
    MigrateAll {
        #[arg(long)]
        skip_datasets: bool,
        #[arg(long)]
        skip_experiments: bool,
        #[arg(long)]
        skip_prompts: bool,
        #[arg(long)]
        skip_queues: bool,
        #[arg(long)]
        skip_rules: bool,
        #[arg(long)]
        skip_charts: bool,
        /// Replay full prompt commit history
        #[arg(long)]
        include_all_commits: bool,
        /// Drop project references from rules
        #[arg(long)]
        strip_projects: bool,
    },
    /// Resume a previous session's pending and failed items
    Resume {
        /// Session ID; defaults to the most recent resumable session
        session_id: Option<String>,
    },
    /// List saved migration sessions
    Sessions,
    /// Delete saved migration sessions
    Clean {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },
    /// List projects on one instance
    ListProjects {
        /// List from the source instance (default)
        #[arg(long)]
        source: bool,
        /// List from the destination instance
        #[arg(long)]
        dest: bool,
    },
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "trace_migrate=debug,info"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn build_config(cli: &Cli) -> Config {
    let mut config = Config::from_env();
    if let Some(key) = &cli.source_key {
        config.source.api_key = key.clone();
    }
    if let Some(key) = &cli.dest_key {
        config.destination.api_key = key.clone();
    }
    if let Some(url) = &cli.source_url {
        config.source.base_url = url.clone();
    }
    if let Some(url) = &cli.dest_url {
        config.destination.base_url = url.clone();
    }
    if cli.no_verify_tls {
        config.source.verify_tls = false;
        config.destination.verify_tls = false;
    }
    if let Some(batch_size) = cli.batch_size {
        config.migration.batch_size = batch_size;
    }
    if let Some(workers) = cli.workers {
        config.migration.concurrent_workers = workers;
    }
    if cli.dry_run {
        config.migration.dry_run = true;
    }
    if cli.update_existing {
        config.migration.skip_existing = false;
    }
    if cli.verbose {
        config.migration.verbose = true;
    }
    config
}

fn print_report(report: &MigrationReport) {
    println!();
    println!("{}", "Migration summary".bold());
    let mut kinds: Vec<_> = report.by_kind.iter().collect();
    kinds.sort_by_key(|(kind, _)| kind.as_str());
    for (kind, counts) in kinds {
        let failed = if counts.failed > 0 {
            counts.failed.to_string().red().to_string()
        } else {
            counts.failed.to_string()
        };
        println!(
            "  {:<12} {} created, {} updated, {} skipped, {} failed",
            kind.as_str(),
            counts.created.to_string().green(),
            counts.updated,
            counts.skipped.to_string().yellow(),
            failed
        );
    }
    if report.by_kind.is_empty() {
        println!("  nothing to do");
    }
}

fn print_listing(title: &str, records: &[Value], id_key: &str, name_key: &str) {
    println!("{} ({}):", title.bold(), records.len());
    for record in records {
        let id = record.get(id_key).and_then(Value::as_str).unwrap_or("-");
        let name = record.get(name_key).and_then(Value::as_str).unwrap_or("-");
        println!("  {:<38} {}", id.dimmed(), name);
    }
}

/// Parse `--project-mapping` from inline JSON or a file path.
fn parse_project_mapping(raw: &str) -> Result<HashMap<String, String>, MigrateError> {
    let text = if std::path::Path::new(raw).exists() {
        std::fs::read_to_string(raw)?
    } else {
        raw.to_string()
    };
    serde_json::from_str(&text).map_err(|e| {
        MigrateError::validation(format!("project mapping is not a JSON object of strings: {e}"))
    })
}

async fn run(cli: Cli) -> Result<(), MigrateError> {
    let store = SessionStore::new();

    // Session maintenance commands work without credentials.
    match &cli.command {
        Command::Sessions => {
            let sessions = store.list_sessions()?;
            if sessions.is_empty() {
                println!("no saved migration sessions");
                return Ok(());
            }
            println!("{} ({}):", "Migration sessions".bold(), sessions.len());
            for session in sessions {
                let completion = session
                    .statistics
                    .as_ref()
                    .and_then(|s| s.get("completion_percentage"))
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
                println!(
                    "  {:<24} {:>6.1}%  {} -> {}",
                    session.session_id, completion, session.source_url, session.destination_url
                );
            }
            return Ok(());
        }
        Command::Clean { yes } => {
            let sessions = store.list_sessions()?;
            if sessions.is_empty() {
                println!("no migration sessions to clean");
                return Ok(());
            }
            if !yes {
                println!(
                    "{} session(s) would be deleted; re-run with --yes to confirm",
                    sessions.len()
                );
                return Ok(());
            }
            let mut deleted = 0usize;
            for session in &sessions {
                if store.delete_session(&session.session_id)? {
                    deleted += 1;
                }
            }
            println!("deleted {deleted} session(s)");
            return Ok(());
        }
        _ => {}
    }

    let config = build_config(&cli);
    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("{} {}", "configuration error:".red(), error);
        }
        return Err(MigrateError::validation("invalid configuration"));
    }

    match cli.command {
        Command::Test => {
            let ctx = Arc::new(MigrationContext::new(config, store)?);
            let orchestrator = Orchestrator::new(ctx);
            let (source, dest) = orchestrator.test_connections().await;
            match &source {
                Ok(()) => println!("source:      {}", "ok".green()),
                Err(reason) => println!("source:      {} ({reason})", "failed".red()),
            }
            match &dest {
                Ok(()) => println!("destination: {}", "ok".green()),
                Err(reason) => println!("destination: {} ({reason})", "failed".red()),
            }
            if source.is_err() || dest.is_err() {
                return Err(MigrateError::validation("connection test failed"));
            }
            Ok(())
        }

        Command::Datasets {
            ids,
            all,
            include_experiments,
        } => {
            let ctx = Arc::new(MigrationContext::new(config, store)?);
            let orchestrator = Orchestrator::new(ctx.clone());
            let migrator = DatasetMigrator::new(ctx)?;

            let ids = if all {
                migrator
                    .list_datasets()
                    .await?
                    .iter()
                    .filter_map(|d| d.get("id").and_then(Value::as_str).map(str::to_string))
                    .collect()
            } else if ids.is_empty() {
                let datasets = migrator.list_datasets().await?;
                print_listing("Source datasets", &datasets, "id", "name");
                println!("\nselect IDs or pass --all to migrate");
                return Ok(());
            } else {
                ids
            };

            let report = orchestrator
                .migrate_datasets(ids, true, include_experiments)
                .await?;
            print_report(&report);
            Ok(())
        }

        Command::Prompts {
            handles,
            all,
            include_all_commits,
            strict_conflicts,
        } => {
            let ctx = Arc::new(MigrationContext::new(config, store)?);
            let orchestrator = Orchestrator::new(ctx.clone());
            let migrator = PromptMigrator::new(ctx);

            let prompts: Vec<Value> = if all {
                migrator.list_prompts().await?
            } else if handles.is_empty() {
                let prompts = migrator.list_prompts().await?;
                print_listing("Source prompts", &prompts, "id", "repo_handle");
                println!("\nselect handles or pass --all to migrate");
                return Ok(());
            } else {
                handles
                    .iter()
                    .map(|handle| json!({ "repo_handle": handle }))
                    .collect()
            };

            let options = PromptOptions {
                include_all_commits,
                conflict_means_synced: !strict_conflicts,
            };
            let report = orchestrator.migrate_prompts(prompts, &options).await?;
            print_report(&report);
            Ok(())
        }

        Command::Queues { ids, all } => {
            let ctx = Arc::new(MigrationContext::new(config, store)?);
            let orchestrator = Orchestrator::new(ctx.clone());
            let migrator = QueueMigrator::new(ctx);

            let ids = if all {
                migrator
                    .list_queues()
                    .await?
                    .iter()
                    .filter_map(|q| q.get("id").and_then(Value::as_str).map(str::to_string))
                    .collect()
            } else if ids.is_empty() {
                let queues = migrator.list_queues().await?;
                print_listing("Source annotation queues", &queues, "id", "name");
                println!("\nselect IDs or pass --all to migrate");
                return Ok(());
            } else {
                ids
            };

            let report = orchestrator.migrate_queues(ids).await?;
            print_report(&report);
            Ok(())
        }

        Command::Rules {
            ids,
            all,
            strip_projects,
            ensure_projects,
            create_disabled,
            project_mapping,
        } => {
            let ctx = Arc::new(MigrationContext::new(config, store)?);
            let orchestrator = Orchestrator::new(ctx.clone());

            if !all && ids.is_empty() {
                let migrator = RuleMigrator::new(ctx);
                let rules = migrator.list_rules().await?;
                print_listing("Source rules", &rules, "id", "display_name");
                println!("\nselect IDs or pass --all to migrate");
                return Ok(());
            }

            let project_overrides = match &project_mapping {
                Some(raw) => parse_project_mapping(raw)?,
                None => HashMap::new(),
            };
            let options = RuleOptions {
                strip_project_reference: strip_projects,
                ensure_project: ensure_projects,
                create_disabled,
                project_overrides,
            };
            let selection = if all { None } else { Some(ids) };
            let report = orchestrator.migrate_rules(selection, &options).await?;
            print_report(&report);
            Ok(())
        }

        Command::Charts => {
            let ctx = Arc::new(MigrationContext::new(config, store)?);
            let orchestrator = Orchestrator::new(ctx);
            let report = orchestrator.migrate_charts().await?;
            print_report(&report);
            Ok(())
        }

        Command::MigrateAll {
            skip_datasets,
            skip_experiments,
            skip_prompts,
            skip_queues,
            skip_rules,
            skip_charts,
            include_all_commits,
            strip_projects,
        } => {
            let ctx = Arc::new(MigrationContext::new(config, store)?);
            let orchestrator = Orchestrator::new(ctx.clone());
            let options = MigrateAllOptions {
                skip_datasets,
                skip_experiments,
                skip_prompts,
                skip_queues,
                skip_rules,
                skip_charts,
                prompt_options: PromptOptions {
                    include_all_commits,
                    ..PromptOptions::default()
                },
                rule_options: RuleOptions {
                    strip_project_reference: strip_projects,
                    ..RuleOptions::default()
                },
            };
            let report = orchestrator.migrate_all(&options).await?;
            print_report(&report);
            println!(
                "session {} saved; `trace-migrate resume` reprocesses failures",
                orchestrator.context().session_id().await
            );
            Ok(())
        }

        Command::Resume { session_id } => {
            let sessions = store.list_sessions()?;
            let target = match session_id {
                Some(id) => id,
                None => {
                    let Some(latest) = sessions.first() else {
                        println!("no previous migration sessions found");
                        return Ok(());
                    };
                    latest.session_id.clone()
                }
            };
            let Some(state) = store.load_session(&target)? else {
                return Err(MigrateError::validation(format!(
                    "session {target} not found"
                )));
            };
            if !state.is_resumable() {
                println!("session {target} has nothing to resume");
                return Ok(());
            }

            let ctx = Arc::new(MigrationContext::with_state(config, store, state)?);
            let orchestrator = Orchestrator::new(ctx);
            let report = orchestrator.resume().await?;
            print_report(&report);
            Ok(())
        }

        Command::ListProjects { source, dest } => {
            let ctx = Arc::new(MigrationContext::new(config, store)?);
            let (client, which) = if dest && !source {
                (&ctx.dest, "destination")
            } else {
                (&ctx.source, "source")
            };
            let projects = client.paginate("/sessions", Vec::new(), 100).collect().await?;
            print_listing(&format!("Projects on {which}"), &projects, "id", "name");
            Ok(())
        }

        // Handled before config validation.
        Command::Sessions | Command::Clean { .. } => unreachable!(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {}", "error:".red(), err);
            ExitCode::FAILURE
        }
    }
}
