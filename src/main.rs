//! # ARIEL CLI (`ariel`)
//!
//! ## Usage
//!
//! ```bash
//! ariel --config ./config/ariel.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ariel migrate run` | Apply pending migrations for enabled modules |
//! | `ariel migrate status` | Show applied state per migration |
//! | `ariel migrate rollback <name>` | Roll back one migration |
//! | `ariel ingest` | Fetch entries through the configured adapter |
//! | `ariel enhance` | Backfill pending enhancement modules |
//! | `ariel search "<query>"` | Search in any enabled mode |
//! | `ariel get <id>` | Print one entry |
//! | `ariel status` | Connection, entry count, enabled modules |
//! | `ariel runs` | Recent ingestion runs |
//! | `ariel tables` | Embedding tables |
//! | `ariel serve` | Start the HTTP API |
//!
//! Logs go to stderr (`RUST_LOG`, or `--verbose` for debug); results go to
//! stdout, as JSON with `--json`.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ariel::cancel::CancelToken;
use ariel::config::{load_config, Config};
use ariel::db;
use ariel::enhancement::{build_enhancers, enhance_pending};
use ariel::ingest::{run_ingestion, IngestOptions};
use ariel::migrate::{MigrationRunner, RollbackOutcome};
use ariel::models::{SearchMode, SearchParams, SearchResponse};
use ariel::query::parse_datetime_arg;
use ariel::repository::EntryRepository;
use ariel::server::run_server;
use ariel::service::SearchService;
use ariel::traits::AdapterRegistry;

/// ARIEL: hybrid retrieval over facility logbooks.
#[derive(Parser)]
#[command(
    name = "ariel",
    about = "ARIEL: hybrid logbook retrieval engine",
    version,
    long_about = "ARIEL ingests accelerator facility logbook entries, enriches them with \
    embeddings, and answers queries with keyword, fuzzy, semantic, RAG, and agent search."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ariel.toml")]
    config: PathBuf,

    /// Debug logging (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage schema migrations.
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },

    /// Ingest entries through an adapter.
    ///
    /// Without `--since`, resumes from the start of the last successful run
    /// for the same source system (or fetches everything on first run).
    Ingest {
        /// Adapter name (defaults to `ingestion.adapter`).
        #[arg(long)]
        adapter: Option<String>,

        /// Inclusive lower bound (YYYY-MM-DD or RFC 3339).
        #[arg(long)]
        since: Option<String>,

        /// Exclusive upper bound (YYYY-MM-DD or RFC 3339). Defaults to now.
        #[arg(long)]
        until: Option<String>,

        /// Maximum number of entries to write.
        #[arg(long)]
        limit: Option<usize>,

        /// Fetch and count without writing or recording a run.
        #[arg(long)]
        dry_run: bool,
    },

    /// Run enabled enhancement modules over pending or failed entries.
    Enhance {
        /// Maximum entries per module.
        #[arg(long, default_value_t = 1000)]
        limit: usize,
    },

    /// Search logbook entries.
    Search {
        /// Query text. Supports "phrases", author:name, date:YYYY[-MM[-DD]].
        query: String,

        /// keyword, fuzzy, semantic, rag, or agent.
        #[arg(long, default_value = "keyword")]
        mode: SearchMode,

        /// Maximum number of results.
        #[arg(long, default_value_t = 10)]
        limit: usize,

        /// Similarity threshold for semantic or fuzzy search (0.0 to 1.0).
        #[arg(long)]
        threshold: Option<f64>,

        /// Retry keyword searches with no results as fuzzy searches.
        #[arg(long)]
        fuzzy_fallback: bool,

        /// Inclusive lower bound on entry time.
        #[arg(long)]
        start: Option<String>,

        /// Exclusive upper bound on entry time.
        #[arg(long)]
        end: Option<String>,
    },

    /// Print one entry by id.
    Get { id: String },

    /// Show service status.
    Status,

    /// List recent ingestion runs.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// List embedding tables.
    Tables,

    /// Start the HTTP API on `server.bind`.
    Serve,
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Apply pending migrations in dependency order.
    Run {
        /// List what would be applied without applying it.
        #[arg(long)]
        dry_run: bool,
    },
    /// Show applied state per migration.
    Status,
    /// Roll back one migration.
    Rollback { name: String },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn parse_date_flag(flag: &str, value: Option<&str>) -> anyhow::Result<Option<chrono::DateTime<chrono::Utc>>> {
    value
        .map(|v| {
            parse_datetime_arg(v)
                .with_context(|| format!("--{} must be YYYY-MM-DD or RFC 3339, got '{}'", flag, v))
        })
        .transpose()
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancelToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current step");
            token.cancel();
        }
    });
}

async fn open_repo(cfg: Config) -> anyhow::Result<EntryRepository> {
    let pool = db::connect(&cfg).await?;
    Ok(EntryRepository::new(pool, Arc::new(cfg)))
}

fn print_search(response: &SearchResponse) {
    let modes: Vec<&str> = response.modes_used.iter().map(|m| m.as_str()).collect();
    println!("modes: {}", modes.join(", "));
    if let Some(answer) = &response.answer {
        println!("\n{}\n", answer);
        if !response.sources.is_empty() {
            println!("sources: {}", response.sources.join(", "));
        }
    }
    for (i, hit) in response.entries.iter().enumerate() {
        let e = &hit.entry;
        println!(
            "{:>2}. [{}] {}  {}  score={:.3}",
            i + 1,
            e.entry_id,
            e.timestamp.format("%Y-%m-%d %H:%M"),
            e.author,
            hit.score
        );
        let preview = hit
            .highlight
            .clone()
            .unwrap_or_else(|| e.raw_text.chars().take(160).collect());
        println!("    {}", preview.replace('\n', " "));
    }
    println!("{}", response.reasoning);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cfg = load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Migrate { action } => {
            let pool = db::connect(&cfg).await?;
            let runner = MigrationRunner::from_config(pool, &cfg)?;
            match action {
                MigrateAction::Run { dry_run } => {
                    let report = runner.run(dry_run).await?;
                    if dry_run {
                        println!("would apply: {}", list_or_none(&report.would_apply));
                    } else {
                        println!("applied: {}", list_or_none(&report.applied));
                    }
                    println!("already applied: {}", list_or_none(&report.skipped));
                }
                MigrateAction::Status => {
                    for s in runner.status().await? {
                        let state = match s.applied_at {
                            Some(at) => format!("applied {}", at.to_rfc3339()),
                            None if s.applied => "applied".to_string(),
                            None => "pending".to_string(),
                        };
                        println!("{:<20} {:<32} depends on: {}", s.name, state, list_or_none(&s.depends_on));
                    }
                }
                MigrateAction::Rollback { name } => match runner.rollback(&name).await? {
                    RollbackOutcome::RolledBack => println!("rolled back {}", name),
                    RollbackOutcome::NotApplied => println!("{} is not applied", name),
                    RollbackOutcome::NotImplemented => {
                        anyhow::bail!("migration '{}' does not support rollback", name)
                    }
                },
            }
        }
        Commands::Ingest {
            adapter,
            since,
            until,
            limit,
            dry_run,
        } => {
            let options = IngestOptions {
                since: parse_date_flag("since", since.as_deref())?,
                until: parse_date_flag("until", until.as_deref())?,
                limit,
                dry_run,
            };
            let adapter_name = adapter.unwrap_or_else(|| cfg.ingestion.adapter.clone());
            let adapter = AdapterRegistry::with_builtins().create(&adapter_name, &cfg)?;
            let enhancers = build_enhancers(&cfg)?;
            let repo = open_repo(cfg).await?;

            let cancel = CancelToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let report = run_ingestion(&repo, adapter.as_ref(), &enhancers, &options, &cancel).await?;

            if cli.json {
                print_json(&report)?;
            } else {
                println!("ingest {}{}", adapter_name, if dry_run { " (dry-run)" } else { "" });
                println!("  source system: {}", report.source_system);
                println!("  windows: {}", report.windows);
                println!("  fetched: {}", report.fetched);
                if !dry_run {
                    println!("  added: {}", report.counts.added);
                    println!("  updated: {}", report.counts.updated);
                    println!("  failed: {}", report.counts.failed);
                    if !enhancers.is_empty() {
                        println!("  enhanced: {} ({} failed)", report.enhanced, report.enhancement_failed);
                    }
                }
                println!("ok");
            }
        }
        Commands::Enhance { limit } => {
            let enhancers = build_enhancers(&cfg)?;
            if enhancers.is_empty() {
                anyhow::bail!("no enhancement modules are enabled");
            }
            let repo = open_repo(cfg).await?;
            let stats = enhance_pending(&repo, &enhancers, limit).await?;
            println!("enhanced: {}", stats.processed);
            println!("failed: {}", stats.failed);
        }
        Commands::Search {
            query,
            mode,
            limit,
            threshold,
            fuzzy_fallback,
            start,
            end,
        } => {
            let params = SearchParams {
                max_results: limit.max(1),
                similarity_threshold: threshold,
                start_date: parse_date_flag("start", start.as_deref())?,
                end_date: parse_date_flag("end", end.as_deref())?,
                fuzzy_fallback,
                include_highlights: true,
            };
            let service = SearchService::from_config(cfg).await?;
            let cancel = CancelToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let response = service.search_with_cancel(&query, mode, &params, &cancel).await?;
            if cli.json {
                print_json(&response)?;
            } else {
                print_search(&response);
            }
        }
        Commands::Get { id } => {
            let repo = open_repo(cfg).await?;
            let entry = repo
                .get_entry(&id)
                .await?
                .with_context(|| format!("entry not found: {}", id))?;
            if cli.json {
                print_json(&entry)?;
            } else {
                println!("id: {}", entry.entry_id);
                println!("source: {}", entry.source_system);
                println!("time: {}", entry.timestamp.to_rfc3339());
                println!("author: {}", entry.author);
                for a in &entry.attachments {
                    println!("attachment: {}", a.url);
                }
                println!("---");
                println!("{}", entry.raw_text);
            }
        }
        Commands::Status => {
            let service = SearchService::from_config(cfg).await?;
            let status = service.get_status().await;
            if cli.json {
                print_json(&status)?;
            } else {
                println!("database: {} ({})", status.database_uri, if status.database_connected { "connected" } else { "unavailable" });
                if let Some(n) = status.entry_count {
                    println!("entries: {}", n);
                }
                println!("search modules: {}", list_or_none(&status.enabled_search_modules));
                println!("enhancement modules: {}", list_or_none(&status.enabled_enhancement_modules));
                for e in &status.errors {
                    println!("error: {}", e);
                }
            }
        }
        Commands::Runs { limit } => {
            let repo = open_repo(cfg).await?;
            let runs = repo.recent_ingestion_runs(limit).await?;
            if cli.json {
                print_json(&runs)?;
            } else {
                for r in runs {
                    println!(
                        "{}  {}  {:<8} +{} ~{} !{}  {}",
                        r.started_at.format("%Y-%m-%d %H:%M:%S"),
                        r.source_system,
                        r.status.to_string(),
                        r.entries_added,
                        r.entries_updated,
                        r.entries_failed,
                        r.error_message.unwrap_or_default()
                    );
                }
            }
        }
        Commands::Tables => {
            let repo = open_repo(cfg).await?;
            let tables = repo.get_embedding_tables().await?;
            if cli.json {
                print_json(&tables)?;
            } else {
                for t in tables {
                    println!(
                        "{:<40} entries={:<8} dim={:<6} {}",
                        t.table_name,
                        t.entry_count,
                        t.dimension.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string()),
                        if t.is_active { "active" } else { "" }
                    );
                }
            }
        }
        Commands::Serve => {
            let service = SearchService::from_config(cfg).await?;
            run_server(service).await?;
        }
    }
    Ok(())
}

fn list_or_none<S: AsRef<str>>(items: &[S]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(", ")
    }
}
