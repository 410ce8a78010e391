use anyhow::{Context, Result, bail};
use chunkloom::config::Config;
use chunkloom::db::Db;
use chunkloom::parser::health::HealthStatus;
use chunkloom::parser::manifest::ManifestStore;
use chunkloom::parser::service::{ParseProgress, ParserPlanEntry, ParserService};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Incremental source-tree parser.
#[derive(Parser)]
#[command(name = "chunkloom", version, about)]
struct Cli {
    /// Path to the configuration file (JSON, or TOML by extension).
    #[arg(long, global = true, default_value = "chunkloom.json")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a configured source and stage a new batch.
    Parse {
        /// Source name from the configuration.
        source: String,
        /// Batch id to write; a time-ordered id is generated when omitted.
        #[arg(long)]
        batch: Option<String>,
        /// Limit the run to these files or directories.
        paths: Vec<PathBuf>,
    },
    /// Print health reports for every configured source as JSON.
    Health,
    /// Delete the chunk slices written by one batch.
    DeleteBatch { source: String, batch: String },
    /// List registered handlers and their availability.
    Handlers,
}

/// Progress bar fed by the parser service.
struct BarProgress(ProgressBar);

impl ParseProgress for BarProgress {
    fn planned(&self, files: usize) {
        self.0.set_length(files as u64);
    }

    fn parsed(&self, entry: &ParserPlanEntry) {
        self.0.set_message(entry.relative_path.display().to_string());
        self.0.inc(1);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // 1. Load config
    let config = Config::load(&cli.config)?;
    config.validate()?;

    // 2. Init DB and manifest
    let db = Db::open(&config.db_path).context("Failed to open database")?;
    let db = Arc::new(TokioMutex::new(db));
    let manifest = ManifestStore::new(&config.manifest_path);

    // 3. Init service
    let service = ParserService::new(config, db, manifest).context("Failed to build parser service")?;

    match cli.command {
        Commands::Parse { source, batch, paths } => {
            let bar = ProgressBar::new(0);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("  {bar:40.cyan/blue} {pos}/{len} {msg}")
                    .context("invalid progress template")?
                    .progress_chars("█▓░"),
            );
            let progress = BarProgress(bar);
            let outcome = service.run_source(&source, &paths, batch, &progress).await;
            progress.0.finish_and_clear();
            let outcome = outcome.with_context(|| format!("parse of {source} failed"))?;

            info!(
                "{source}: {} (batch {})",
                outcome.record.summary.as_deref().unwrap_or_default(),
                outcome.batch_id.as_deref().unwrap_or("none")
            );
            for warning in &outcome.record.warnings {
                eprintln!("warning: {warning}");
            }
            for error in &outcome.record.errors {
                eprintln!("error: {error}");
            }
            if outcome.record.status == HealthStatus::Error {
                bail!("parser run for {source} finished with errors");
            }
        }
        Commands::Health => {
            let reports = service.check_health().await;
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        Commands::DeleteBatch { source, batch } => {
            let removed = service.delete_batch(&source, &batch).await?;
            println!("removed {removed} chunk slices from batch {batch}");
        }
        Commands::Handlers => {
            for availability in service.registry().availability() {
                println!(
                    "{:<12} {:<8} {:<9} {}{}",
                    availability.name,
                    availability.version,
                    availability.status,
                    availability.summary,
                    if availability.enabled { "" } else { " (disabled)" }
                );
            }
        }
    }

    Ok(())
}
