//! PastLead CLI - batch ingestion and lead scoring over a local SQLite store.
//!
//! Usage: pastlead [OPTIONS] <COMMAND>

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;

use pastlead_lib::backfill::backfill_subjects;
use pastlead_lib::db::{DbContact, DbCounts, DbPipelineRun, IngestCheckpoint, LeadDb};
use pastlead_lib::error::PipelineError;
use pastlead_lib::ingest::{ingest_file, IngestReport};
use pastlead_lib::pipeline::run_pipeline;
use pastlead_lib::state::{load_config, resolve_db_path};
use pastlead_lib::types::Config;

#[derive(Parser)]
#[command(name = "pastlead")]
#[command(version, about = "Email thread reconstruction and lead scoring", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Database path (default: ~/.pastlead/pastlead.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Config file (default: ~/.pastlead/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest newline-delimited JSON message records (resumable)
    Ingest {
        file: PathBuf,
        /// Checkpoint key (default: canonical path of FILE)
        #[arg(long)]
        source_key: Option<String>,
    },
    /// Fill missing subjects from a {message_identifier, subject} NDJSON file
    BackfillSubjects { file: PathBuf },
    /// Reconstruct threads, filter, score and aggregate contacts
    Run,
    /// Ingest FILE to completion, then run the pipeline
    Full {
        file: PathBuf,
        #[arg(long)]
        source_key: Option<String>,
    },
    /// Show row counts, checkpoints and the last pipeline run
    Status {
        /// Output as JSON for scripting
        #[arg(long)]
        json: bool,
        /// How many top contacts to list
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
    /// Forget a checkpoint so the source is read from the start
    ResetCheckpoint { key: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let stop = Arc::new(AtomicBool::new(false));
    let stop_handler = stop.clone();
    ctrlc::set_handler(move || {
        if stop_handler.swap(true, Ordering::SeqCst) {
            eprintln!("\nAborting.");
            std::process::exit(130);
        }
        eprintln!("\nStopping after the current batch commit (Ctrl+C again to abort)...");
    })
    .ok();

    match run(cli, &stop) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("Error: {}\n{}", e, e.recovery_suggestion());
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli, stop: &AtomicBool) -> Result<(), PipelineError> {
    let config = load_config(cli.config.as_deref())?;
    let db_path = resolve_db_path(cli.db.as_deref(), &config)?;

    match cli.command {
        Commands::Ingest { file, source_key } => {
            let db = LeadDb::open_at(db_path)?;
            let report = ingest(&db, &config, &file, source_key.as_deref(), stop)?;
            check_skipped(&report)
        }
        Commands::BackfillSubjects { file } => {
            let db = LeadDb::open_at(db_path)?;
            let report = backfill_subjects(&db, &file, config.batch_size)?;
            println!(
                "Subjects: {} updated, {} unchanged, {} skipped",
                report.updated, report.unchanged, report.skipped
            );
            Ok(())
        }
        Commands::Run => {
            let db = LeadDb::open_at(db_path)?;
            pipeline(&db, &config, stop)
        }
        Commands::Full { file, source_key } => {
            let db = LeadDb::open_at(db_path)?;
            let report = ingest(&db, &config, &file, source_key.as_deref(), stop)?;
            if report.stopped_early {
                println!("Ingestion stopped early; pipeline not started.");
                return check_skipped(&report);
            }
            pipeline(&db, &config, stop)?;
            check_skipped(&report)
        }
        Commands::Status { json, top } => status(&db_path, json, top),
        Commands::ResetCheckpoint { key } => {
            let db = LeadDb::open_at(db_path)?;
            if db.delete_checkpoint(&key)? {
                println!("Checkpoint '{}' removed.", key);
            } else {
                println!("No checkpoint named '{}'.", key);
            }
            Ok(())
        }
    }
}

fn ingest(
    db: &LeadDb,
    config: &Config,
    file: &Path,
    source_key: Option<&str>,
    stop: &AtomicBool,
) -> Result<IngestReport, PipelineError> {
    let report = ingest_file(db, file, source_key, config.batch_size, stop)?;
    println!(
        "Ingested {}: {} new, {} already stored, {} skipped ({} lines this run, resumed after {})",
        report.source_key,
        report.inserted,
        report.duplicates,
        report.skipped,
        report.lines_processed,
        report.resumed_from
    );
    Ok(report)
}

/// Skipped records still fail the run so operators notice them.
fn check_skipped(report: &IngestReport) -> Result<(), PipelineError> {
    if report.skipped > 0 {
        return Err(PipelineError::SkippedRecords(report.skipped));
    }
    Ok(())
}

fn pipeline(db: &LeadDb, config: &Config, stop: &AtomicBool) -> Result<(), PipelineError> {
    let report = run_pipeline(db, config, stop)?;
    println!(
        "Run {}: {} threads ({} pruned edges), {} ignored, {} scored (max {:.2}), {} contacts ranked",
        report.run_id,
        report.threading.components,
        report.threading.edges_pruned,
        report.filters.threads_ignored,
        report.scoring.threads_scored,
        report.scoring.max_score,
        report.aggregation.contacts_scored
    );
    if report.stopped_early {
        println!("Stopped early; re-run `pastlead run` to finish.");
    }
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusOutput {
    database: String,
    counts: DbCounts,
    checkpoints: Vec<IngestCheckpoint>,
    last_run: Option<DbPipelineRun>,
    top_contacts: Vec<DbContact>,
}

fn status(db_path: &Path, json: bool, top: usize) -> Result<(), PipelineError> {
    if !db_path.exists() {
        return Err(PipelineError::Config(format!(
            "No database at {}. Run `pastlead ingest` first.",
            db_path.display()
        )));
    }
    let db = LeadDb::open_readonly_at(db_path)?;
    let output = StatusOutput {
        database: db_path.display().to_string(),
        counts: db.counts()?,
        checkpoints: db.list_checkpoints()?,
        last_run: db.get_last_pipeline_run()?,
        top_contacts: db.get_top_contacts(top)?,
    };

    if json {
        let text = serde_json::to_string_pretty(&output)
            .map_err(|e| PipelineError::Config(format!("Failed to render status: {}", e)))?;
        println!("{}", text);
        return Ok(());
    }

    let c = &output.counts;
    println!("Database: {}", output.database);
    println!(
        "Contacts: {}  Messages: {}  Threads: {} ({} active, {} ignored)  Ignore list: {}",
        c.contacts, c.messages, c.threads, c.active_threads, c.ignored_threads, c.ignore_list_entries
    );
    for cp in &output.checkpoints {
        println!(
            "Checkpoint {}: {} lines, {} skipped, last {}",
            cp.source_key,
            cp.processed_count,
            cp.skipped_count,
            cp.last_message_identifier.as_deref().unwrap_or("-")
        );
    }
    match &output.last_run {
        Some(run) => println!(
            "Last run #{}: {} (started {}, finished {})",
            run.id,
            run.status,
            run.started_at,
            run.finished_at.as_deref().unwrap_or("-")
        ),
        None => println!("No pipeline runs yet."),
    }
    for contact in &output.top_contacts {
        println!(
            "  {:>8.2}  {}  {}",
            contact.closeness_score,
            contact.email,
            contact.last_contacted_at.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
