//! Full recompute: reconstruct -> filter -> score -> aggregate.
//!
//! Stages run strictly in order over committed data only. Each run is
//! recorded in `pipeline_runs`. Only one run may touch a database at a time;
//! that lock is the caller's responsibility.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde::Serialize;

use crate::closeness::{aggregate_contacts, AggregationReport};
use crate::db::{to_db_timestamp, LeadDb};
use crate::error::PipelineError;
use crate::filters::{run_filters, Blacklist, FilterChain, FilterContext, FilterReport};
use crate::scoring::{run_scoring, ScoringEngine, ScoringReport};
use crate::threading::{reconstruct_threads, ThreadingReport};
use crate::types::Config;

/// Report from one pipeline run.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    pub run_id: i64,
    pub threading: ThreadingReport,
    pub filters: FilterReport,
    pub scoring: ScoringReport,
    pub aggregation: AggregationReport,
    /// Set when the stop flag ended the run between stages.
    pub stopped_early: bool,
    pub started_at: String,
    pub finished_at: String,
}

pub fn run_pipeline(
    db: &LeadDb,
    config: &Config,
    stop: &AtomicBool,
) -> Result<PipelineReport, PipelineError> {
    // Everything that can fail on configuration is built before the run is recorded.
    let blacklist = Blacklist::new(&config.blacklist_patterns, &db.get_ignore_list()?)?;
    let filter_ctx = FilterContext {
        min_messages: config.min_messages,
        volume_ceiling: config.volume_ceiling,
        blacklist: blacklist.clone(),
    };
    let chain = FilterChain::standard();
    let engine = ScoringEngine::new(config.scoring.clone(), config.spam_keywords.as_deref());

    let run_id = db.start_pipeline_run()?;
    let mut report = PipelineReport {
        run_id,
        started_at: to_db_timestamp(&Utc::now()),
        ..Default::default()
    };
    log::info!("Pipeline run {} started", run_id);

    let result = run_stages(db, config, stop, &chain, &filter_ctx, &blacklist, &engine, &mut report);
    report.finished_at = to_db_timestamp(&Utc::now());

    match result {
        Ok(()) => {
            let succeeded = !report.stopped_early;
            let report_json = match serde_json::to_string(&report) {
                Ok(json) => Some(json),
                Err(e) => {
                    log::warn!("Failed to serialize pipeline report: {}", e);
                    None
                }
            };
            db.finish_pipeline_run(run_id, succeeded, report_json.as_deref())?;
            log::info!(
                "Pipeline run {} {}",
                run_id,
                if succeeded { "succeeded" } else { "stopped early" }
            );
            Ok(report)
        }
        Err(e) => {
            let error_json = serde_json::json!({ "error": e.to_string() }).to_string();
            if let Err(record_err) = db.finish_pipeline_run(run_id, false, Some(&error_json)) {
                log::warn!("Failed to record failed run {}: {}", run_id, record_err);
            }
            log::warn!("Pipeline run {} failed: {}", run_id, e);
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_stages(
    db: &LeadDb,
    config: &Config,
    stop: &AtomicBool,
    chain: &FilterChain,
    filter_ctx: &FilterContext,
    blacklist: &Blacklist,
    engine: &ScoringEngine,
    report: &mut PipelineReport,
) -> Result<(), PipelineError> {
    let stopped = |report: &mut PipelineReport, next: &str| {
        let stop_now = stop.load(Ordering::SeqCst);
        if stop_now {
            log::warn!("Stop requested; not starting {}", next);
            report.stopped_early = true;
        }
        stop_now
    };

    report.threading = reconstruct_threads(db)?;
    if stopped(report, "filters") {
        return Ok(());
    }
    report.filters = run_filters(db, chain, filter_ctx, config.page_size)?;
    if stopped(report, "scoring") {
        return Ok(());
    }
    report.scoring = run_scoring(db, engine, blacklist, config.page_size)?;
    if stopped(report, "aggregation") {
        return Ok(());
    }
    report.aggregation = aggregate_contacts(db)?;
    Ok(())
}
