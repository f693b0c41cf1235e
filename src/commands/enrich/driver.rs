use std::collections::HashSet;
use std::io::BufRead;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use super::pipeline::{AssetState, Outcome, Pipeline, Stage};
use super::store::{RecordSink, StoreIndex, write_checkpoint};
use crate::model::{AssetRecord, EnrichCounts};

pub const DEFAULT_CHECKPOINT_EVERY: usize = 100;

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub checkpoint_path: PathBuf,
    pub checkpoint_every: usize,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub counts: EnrichCounts,
    pub last_processed_id: Option<String>,
    /// Ids that had a failure-store entry before this run and succeeded during it.
    pub recovered_ids: HashSet<String>,
}

/// Processes the input batch record by record.
///
/// `processed` must be the index of the success store the `sink` appends to; ids in it are
/// skipped without touching the pipeline. `previously_failed` is the failure-store index and is
/// only used to report recoveries.
pub fn drive_batch<R: BufRead>(
    mut reader: R,
    processed: &StoreIndex,
    previously_failed: &StoreIndex,
    pipeline: &mut Pipeline,
    sink: &mut dyn RecordSink,
    settings: &DriverSettings,
) -> Result<BatchReport> {
    let checkpoint_every = settings.checkpoint_every.max(1);
    let mut report = BatchReport::default();
    let mut seen_this_run = HashSet::<String>::new();

    let mut raw = Vec::<u8>::new();
    let mut line_no = 0usize;
    loop {
        raw.clear();
        let read = reader
            .read_until(b'\n', &mut raw)
            .with_context(|| format!("failed to read input line {}", line_no + 1))?;
        if read == 0 {
            break;
        }
        line_no += 1;

        let line = match std::str::from_utf8(&raw) {
            Ok(line) => line.trim_end_matches(['\n', '\r']),
            Err(err) => {
                report.counts.input_lines += 1;
                report.counts.invalid_lines += 1;
                warn!(line = line_no, error = %err, "skipping input line that is not UTF-8");
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        report.counts.input_lines += 1;

        let record: AssetRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(err) => {
                report.counts.invalid_lines += 1;
                warn!(line = line_no, error = %err, "skipping invalid input record");
                continue;
            }
        };

        if processed.contains(&record.id) {
            report.counts.skipped_processed += 1;
            debug!(id = %record.id, "already embedded; skipping");
            continue;
        }
        if !seen_this_run.insert(record.id.clone()) {
            report.counts.skipped_duplicate += 1;
            warn!(id = %record.id, line = line_no, "duplicate id in input; skipping");
            continue;
        }
        if settings
            .limit
            .is_some_and(|limit| report.counts.attempted >= limit)
        {
            info!(limit = ?settings.limit, "record limit reached");
            break;
        }

        let state = AssetState::from_record(&record);
        match pipeline.run(state, sink) {
            Ok(finished) => record_outcome(&mut report, &finished, previously_failed),
            Err(err) => {
                report.counts.errored += 1;
                error!(id = %record.id, error = %err, "record processing failed; skipping");
                for cause in err.chain().skip(1) {
                    error!(cause = %cause, "caused by");
                }
            }
        }

        report.counts.attempted += 1;
        report.last_processed_id = Some(record.id);

        if report.counts.attempted % checkpoint_every == 0 {
            save_checkpoint(settings, report.last_processed_id.as_deref());
            info!(
                attempted = report.counts.attempted,
                succeeded = report.counts.succeeded,
                failed = report.counts.failed,
                errored = report.counts.errored,
                "enrichment progress"
            );
        }
    }

    if report.counts.attempted % checkpoint_every != 0 {
        save_checkpoint(settings, report.last_processed_id.as_deref());
    }

    Ok(report)
}

/// Failure-store ids that also have a success line: recoveries from this run plus overlaps left
/// by an earlier run that stopped before compacting.
pub fn failures_to_prune(
    processed: &StoreIndex,
    previously_failed: &StoreIndex,
    report: &BatchReport,
) -> HashSet<String> {
    previously_failed
        .ids
        .iter()
        .filter(|id| processed.contains(id) || report.recovered_ids.contains(*id))
        .cloned()
        .collect()
}

fn record_outcome(report: &mut BatchReport, finished: &AssetState, previously_failed: &StoreIndex) {
    match &finished.outcome {
        Some(Outcome::Description(_)) => {
            report.counts.succeeded += 1;
            if previously_failed.contains(&finished.id) {
                report.recovered_ids.insert(finished.id.clone());
            }
        }
        Some(Outcome::FailureReason(_)) => {
            report.counts.failed += 1;
            let stage = finished.failed_at.unwrap_or(Stage::FailureLogger);
            *report
                .counts
                .failed_by_stage
                .entry(stage.as_str().to_string())
                .or_default() += 1;
        }
        None => {
            report.counts.errored += 1;
            error!(id = %finished.id, "pipeline finished without an outcome");
        }
    }
}

// Telemetry only; a failed write never stops the batch.
fn save_checkpoint(settings: &DriverSettings, last_id: Option<&str>) {
    let Some(last_id) = last_id else {
        return;
    };
    if let Err(err) = write_checkpoint(&settings.checkpoint_path, last_id) {
        warn!(error = %err, "failed to write checkpoint");
    }
}
