use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::commands::enrich::{StoreIndex, read_checkpoint};
use crate::model::EnrichRunManifest;

pub fn run(args: StatusArgs) -> Result<()> {
    let vectors_path = args.stores.vectors_path();
    let failures_path = args.stores.failures_path();
    let checkpoint_path = args.stores.checkpoint_path();
    let manifest_dir = args.stores.manifest_dir();

    info!(cache_root = %args.stores.cache_root.display(), "status requested");

    let successes = report_store("success", &vectors_path)?;
    let failures = report_store("failure", &failures_path)?;

    let overlap = successes.ids.intersection(&failures.ids).count();
    if overlap > 0 {
        warn!(
            overlap,
            "ids present in both success and failure stores; rerun enrich to prune recovered failures"
        );
    }

    match read_checkpoint(&checkpoint_path)? {
        Some(last_id) => info!(path = %checkpoint_path.display(), last_id = %last_id, "checkpoint"),
        None => warn!(path = %checkpoint_path.display(), "checkpoint missing"),
    }

    match latest_manifest_path(&manifest_dir)? {
        Some(path) => {
            let raw =
                fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
            let manifest: EnrichRunManifest = serde_json::from_slice(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            info!(
                path = %path.display(),
                run_id = %manifest.run_id,
                status = %manifest.status,
                updated_at = %manifest.updated_at,
                attempted = manifest.counts.attempted,
                succeeded = manifest.counts.succeeded,
                failed = manifest.counts.failed,
                errored = manifest.counts.errored,
                model_id = %manifest.model.model_id,
                embedding_dim = ?manifest.model.embedding_dim,
                "latest run manifest"
            );
        }
        None => warn!(path = %manifest_dir.display(), "no run manifests found"),
    }

    Ok(())
}

fn report_store(label: &str, path: &Path) -> Result<StoreIndex> {
    if !path.exists() {
        warn!(store = label, path = %path.display(), "store file missing");
        return Ok(StoreIndex::default());
    }

    let index = StoreIndex::load(path)?;
    info!(
        store = label,
        path = %path.display(),
        lines = index.lines,
        distinct_ids = index.ids.len(),
        malformed_lines = index.malformed_lines,
        "store status"
    );
    Ok(index)
}

/// Manifest names embed a sortable UTC stamp, so the lexically last one is the newest.
fn latest_manifest_path(manifest_dir: &Path) -> Result<Option<PathBuf>> {
    if !manifest_dir.exists() {
        return Ok(None);
    }

    let mut latest: Option<PathBuf> = None;
    let entries = fs::read_dir(manifest_dir)
        .with_context(|| format!("failed to read {}", manifest_dir.display()))?;
    for entry in entries {
        let path = entry
            .with_context(|| format!("failed to read entry in {}", manifest_dir.display()))?
            .path();
        let is_run_manifest = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with("enrich_run_") && name.ends_with(".json"))
            .unwrap_or(false);
        if is_run_manifest && latest.as_ref().is_none_or(|current| path > *current) {
            latest = Some(path);
        }
    }

    Ok(latest)
}
