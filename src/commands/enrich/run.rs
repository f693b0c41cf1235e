use std::fs::File;
use std::io::BufReader;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use super::driver::{DriverSettings, drive_batch, failures_to_prune};
use super::fetch::{FetchPolicy, HttpMetadataFetcher};
use super::pipeline::{EnrichContext, Pipeline};
use super::selector::{DisabledFieldSelector, FieldSelector, OllamaFieldSelector};
use super::store::{JsonlStores, StoreIndex, prune_failure_store};
use super::uri::UriNormalizer;
use crate::cli::{EmbedBackend, EnrichArgs, SelectorMode};
use crate::model::{EnrichModelInfo, EnrichPaths, EnrichRunManifest};
use crate::semantic::{Embedder, LocalHashEmbedder, OpenAiEmbedder, resolve_local_model_config};
use crate::util::{now_utc_string, sha256_file, utc_compact_string, write_json_pretty};

pub fn run(args: EnrichArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let started = Instant::now();
    let run_id = format!("enrich-{}", utc_compact_string(started_ts));

    let vectors_path = args.stores.vectors_path();
    let failures_path = args.stores.failures_path();
    let checkpoint_path = args.stores.checkpoint_path();
    let manifest_path = args.manifest_path.clone().unwrap_or_else(|| {
        args.stores
            .manifest_dir()
            .join(format!("enrich_run_{}.json", utc_compact_string(started_ts)))
    });

    info!(input = %args.input.display(), run_id = %run_id, "starting enrichment");

    let input_sha256 = sha256_file(&args.input)?;
    let input = File::open(&args.input)
        .with_context(|| format!("failed to open input batch: {}", args.input.display()))?;

    let processed = StoreIndex::load(&vectors_path)?;
    let previously_failed = StoreIndex::load(&failures_path)?;
    info!(
        path = %vectors_path.display(),
        processed_ids = processed.ids.len(),
        previously_failed_ids = previously_failed.ids.len(),
        "loaded resume index"
    );

    let mut pipeline = Pipeline::new(build_context(&args)?);
    let model = describe_model(&pipeline, args.embed_backend);

    let mut stores = JsonlStores::open(&vectors_path, &failures_path)?;
    let settings = DriverSettings {
        checkpoint_path: checkpoint_path.clone(),
        checkpoint_every: args.checkpoint_every,
        limit: args.limit,
    };
    let mut report = drive_batch(
        BufReader::new(input),
        &processed,
        &previously_failed,
        &mut pipeline,
        &mut stores,
        &settings,
    )?;
    let embedding_dim = pipeline.embedding_dim();
    drop(stores);
    drop(pipeline);

    let mut warnings = Vec::<String>::new();
    let to_prune = failures_to_prune(&processed, &previously_failed, &report);
    match prune_failure_store(&failures_path, &to_prune) {
        Ok(dropped) => {
            report.counts.recovered_failures = to_prune.len();
            if dropped > 0 {
                info!(
                    path = %failures_path.display(),
                    recovered_this_run = report.recovered_ids.len(),
                    recovered_total = to_prune.len(),
                    dropped_lines = dropped,
                    "removed recovered ids from failure store"
                );
            }
        }
        Err(err) => {
            warn!(error = %err, "failed to prune recovered ids from failure store");
            warnings.push(format!("failure store not pruned: {err}"));
        }
    }

    if processed.malformed_lines > 0 {
        warnings.push(format!(
            "{} malformed lines in success store were ignored",
            processed.malformed_lines
        ));
    }
    if report.counts.invalid_lines > 0 {
        warnings.push(format!(
            "{} invalid input lines were skipped",
            report.counts.invalid_lines
        ));
    }
    if report.counts.errored > 0 {
        warnings.push(format!(
            "{} records errored and reached neither store",
            report.counts.errored
        ));
    }

    let manifest = EnrichRunManifest {
        manifest_version: 1,
        run_id,
        status: "completed".to_string(),
        started_at,
        updated_at: now_utc_string(),
        input_sha256,
        last_processed_id: report.last_processed_id.clone(),
        paths: EnrichPaths {
            input_path: args.input.display().to_string(),
            vectors_path: vectors_path.display().to_string(),
            failures_path: failures_path.display().to_string(),
            checkpoint_path: checkpoint_path.display().to_string(),
            manifest_path: manifest_path.display().to_string(),
        },
        model: EnrichModelInfo {
            embedding_dim,
            ..model
        },
        counts: report.counts,
        duration_ms: started.elapsed().as_millis(),
        warnings,
    };
    write_json_pretty(&manifest_path, &manifest)?;

    info!(path = %manifest_path.display(), "wrote enrichment run manifest");
    info!(
        attempted = manifest.counts.attempted,
        succeeded = manifest.counts.succeeded,
        failed = manifest.counts.failed,
        errored = manifest.counts.errored,
        skipped_processed = manifest.counts.skipped_processed,
        "enrichment completed"
    );

    Ok(())
}

fn build_context(args: &EnrichArgs) -> Result<EnrichContext> {
    let normalizer = UriNormalizer::new(&args.gateway_base)?;
    let fetcher = HttpMetadataFetcher::new(FetchPolicy {
        retries: args.fetch_retries,
        timeout: Duration::from_secs(args.fetch_timeout_secs.max(1)),
        retry_delay: Duration::from_millis(args.fetch_retry_delay_ms),
    })?;

    let selector: Box<dyn FieldSelector> = match args.selector {
        SelectorMode::Ollama => Box::new(OllamaFieldSelector::new(
            &args.selector_endpoint,
            &args.selector_model,
            Duration::from_secs(args.selector_timeout_secs.max(1)),
        )?),
        SelectorMode::Off => Box::new(DisabledFieldSelector),
    };

    let embedder: Box<dyn Embedder> = match args.embed_backend {
        EmbedBackend::LocalHash => Box::new(LocalHashEmbedder::new(resolve_local_model_config(
            &args.model_id,
            args.embedding_dim,
        ))),
        EmbedBackend::Openai => {
            let api_key = args
                .openai_api_key
                .as_deref()
                .context("--openai-api-key or OPENAI_API_KEY is required for the openai backend")?;
            Box::new(OpenAiEmbedder::new(
                api_key,
                &args.openai_base_url,
                &args.model_id,
                args.embedding_dim,
                Duration::from_secs(args.embed_timeout_secs.max(1)),
                args.embed_max_retries,
            )?)
        }
    };

    info!(
        gateway = normalizer.gateway_base(),
        selector = %selector.label(),
        model_id = %embedder.config().model_id,
        backend = %embedder.config().backend,
        "enrichment context ready"
    );

    Ok(EnrichContext {
        normalizer,
        fetcher: Box::new(fetcher),
        selector,
        embedder,
        max_description_chars: args.max_description_chars,
    })
}

fn describe_model(pipeline: &Pipeline, backend: EmbedBackend) -> EnrichModelInfo {
    let context = pipeline.context();
    let config = context.embedder.config();
    EnrichModelInfo {
        model_id: config.model_id.clone(),
        model_name: config.model_name.clone(),
        embedding_dim: config.dimensions,
        backend: format!("{} ({})", backend.as_str(), config.backend),
        selector: context.selector.label(),
    }
}
