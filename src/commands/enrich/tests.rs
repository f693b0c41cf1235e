use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Cursor;
use std::rc::Rc;

use anyhow::{Result, bail};
use serde_json::{Map, Value};

use super::driver::{DriverSettings, drive_batch, failures_to_prune};
use super::fetch::MetadataFetcher;
use super::pipeline::{
    AssetState, EnrichContext, NO_METADATA_AVAILABLE, Outcome, Pipeline, Stage,
    UNFETCHABLE_METADATA,
};
use super::selector::FieldSelector;
use super::store::{JsonlStores, RecordSink, StoreIndex, prune_failure_store};
use super::uri::{DEFAULT_GATEWAY_BASE, UriNormalizer};
use crate::model::{EnrichedVectorRecord, FailureRecord};
use crate::semantic::{Embedder, SemanticModelConfig};

#[derive(Default)]
struct StubFetcher {
    documents: HashMap<String, Value>,
    calls: Rc<RefCell<Vec<String>>>,
}

impl StubFetcher {
    fn with(mut self, address: &str, document: Value) -> Self {
        self.documents.insert(address.to_string(), document);
        self
    }
}

impl MetadataFetcher for StubFetcher {
    fn fetch_json(&self, address: &str) -> Option<Value> {
        self.calls.borrow_mut().push(address.to_string());
        self.documents.get(address).cloned()
    }
}

struct FixedSelector(Vec<String>);

impl FieldSelector for FixedSelector {
    fn label(&self) -> String {
        "fixed".to_string()
    }

    fn select_fields(&self, _metadata: &Map<String, Value>) -> Vec<String> {
        self.0.clone()
    }
}

/// Embeds text as `[char count, word count, 1.0]`; optionally refuses one text.
struct CountingEmbedder {
    config: SemanticModelConfig,
    poison: Option<String>,
}

impl CountingEmbedder {
    fn new(dimensions: Option<usize>) -> Self {
        Self {
            config: SemanticModelConfig {
                model_id: "counting".to_string(),
                model_name: "counting".to_string(),
                dimensions,
                normalization: "none".to_string(),
                backend: "test".to_string(),
            },
            poison: None,
        }
    }
}

impl Embedder for CountingEmbedder {
    fn config(&self) -> &SemanticModelConfig {
        &self.config
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.poison.as_deref() == Some(text) {
            bail!("embedding backend unavailable");
        }
        Ok(vec![
            text.chars().count() as f32,
            text.split_whitespace().count() as f32,
            1.0,
        ])
    }
}

#[derive(Default)]
struct MemorySink {
    successes: Vec<EnrichedVectorRecord>,
    failures: Vec<FailureRecord>,
}

impl RecordSink for MemorySink {
    fn write_success(&mut self, record: &EnrichedVectorRecord) -> Result<()> {
        self.successes.push(record.clone());
        Ok(())
    }

    fn write_failure(&mut self, record: &FailureRecord) -> Result<()> {
        self.failures.push(record.clone());
        Ok(())
    }
}

fn fox_metadata() -> Value {
    serde_json::json!({
        "name": "Fox #1",
        "description": "A clever fox",
        "attributes": [
            {"trait_type": "Fur", "value": "Red"},
            {"trait_type": "Eyes", "value": "Green"}
        ],
        "image": "ipfs://QmImage"
    })
}

fn context(fetcher: StubFetcher, fields: &[&str], embedder: CountingEmbedder) -> EnrichContext {
    EnrichContext {
        normalizer: UriNormalizer::new(DEFAULT_GATEWAY_BASE).expect("normalizer"),
        fetcher: Box::new(fetcher),
        selector: Box::new(FixedSelector(
            fields.iter().map(|field| field.to_string()).collect(),
        )),
        embedder: Box::new(embedder),
        max_description_chars: 2000,
    }
}

fn state(id: &str, token_uri: Option<&str>) -> AssetState {
    AssetState::new(
        id,
        token_uri.map(ToOwned::to_owned),
        Some("Fox".to_string()),
        Some("an orange fox".to_string()),
    )
}

#[test]
fn fetchable_record_is_described_embedded_and_stored() {
    let fetcher = StubFetcher::default().with("https://meta.example/1", fox_metadata());
    let mut pipeline = Pipeline::new(context(
        fetcher,
        &["description", "attributes"],
        CountingEmbedder::new(Some(3)),
    ));
    let mut sink = MemorySink::default();

    let finished = pipeline
        .run(state("a1", Some("https://meta.example/1")), &mut sink)
        .expect("pipeline should finish");

    let expected = "Fox. an orange fox. A clever fox. Fur. Red. Eyes. Green";
    assert_eq!(finished.outcome, Some(Outcome::Description(expected.to_string())));
    assert!(finished.is_complete());
    assert_eq!(
        finished.fields_to_use,
        Some(vec!["description".to_string(), "attributes".to_string()])
    );
    assert!(sink.failures.is_empty());
    assert_eq!(sink.successes.len(), 1);
    assert_eq!(sink.successes[0].id, "a1");
    assert_eq!(sink.successes[0].description_text, expected);
    assert_eq!(sink.successes[0].embedding.len(), 3);
}

#[test]
fn ipfs_reference_is_fetched_through_gateway() {
    let fetcher = StubFetcher::default().with(
        "https://gateway.pinata.cloud/ipfs/Qm123/meta.json",
        fox_metadata(),
    );
    let calls = Rc::clone(&fetcher.calls);
    let mut pipeline = Pipeline::new(context(fetcher, &[], CountingEmbedder::new(None)));
    let mut sink = MemorySink::default();

    let finished = pipeline
        .run(state("a2", Some("ipfs://Qm123/meta.json")), &mut sink)
        .expect("pipeline should finish");

    assert_eq!(
        finished.normalized_uri.as_deref(),
        Some("https://gateway.pinata.cloud/ipfs/Qm123/meta.json")
    );
    assert_eq!(calls.borrow().len(), 1);
    assert_eq!(sink.successes.len(), 1);
    assert_eq!(pipeline.embedding_dim(), Some(3));
}

#[test]
fn empty_field_selection_still_produces_degraded_description() {
    let fetcher = StubFetcher::default().with("https://meta.example/1", fox_metadata());
    let mut pipeline = Pipeline::new(context(fetcher, &[], CountingEmbedder::new(Some(3))));
    let mut sink = MemorySink::default();

    let finished = pipeline
        .run(state("a3", Some("https://meta.example/1")), &mut sink)
        .expect("pipeline should finish");

    assert_eq!(
        finished.outcome,
        Some(Outcome::Description("Fox. an orange fox. ".to_string()))
    );
    assert_eq!(finished.fields_to_use, Some(Vec::new()));
}

#[test]
fn unfetchable_metadata_routes_to_failure_log_only() {
    let fetcher = StubFetcher::default();
    let calls = Rc::clone(&fetcher.calls);
    let mut pipeline = Pipeline::new(context(fetcher, &["name"], CountingEmbedder::new(Some(3))));
    let mut sink = MemorySink::default();

    let finished = pipeline
        .run(state("a4", Some("https://meta.example/404")), &mut sink)
        .expect("pipeline should finish");

    assert_eq!(
        finished.outcome,
        Some(Outcome::FailureReason(UNFETCHABLE_METADATA.to_string()))
    );
    assert_eq!(finished.failed_at, Some(Stage::FetchMetadata));
    assert!(finished.is_complete());
    assert!(finished.description_text.is_none());
    assert!(sink.successes.is_empty());
    assert_eq!(
        sink.failures,
        vec![FailureRecord {
            id: "a4".to_string(),
            reason: UNFETCHABLE_METADATA.to_string(),
        }]
    );
    assert_eq!(calls.borrow().as_slice(), ["https://meta.example/404"]);
}

#[test]
fn empty_or_non_object_metadata_is_unfetchable() {
    let fetcher = StubFetcher::default()
        .with("https://meta.example/empty", serde_json::json!({}))
        .with("https://meta.example/list", serde_json::json!(["a", "b"]));
    let mut pipeline = Pipeline::new(context(fetcher, &[], CountingEmbedder::new(Some(3))));
    let mut sink = MemorySink::default();

    for (id, uri) in [("e1", "https://meta.example/empty"), ("e2", "https://meta.example/list")] {
        let finished = pipeline.run(state(id, Some(uri)), &mut sink).expect("finish");
        assert_eq!(finished.failed_at, Some(Stage::FetchMetadata));
    }
    assert_eq!(sink.failures.len(), 2);
    assert!(sink.successes.is_empty());
}

#[test]
fn non_normalizable_reference_fails_with_raw_uri_and_skips_fetch() {
    let fetcher = StubFetcher::default();
    let calls = Rc::clone(&fetcher.calls);
    let mut pipeline = Pipeline::new(context(fetcher, &[], CountingEmbedder::new(Some(3))));
    let mut sink = MemorySink::default();

    let finished = pipeline
        .run(state("a5", Some("not-a-uri")), &mut sink)
        .expect("pipeline should finish");

    assert_eq!(
        finished.outcome,
        Some(Outcome::FailureReason("not-a-uri".to_string()))
    );
    assert_eq!(finished.failed_at, Some(Stage::InspectTokenUri));
    assert!(finished.normalized_uri.is_none());
    assert!(calls.borrow().is_empty());
    assert_eq!(sink.failures[0].reason, "not-a-uri");
    assert!(sink.successes.is_empty());
}

#[test]
fn missing_token_uri_is_unfetchable() {
    let fetcher = StubFetcher::default();
    let calls = Rc::clone(&fetcher.calls);
    let mut pipeline = Pipeline::new(context(fetcher, &[], CountingEmbedder::new(Some(3))));
    let mut sink = MemorySink::default();

    let finished = pipeline.run(state("a6", None), &mut sink).expect("finish");

    assert_eq!(
        finished.outcome,
        Some(Outcome::FailureReason(UNFETCHABLE_METADATA.to_string()))
    );
    assert!(calls.borrow().is_empty());
}

#[test]
fn field_selection_without_metadata_reports_no_metadata() {
    let pipeline = Pipeline::new(context(
        StubFetcher::default(),
        &["name"],
        CountingEmbedder::new(Some(3)),
    ));
    let mut orphan = state("a7", Some("https://meta.example/1"));

    let next = pipeline.run_field_selection(&mut orphan);

    assert_eq!(next, Stage::FailureLogger);
    assert_eq!(
        orphan.outcome,
        Some(Outcome::FailureReason(NO_METADATA_AVAILABLE.to_string()))
    );
    assert_eq!(orphan.failed_at, Some(Stage::RunFieldSelection));
    assert!(orphan.fields_to_use.is_none());
}

#[test]
fn embedding_dimension_mismatch_is_an_error_and_writes_nothing() {
    let fetcher = StubFetcher::default().with("https://meta.example/1", fox_metadata());
    let mut pipeline = Pipeline::new(context(fetcher, &[], CountingEmbedder::new(Some(384))));
    let mut sink = MemorySink::default();

    let err = pipeline
        .run(state("a8", Some("https://meta.example/1")), &mut sink)
        .expect_err("3-dim vector must not enter a 384-dim store");

    assert!(err.to_string().contains("dimensions"));
    assert!(sink.successes.is_empty() && sink.failures.is_empty());
}

fn write_input(dir: &std::path::Path, lines: &[&str]) -> std::path::PathBuf {
    let path = dir.join("captioned_assets.ndjson");
    fs::write(&path, lines.join("\n")).expect("write input");
    path
}

fn settings(dir: &std::path::Path, checkpoint_every: usize) -> DriverSettings {
    DriverSettings {
        checkpoint_path: dir.join("checkpoint.txt"),
        checkpoint_every,
        limit: None,
    }
}

fn run_driver(
    dir: &std::path::Path,
    input: &std::path::Path,
    fetcher: StubFetcher,
    checkpoint_every: usize,
) -> super::driver::BatchReport {
    let vectors = dir.join("enriched_vectors.jsonl");
    let failures = dir.join("failures.log");
    let processed = StoreIndex::load(&vectors).expect("load success index");
    let previously_failed = StoreIndex::load(&failures).expect("load failure index");
    let mut pipeline = Pipeline::new(context(
        fetcher,
        &["description"],
        CountingEmbedder::new(Some(3)),
    ));
    let mut stores = JsonlStores::open(&vectors, &failures).expect("open stores");
    let reader = std::io::BufReader::new(fs::File::open(input).expect("open input"));

    drive_batch(
        reader,
        &processed,
        &previously_failed,
        &mut pipeline,
        &mut stores,
        &settings(dir, checkpoint_every),
    )
    .expect("batch should complete")
}

const BATCH: [&str; 4] = [
    r#"{"id":"ok-1","nftMetadata":{"tokenUri":"https://meta.example/1","name":"Fox"},"imageCaption":"an orange fox"}"#,
    r#"{"id":"bad-uri","tokenUri":"not-a-uri","name":"Ghost"}"#,
    r#"{"id":"down","tokenUri":"https://meta.example/down"}"#,
    r#"{"id":"ok-2","tokenUri":"ipfs://QmTwo","name":"Owl","imageCaption":"ERROR: timeout"}"#,
];

fn batch_fetcher() -> StubFetcher {
    StubFetcher::default()
        .with("https://meta.example/1", fox_metadata())
        .with(
            "https://gateway.pinata.cloud/ipfs/QmTwo",
            serde_json::json!({"description": "A wise owl"}),
        )
}

#[test]
fn driver_routes_each_attempted_id_to_exactly_one_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = write_input(dir.path(), &BATCH);

    let report = run_driver(dir.path(), &input, batch_fetcher(), 100);

    assert_eq!(report.counts.attempted, 4);
    assert_eq!(report.counts.succeeded, 2);
    assert_eq!(report.counts.failed, 2);
    assert_eq!(report.counts.failed_by_stage.get("inspect_token_uri"), Some(&1));
    assert_eq!(report.counts.failed_by_stage.get("fetch_metadata"), Some(&1));

    let successes = StoreIndex::load(&dir.path().join("enriched_vectors.jsonl")).expect("load");
    let failures = StoreIndex::load(&dir.path().join("failures.log")).expect("load");
    assert_eq!(successes.ids.len(), 2);
    assert!(successes.contains("ok-1") && successes.contains("ok-2"));
    assert!(failures.contains("bad-uri") && failures.contains("down"));
    assert!(successes.ids.is_disjoint(&failures.ids));

    let vectors = fs::read_to_string(dir.path().join("enriched_vectors.jsonl")).expect("read");
    let owl: EnrichedVectorRecord =
        serde_json::from_str(vectors.lines().nth(1).expect("second line")).expect("parse");
    assert_eq!(owl.description_text, "Owl. . A wise owl");
}

#[test]
fn rerunning_driver_skips_embedded_ids_without_fetching() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = write_input(dir.path(), &BATCH);
    run_driver(dir.path(), &input, batch_fetcher(), 100);

    let fetcher = batch_fetcher();
    let calls = Rc::clone(&fetcher.calls);
    let report = run_driver(dir.path(), &input, fetcher, 100);

    assert_eq!(report.counts.skipped_processed, 2);
    assert_eq!(report.counts.succeeded, 0);
    // Only the previously failed fetchable id is retried.
    assert_eq!(calls.borrow().as_slice(), ["https://meta.example/down"]);

    let vectors = fs::read_to_string(dir.path().join("enriched_vectors.jsonl")).expect("read");
    assert_eq!(vectors.lines().count(), 2);
}

#[test]
fn driver_reports_recovered_failures() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = write_input(dir.path(), &BATCH);
    run_driver(dir.path(), &input, batch_fetcher(), 100);

    let healed = batch_fetcher().with(
        "https://meta.example/down",
        serde_json::json!({"description": "back online"}),
    );
    let report = run_driver(dir.path(), &input, healed, 100);

    assert_eq!(report.counts.succeeded, 1);
    assert!(report.recovered_ids.contains("down"));
    assert_eq!(report.recovered_ids.len(), 1);
}

#[test]
fn driver_checkpoints_every_n_records_and_at_the_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = write_input(dir.path(), &BATCH[..3]);

    run_driver(dir.path(), &input, batch_fetcher(), 2);

    assert_eq!(
        fs::read_to_string(dir.path().join("checkpoint.txt")).expect("checkpoint"),
        "down\n"
    );
}

#[test]
fn driver_skips_invalid_lines_and_duplicate_ids() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = write_input(
        dir.path(),
        &[
            BATCH[0],
            "",
            "{not json",
            r#"{"name":"no id"}"#,
            BATCH[0],
        ],
    );

    let report = run_driver(dir.path(), &input, batch_fetcher(), 100);

    assert_eq!(report.counts.input_lines, 4);
    assert_eq!(report.counts.invalid_lines, 2);
    assert_eq!(report.counts.skipped_duplicate, 1);
    assert_eq!(report.counts.attempted, 1);
    assert_eq!(report.last_processed_id.as_deref(), Some("ok-1"));
}

#[test]
fn driver_continues_after_record_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let vectors = dir.path().join("enriched_vectors.jsonl");
    let failures = dir.path().join("failures.log");
    let mut embedder = CountingEmbedder::new(Some(3));
    embedder.poison = Some("Fox. an orange fox. A clever fox".to_string());
    let mut pipeline = Pipeline::new(context(batch_fetcher(), &["description"], embedder));
    let mut stores = JsonlStores::open(&vectors, &failures).expect("open stores");
    let input = [BATCH[0], BATCH[3]].join("\n");

    let report = drive_batch(
        Cursor::new(input),
        &StoreIndex::default(),
        &StoreIndex::default(),
        &mut pipeline,
        &mut stores,
        &settings(dir.path(), 100),
    )
    .expect("batch should complete");

    assert_eq!(report.counts.errored, 1);
    assert_eq!(report.counts.succeeded, 1);
    let successes = StoreIndex::load(&vectors).expect("load");
    assert!(successes.contains("ok-2") && !successes.contains("ok-1"));
    assert!(StoreIndex::load(&failures).expect("load").ids.is_empty());
}

#[test]
fn driver_respects_record_limit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let vectors = dir.path().join("enriched_vectors.jsonl");
    let failures = dir.path().join("failures.log");
    let mut pipeline = Pipeline::new(context(batch_fetcher(), &[], CountingEmbedder::new(Some(3))));
    let mut stores = JsonlStores::open(&vectors, &failures).expect("open stores");
    let mut limited = settings(dir.path(), 100);
    limited.limit = Some(2);

    let report = drive_batch(
        Cursor::new(BATCH.join("\n")),
        &StoreIndex::default(),
        &StoreIndex::default(),
        &mut pipeline,
        &mut stores,
        &limited,
    )
    .expect("batch should complete");

    assert_eq!(report.counts.attempted, 2);
    assert_eq!(report.last_processed_id.as_deref(), Some("bad-uri"));
}

#[test]
fn fetch_failing_every_attempt_marks_record_unfetchable() {
    use std::time::Duration;

    use wiremock::matchers::path;
    use wiremock::{Mock, ResponseTemplate};

    use super::fetch::{FetchPolicy, HttpMetadataFetcher};
    use crate::test_support::{MockHttp, json_response};

    let http = MockHttp::start();
    http.mount(
        Mock::given(path("/meta/9.json"))
            .respond_with(json_response(500, "{}"))
            .up_to_n_times(1),
    );
    http.mount(
        Mock::given(path("/meta/9.json"))
            .respond_with(json_response(502, "{}"))
            .up_to_n_times(1),
    );
    http.mount(
        Mock::given(path("/meta/9.json"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("nope", "text/plain")),
    );
    let fetcher = HttpMetadataFetcher::new(FetchPolicy {
        retries: 3,
        timeout: Duration::from_secs(5),
        retry_delay: Duration::from_millis(1),
    })
    .expect("fetcher should build");
    let mut pipeline = Pipeline::new(EnrichContext {
        normalizer: UriNormalizer::new(DEFAULT_GATEWAY_BASE).expect("normalizer"),
        fetcher: Box::new(fetcher),
        selector: Box::new(FixedSelector(Vec::new())),
        embedder: Box::new(CountingEmbedder::new(Some(3))),
        max_description_chars: 2000,
    });
    let mut sink = MemorySink::default();

    let finished = pipeline
        .run(state("flaky", Some(http.url("/meta/9.json").as_str())), &mut sink)
        .expect("pipeline should finish");

    assert_eq!(http.received_count(), 3);
    assert!(finished.is_complete());
    assert_eq!(
        finished.outcome,
        Some(Outcome::FailureReason(UNFETCHABLE_METADATA.to_string()))
    );
    assert!(sink.successes.is_empty());
    assert_eq!(sink.failures.len(), 1);
}

#[test]
fn non_utf8_input_line_is_skipped_and_batch_continues() {
    let dir = tempfile::tempdir().expect("tempdir");
    let vectors = dir.path().join("enriched_vectors.jsonl");
    let failures = dir.path().join("failures.log");
    let mut pipeline = Pipeline::new(context(
        batch_fetcher(),
        &["description"],
        CountingEmbedder::new(Some(3)),
    ));
    let mut stores = JsonlStores::open(&vectors, &failures).expect("open stores");
    let mut input = b"{\"id\":\"bad\",\"name\":\"\xff\xfe\"}\n".to_vec();
    input.extend_from_slice(BATCH[0].as_bytes());
    input.extend_from_slice(b"\r\n");

    let report = drive_batch(
        Cursor::new(input),
        &StoreIndex::default(),
        &StoreIndex::default(),
        &mut pipeline,
        &mut stores,
        &settings(dir.path(), 100),
    )
    .expect("batch should complete");

    assert_eq!(report.counts.input_lines, 2);
    assert_eq!(report.counts.invalid_lines, 1);
    assert_eq!(report.counts.succeeded, 1);
    assert_eq!(report.last_processed_id.as_deref(), Some("ok-1"));
    assert!(StoreIndex::load(&vectors).expect("load").contains("ok-1"));
    assert_eq!(
        fs::read_to_string(dir.path().join("checkpoint.txt")).expect("checkpoint"),
        "ok-1\n"
    );
}

#[test]
fn overlap_left_by_interrupted_run_is_pruned_on_rerun() {
    let dir = tempfile::tempdir().expect("tempdir");
    let vectors = dir.path().join("enriched_vectors.jsonl");
    let failures = dir.path().join("failures.log");
    fs::write(
        &vectors,
        "{\"id\":\"down\",\"descriptionText\":\"x\",\"embedding\":[1.0,0.0,0.0]}\n",
    )
    .expect("seed vectors");
    fs::write(
        &failures,
        "{\"id\":\"down\",\"reason\":\"Unfetchable metadata\"}\n\
         {\"id\":\"bad-uri\",\"reason\":\"not-a-uri\"}\n",
    )
    .expect("seed failures");
    let input = write_input(dir.path(), &[BATCH[2]]);

    let report = run_driver(dir.path(), &input, batch_fetcher(), 100);
    assert_eq!(report.counts.skipped_processed, 1);
    assert!(report.recovered_ids.is_empty());

    let processed = StoreIndex::load(&vectors).expect("load");
    let previously_failed = StoreIndex::load(&failures).expect("load");
    let to_prune = failures_to_prune(&processed, &previously_failed, &report);
    assert_eq!(to_prune, HashSet::from(["down".to_string()]));

    let dropped = prune_failure_store(&failures, &to_prune).expect("prune");
    assert_eq!(dropped, 1);
    let failures_after = StoreIndex::load(&failures).expect("load");
    assert!(failures_after.ids.is_disjoint(&processed.ids));
    assert!(failures_after.contains("bad-uri"));
}

#[test]
fn failures_to_prune_includes_recoveries_from_this_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = write_input(dir.path(), &BATCH);
    run_driver(dir.path(), &input, batch_fetcher(), 100);

    let processed = StoreIndex::load(&dir.path().join("enriched_vectors.jsonl")).expect("load");
    let previously_failed = StoreIndex::load(&dir.path().join("failures.log")).expect("load");
    let healed = batch_fetcher().with(
        "https://meta.example/down",
        serde_json::json!({"description": "back online"}),
    );
    let report = run_driver(dir.path(), &input, healed, 100);

    let to_prune = failures_to_prune(&processed, &previously_failed, &report);
    assert_eq!(to_prune, HashSet::from(["down".to_string()]));
}
