use anyhow::{Context, Result, bail};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::compose::{compose_description, flatten_fields};
use super::fetch::MetadataFetcher;
use super::selector::FieldSelector;
use super::store::RecordSink;
use super::uri::UriNormalizer;
use crate::model::{AssetRecord, EnrichedVectorRecord, FailureRecord};
use crate::semantic::Embedder;

pub const UNFETCHABLE_METADATA: &str = "Unfetchable metadata";
pub const NO_METADATA_AVAILABLE: &str = "No metadata available";

/// Terminal result of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Description(String),
    FailureReason(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    InspectTokenUri,
    FetchMetadata,
    RunFieldSelection,
    ExtractDescription,
    Embed,
    FailureLogger,
    Done,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InspectTokenUri => "inspect_token_uri",
            Self::FetchMetadata => "fetch_metadata",
            Self::RunFieldSelection => "run_field_selection",
            Self::ExtractDescription => "extract_description",
            Self::Embed => "embed",
            Self::FailureLogger => "failure_logger",
            Self::Done => "done",
        }
    }
}

/// Per-record working state, owned by one [`Pipeline::run`] call.
#[derive(Debug, Clone, Default)]
pub struct AssetState {
    pub id: String,
    pub name: Option<String>,
    pub image_caption: Option<String>,
    pub token_uri: Option<String>,
    pub normalized_uri: Option<String>,
    pub fetched_metadata: Option<Map<String, Value>>,
    pub fields_to_use: Option<Vec<String>>,
    pub description_text: Option<String>,
    pub outcome: Option<Outcome>,
    pub failed_at: Option<Stage>,
}

impl AssetState {
    pub fn new(
        id: impl Into<String>,
        token_uri: Option<String>,
        name: Option<String>,
        image_caption: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            token_uri,
            name,
            image_caption: image_caption.filter(|caption| !caption.is_empty()),
            ..Self::default()
        }
    }

    pub fn from_record(record: &AssetRecord) -> Self {
        Self::new(
            record.id.clone(),
            record.resolved_token_uri(),
            record.resolved_name(),
            record.resolved_caption(),
        )
    }

    pub fn is_complete(&self) -> bool {
        self.outcome.is_some()
    }

    fn fail(&mut self, stage: Stage, reason: impl Into<String>) -> Stage {
        debug_assert!(!self.is_complete(), "record {} failed after completion", self.id);
        let reason = reason.into();
        warn!(id = %self.id, stage = stage.as_str(), %reason, "record routed to failure log");
        self.outcome = Some(Outcome::FailureReason(reason));
        self.failed_at = Some(stage);
        Stage::FailureLogger
    }
}

/// Capabilities shared by every record of a run. Built once at startup and dropped at shutdown.
pub struct EnrichContext {
    pub normalizer: UriNormalizer,
    pub fetcher: Box<dyn MetadataFetcher>,
    pub selector: Box<dyn FieldSelector>,
    pub embedder: Box<dyn Embedder>,
    pub max_description_chars: usize,
}

pub struct Pipeline {
    context: EnrichContext,
    embedding_dim: Option<usize>,
}

impl Pipeline {
    pub fn new(context: EnrichContext) -> Self {
        let embedding_dim = context.embedder.config().dimensions;
        Self {
            context,
            embedding_dim,
        }
    }

    pub fn context(&self) -> &EnrichContext {
        &self.context
    }

    /// Dimension every stored embedding of this run has, once known.
    pub fn embedding_dim(&self) -> Option<usize> {
        self.embedding_dim
    }

    /// Drives one record from `InspectTokenUri` to a terminal stage.
    ///
    /// Errors are unexpected failures (embedding backend, store I/O); the record then reached
    /// neither store.
    pub fn run(&mut self, mut state: AssetState, sink: &mut dyn RecordSink) -> Result<AssetState> {
        let mut stage = Stage::InspectTokenUri;

        while stage != Stage::Done {
            debug!(id = %state.id, stage = stage.as_str(), "entering stage");
            stage = match stage {
                Stage::InspectTokenUri => self.inspect_token_uri(&mut state),
                Stage::FetchMetadata => self.fetch_metadata(&mut state),
                Stage::RunFieldSelection => self.run_field_selection(&mut state),
                Stage::ExtractDescription => self.extract_description(&mut state),
                Stage::Embed => self.embed(&mut state, sink)?,
                Stage::FailureLogger => log_failure(&state, sink)?,
                Stage::Done => Stage::Done,
            };
        }

        Ok(state)
    }

    fn inspect_token_uri(&self, state: &mut AssetState) -> Stage {
        state.normalized_uri = self.context.normalizer.normalize(state.token_uri.as_deref());

        if state.normalized_uri.is_none() {
            // The raw reference is the last-resort description, recorded as the reason.
            if let Some(raw) = state.token_uri.clone() {
                return state.fail(Stage::InspectTokenUri, raw);
            }
        }
        Stage::FetchMetadata
    }

    fn fetch_metadata(&self, state: &mut AssetState) -> Stage {
        let fetched = state
            .normalized_uri
            .as_deref()
            .and_then(|address| self.context.fetcher.fetch_json(address));

        match fetched {
            Some(Value::Object(metadata)) if !metadata.is_empty() => {
                state.fetched_metadata = Some(metadata);
                Stage::RunFieldSelection
            }
            _ => state.fail(Stage::FetchMetadata, UNFETCHABLE_METADATA),
        }
    }

    pub(super) fn run_field_selection(&self, state: &mut AssetState) -> Stage {
        let Some(metadata) = state.fetched_metadata.as_ref() else {
            return state.fail(Stage::RunFieldSelection, NO_METADATA_AVAILABLE);
        };

        let fields = self.context.selector.select_fields(metadata);
        debug!(id = %state.id, field_count = fields.len(), "fields selected");
        state.fields_to_use = Some(fields);
        Stage::ExtractDescription
    }

    fn extract_description(&self, state: &mut AssetState) -> Stage {
        let fragments = match (&state.fetched_metadata, &state.fields_to_use) {
            (Some(metadata), Some(fields)) => flatten_fields(metadata, fields),
            _ => Vec::new(),
        };

        state.description_text = Some(compose_description(
            state.name.as_deref(),
            state.image_caption.as_deref(),
            &fragments,
            self.context.max_description_chars,
        ));
        Stage::Embed
    }

    fn embed(&mut self, state: &mut AssetState, sink: &mut dyn RecordSink) -> Result<Stage> {
        let description = state.description_text.clone().unwrap_or_default();
        let embedding = self
            .context
            .embedder
            .embed(&description)
            .with_context(|| format!("failed to embed description for {}", state.id))?;

        match self.embedding_dim {
            Some(expected) if expected != embedding.len() => bail!(
                "embedding for {} has {} dimensions, run uses {}",
                state.id,
                embedding.len(),
                expected
            ),
            Some(_) => {}
            None => self.embedding_dim = Some(embedding.len()),
        }

        sink.write_success(&EnrichedVectorRecord {
            id: state.id.clone(),
            description_text: description.clone(),
            embedding,
        })?;

        state.outcome = Some(Outcome::Description(description));
        Ok(Stage::Done)
    }
}

fn log_failure(state: &AssetState, sink: &mut dyn RecordSink) -> Result<Stage> {
    let Some(Outcome::FailureReason(reason)) = &state.outcome else {
        bail!("record {} reached the failure log without a failure reason", state.id);
    };

    sink.write_failure(&FailureRecord {
        id: state.id.clone(),
        reason: reason.clone(),
    })?;
    Ok(Stage::Done)
}
