use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::commands::enrich::{
    DEFAULT_CHECKPOINT_EVERY, DEFAULT_FETCH_RETRIES, DEFAULT_FETCH_RETRY_DELAY_MS,
    DEFAULT_FETCH_TIMEOUT_SECS, DEFAULT_GATEWAY_BASE, DEFAULT_MAX_DESCRIPTION_CHARS,
    DEFAULT_SELECTOR_ENDPOINT, DEFAULT_SELECTOR_MODEL, DEFAULT_SELECTOR_TIMEOUT_SECS,
};
use crate::semantic::DEFAULT_MODEL_ID;

pub const DEFAULT_CACHE_ROOT: &str = ".cache/nft-enrich";

#[derive(Parser, Debug)]
#[command(
    name = "nft-enrich",
    version,
    about = "Describe and embed NFT asset records from their token metadata"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Enrich(EnrichArgs),
    Status(StatusArgs),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum SelectorMode {
    Ollama,
    Off,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum EmbedBackend {
    LocalHash,
    Openai,
}

impl EmbedBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LocalHash => "local-hash",
            Self::Openai => "openai",
        }
    }
}

/// Output locations shared by `enrich` and `status`.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    #[arg(long, default_value = DEFAULT_CACHE_ROOT)]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub vectors_path: Option<PathBuf>,

    #[arg(long)]
    pub failures_path: Option<PathBuf>,

    #[arg(long)]
    pub checkpoint_path: Option<PathBuf>,
}

impl StoreArgs {
    pub fn vectors_path(&self) -> PathBuf {
        self.vectors_path
            .clone()
            .unwrap_or_else(|| self.cache_root.join("enriched_vectors.jsonl"))
    }

    pub fn failures_path(&self) -> PathBuf {
        self.failures_path
            .clone()
            .unwrap_or_else(|| self.cache_root.join("failures.log"))
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint_path
            .clone()
            .unwrap_or_else(|| self.cache_root.join("checkpoint.txt"))
    }

    pub fn manifest_dir(&self) -> PathBuf {
        self.cache_root.join("manifests")
    }
}

#[derive(Args, Debug, Clone)]
pub struct EnrichArgs {
    #[arg(long, default_value = "captioned_assets.ndjson")]
    pub input: PathBuf,

    #[command(flatten)]
    pub stores: StoreArgs,

    #[arg(long)]
    pub manifest_path: Option<PathBuf>,

    #[arg(long, env = "NFT_ENRICH_GATEWAY", default_value = DEFAULT_GATEWAY_BASE)]
    pub gateway_base: String,

    #[arg(long, default_value_t = DEFAULT_FETCH_RETRIES)]
    pub fetch_retries: usize,

    #[arg(long, default_value_t = DEFAULT_FETCH_TIMEOUT_SECS)]
    pub fetch_timeout_secs: u64,

    #[arg(long, default_value_t = DEFAULT_FETCH_RETRY_DELAY_MS)]
    pub fetch_retry_delay_ms: u64,

    #[arg(long, value_enum, default_value_t = SelectorMode::Ollama)]
    pub selector: SelectorMode,

    #[arg(long, env = "NFT_ENRICH_SELECTOR_ENDPOINT", default_value = DEFAULT_SELECTOR_ENDPOINT)]
    pub selector_endpoint: String,

    #[arg(long, default_value = DEFAULT_SELECTOR_MODEL)]
    pub selector_model: String,

    #[arg(long, default_value_t = DEFAULT_SELECTOR_TIMEOUT_SECS)]
    pub selector_timeout_secs: u64,

    #[arg(long, value_enum, default_value_t = EmbedBackend::LocalHash)]
    pub embed_backend: EmbedBackend,

    /// Local-hash model id, or the remote model name for `openai`.
    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    pub model_id: String,

    #[arg(long)]
    pub embedding_dim: Option<usize>,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub openai_base_url: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    #[arg(long, default_value_t = 30)]
    pub embed_timeout_secs: u64,

    #[arg(long, default_value_t = 3)]
    pub embed_max_retries: usize,

    #[arg(long, default_value_t = DEFAULT_CHECKPOINT_EVERY)]
    pub checkpoint_every: usize,

    #[arg(long)]
    pub limit: Option<usize>,

    #[arg(long, default_value_t = DEFAULT_MAX_DESCRIPTION_CHARS)]
    pub max_description_chars: usize,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub stores: StoreArgs,
}
