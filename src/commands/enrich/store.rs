use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::{EnrichedVectorRecord, FailureRecord};
use crate::util::ensure_parent_directory;

/// Destination for terminal records.
pub trait RecordSink {
    fn write_success(&mut self, record: &EnrichedVectorRecord) -> Result<()>;

    fn write_failure(&mut self, record: &FailureRecord) -> Result<()>;
}

/// Append-only NDJSON success and failure stores.
pub struct JsonlStores {
    vectors_path: PathBuf,
    failures_path: PathBuf,
    vectors: BufWriter<File>,
    failures: BufWriter<File>,
}

impl JsonlStores {
    pub fn open(vectors_path: &Path, failures_path: &Path) -> Result<Self> {
        Ok(Self {
            vectors: open_append(vectors_path)?,
            failures: open_append(failures_path)?,
            vectors_path: vectors_path.to_path_buf(),
            failures_path: failures_path.to_path_buf(),
        })
    }
}

impl RecordSink for JsonlStores {
    fn write_success(&mut self, record: &EnrichedVectorRecord) -> Result<()> {
        append_json_line(&mut self.vectors, record)
            .with_context(|| format!("failed to append to {}", self.vectors_path.display()))
    }

    fn write_failure(&mut self, record: &FailureRecord) -> Result<()> {
        append_json_line(&mut self.failures, record)
            .with_context(|| format!("failed to append to {}", self.failures_path.display()))
    }
}

fn open_append(path: &Path) -> Result<BufWriter<File>> {
    ensure_parent_directory(path)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open store for append: {}", path.display()))?;
    Ok(BufWriter::new(file))
}

// Flushed per line so a crash never loses an id that a rerun would then skip.
fn append_json_line<T: Serialize>(writer: &mut BufWriter<File>, value: &T) -> Result<()> {
    serde_json::to_writer(&mut *writer, value).context("failed to serialize store record")?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

#[derive(Deserialize)]
struct StoredId {
    id: String,
}

/// Ids already present in a store, read line by line. A missing file is an empty store.
#[derive(Debug, Clone, Default)]
pub struct StoreIndex {
    pub ids: HashSet<String>,
    pub lines: usize,
    pub malformed_lines: usize,
}

impl StoreIndex {
    pub fn load(path: &Path) -> Result<Self> {
        let mut index = Self::default();
        if !path.exists() {
            return Ok(index);
        }

        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| {
                format!("failed to read line {} of {}", line_no + 1, path.display())
            })?;
            if line.trim().is_empty() {
                continue;
            }
            index.lines += 1;
            match serde_json::from_str::<StoredId>(&line) {
                Ok(stored) => {
                    index.ids.insert(stored.id);
                }
                Err(err) => {
                    index.malformed_lines += 1;
                    warn!(
                        path = %path.display(),
                        line = line_no + 1,
                        error = %err,
                        "skipping malformed store line"
                    );
                }
            }
        }

        Ok(index)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

pub fn write_checkpoint(path: &Path, last_id: &str) -> Result<()> {
    ensure_parent_directory(path)?;
    fs::write(path, format!("{last_id}\n"))
        .with_context(|| format!("failed to write checkpoint: {}", path.display()))
}

pub fn read_checkpoint(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read checkpoint: {}", path.display()))?;
    let id = raw.trim();
    Ok((!id.is_empty()).then(|| id.to_string()))
}

/// Rewrites the failure store without `recovered` ids. Returns the number of lines dropped.
pub fn prune_failure_store(path: &Path, recovered: &HashSet<String>) -> Result<usize> {
    if recovered.is_empty() || !path.exists() {
        return Ok(0);
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut kept = String::with_capacity(raw.len());
    let mut dropped = 0usize;
    for line in raw.lines() {
        let is_recovered = serde_json::from_str::<StoredId>(line)
            .map(|stored| recovered.contains(&stored.id))
            .unwrap_or(false);
        if is_recovered {
            dropped += 1;
            continue;
        }
        kept.push_str(line);
        kept.push('\n');
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    fs::write(&tmp_path, kept)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "failed to replace {} with {}",
            path.display(),
            tmp_path.display()
        )
    })?;

    Ok(dropped)
}
