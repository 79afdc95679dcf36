use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{StoreError, StoreResult};

const HISTORY_FILE: &str = "cycle_history.jsonl";

/// One completed announce cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    /// Torrent info-hash.
    pub hash: String,
    /// Torrent display name.
    pub name: String,
    /// Owning client instance.
    pub client_id: Option<u32>,
    /// Index of the completed cycle.
    pub cycle_index: u64,
    /// Unix epoch the cycle opened at.
    pub cycle_start: f64,
    /// Unix epoch the cycle closed at.
    pub cycle_end: f64,
    /// Bytes uploaded inside the cycle.
    pub uploaded: u64,
    /// Target the cycle was steered towards, bytes/second.
    pub target_bps: i64,
    /// Realised average, bytes/second.
    pub avg_bps: f64,
    /// Realised/target ratio.
    pub ratio: f64,
    /// Whether |ratio − 1| ≤ 0.03.
    pub hit: bool,
    /// First, synthetic cycle: ratio is informational only.
    #[serde(default)]
    pub informational: bool,
}

/// Bounded JSON-lines log of completed cycles.
///
/// Appends are cheap; when the file grows past twice the limit it is
/// rewritten keeping the newest `limit` records.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
    limit: usize,
}

impl HistoryStore {
    /// Log stored as `cycle_history.jsonl` under `base_dir`.
    #[must_use]
    pub fn new(base_dir: impl AsRef<Path>, limit: usize) -> Self {
        Self {
            path: base_dir.as_ref().join(HISTORY_FILE),
            limit: limit.max(1),
        }
    }

    /// Append one record, compacting when the log has outgrown its bound.
    ///
    /// # Errors
    ///
    /// Returns an error when the record cannot be encoded or written.
    pub fn append(&self, record: &CycleRecord) -> StoreResult<()> {
        if let Some(parent) = self.path.parent()
            && !parent.exists()
        {
            fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }
        let line = serde_json::to_string(record).map_err(|source| self.codec_error(source))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| self.io_error(source))?;
        writeln!(file, "{line}").map_err(|source| self.io_error(source))?;
        drop(file);

        if self.count()? > self.limit * 2 {
            self.compact()?;
        }
        Ok(())
    }

    /// The newest `limit` records, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the log cannot be read. Unparseable lines are
    /// skipped rather than failing the whole query.
    pub fn recent(&self, limit: usize) -> StoreResult<Vec<CycleRecord>> {
        let records = self.read_all()?;
        let skip = records.len().saturating_sub(limit);
        Ok(records.into_iter().skip(skip).collect())
    }

    fn read_all(&self) -> StoreResult<Vec<CycleRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path).map_err(|source| self.io_error(source))?;
        Ok(raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    fn count(&self) -> StoreResult<usize> {
        if !self.path.exists() {
            return Ok(0);
        }
        let raw = fs::read_to_string(&self.path).map_err(|source| self.io_error(source))?;
        Ok(raw.lines().filter(|line| !line.trim().is_empty()).count())
    }

    fn compact(&self) -> StoreResult<()> {
        let records = self.read_all()?;
        let skip = records.len().saturating_sub(self.limit);
        let mut out = String::new();
        for record in records.iter().skip(skip) {
            let line = serde_json::to_string(record).map_err(|source| self.codec_error(source))?;
            out.push_str(&line);
            out.push('\n');
        }
        let tmp = self.path.with_extension("jsonl.tmp");
        fs::write(&tmp, out.as_bytes()).map_err(|source| self.io_error(source))?;
        fs::rename(&tmp, &self.path).map_err(|source| self.io_error(source))
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    fn codec_error(&self, source: serde_json::Error) -> StoreError {
        StoreError::Codec {
            path: self.path.display().to_string(),
            source,
        }
    }
}
