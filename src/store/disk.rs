// =============================================================================
// DiskTier — durable NDJSON snapshot per series, atomic replace
// =============================================================================
//
// One file per `(symbol, interval)` holding the full retained bar history as
// newline-delimited JSON, readable with standard tools while the process is
// down (disaster recovery). Writes go through tmp + rename so a crash
// mid-write never corrupts the previous snapshot. All writers funnel through
// the write-behind flusher, so there is never more than one in-flight write
// per series file.
// =============================================================================

use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::types::{Bar, SeriesKey};

/// Durable bottom tier.
pub struct DiskTier {
    data_dir: PathBuf,
}

impl DiskTier {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Snapshot file for a series: `<data_dir>/<SYMBOL>_<interval>.ndjson`.
    pub fn path_for(&self, key: &SeriesKey) -> PathBuf {
        self.data_dir
            .join(format!("{}_{}.ndjson", key.symbol, key.interval))
    }

    /// Atomically replace the durable snapshot for `key` with `bars`.
    pub fn write_snapshot(&self, key: &SeriesKey, bars: &[Bar]) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir).with_context(|| {
            format!("failed to create data dir {}", self.data_dir.display())
        })?;

        let path = self.path_for(key);
        let tmp_path = path.with_extension("ndjson.tmp");

        {
            let file = std::fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            let mut writer = BufWriter::new(file);
            for bar in bars {
                let line = serde_json::to_string(bar)
                    .context("failed to serialise bar to NDJSON")?;
                writer
                    .write_all(line.as_bytes())
                    .and_then(|_| writer.write_all(b"\n"))
                    .with_context(|| format!("failed to write {}", tmp_path.display()))?;
            }
            writer
                .flush()
                .with_context(|| format!("failed to flush {}", tmp_path.display()))?;
        }

        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename tmp snapshot to {}", path.display()))?;

        debug!(key = %key, rows = bars.len(), "durable snapshot written");
        Ok(())
    }

    /// Read the durable snapshot for `key`. Returns `None` when no snapshot
    /// exists. Corrupt lines are skipped with a warning, not fatal — a partial
    /// snapshot is still better than none after a disaster.
    pub fn read_snapshot(&self, key: &SeriesKey) -> Result<Option<Vec<Bar>>> {
        let path = self.path_for(key);
        let file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to open snapshot {}", path.display()))
            }
        };

        let reader = BufReader::new(file);
        let mut bars = Vec::new();
        let mut skipped = 0usize;
        for line in reader.lines() {
            let line =
                line.with_context(|| format!("failed to read line from {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Bar>(&line) {
                Ok(bar) => bars.push(bar),
                Err(_) => skipped += 1,
            }
        }

        if skipped > 0 {
            warn!(key = %key, skipped, "skipped corrupt lines in durable snapshot");
        }

        Ok(Some(bars))
    }

    /// Number of rows in the durable snapshot, 0 when absent.
    pub fn row_count(&self, key: &SeriesKey) -> usize {
        match self.read_snapshot(key) {
            Ok(Some(bars)) => bars.len(),
            _ => 0,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

// =============================================================================
// Tests
// =============================================================================
