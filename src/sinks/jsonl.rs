//! Line-delimited JSON export: one self-describing record per line.

use anyhow::Context;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::{repair_torn_tail, RecordSink, SinkError, SinkKind, SinkOutcome};
use crate::domain::ComputedRecord;

#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    last_unix_ts: Option<i64>,
}

impl JsonlSink {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let mut last_unix_ts = None;
        if path.exists() {
            let removed = repair_torn_tail(&path)
                .with_context(|| format!("Failed to repair {}", path.display()))?;
            if removed > 0 {
                warn!(path = %path.display(), bytes = removed, "dropped partial trailing JSONL line");
            }
            last_unix_ts = last_written_ts(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
        }
        Ok(Self { path, last_unix_ts })
    }
}

/// `unix_ts` of the last parseable line.
fn last_written_ts(path: &Path) -> std::io::Result<Option<i64>> {
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut last = None;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(&line) {
            Ok(doc) => {
                if let Some(ts) = doc.get("unix_ts").and_then(serde_json::Value::as_i64) {
                    last = Some(ts);
                }
            }
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable JSONL line"),
        }
    }
    Ok(last)
}

impl RecordSink for JsonlSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Jsonl
    }

    fn append(&mut self, record: &ComputedRecord) -> Result<SinkOutcome, SinkError> {
        if self.last_unix_ts.is_some_and(|last| record.unix_ts <= last) {
            return Ok(SinkOutcome::Duplicate);
        }

        let mut line = serde_json::to_string(&record.to_json_map())?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        // Single write so a crash leaves at most one torn line.
        file.write_all(line.as_bytes())?;
        file.sync_data()?;

        self.last_unix_ts = Some(record.unix_ts);
        Ok(SinkOutcome::Written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::record::test_support::fully_populated;

    fn record_at(ts: i64) -> ComputedRecord {
        ComputedRecord {
            unix_ts: ts,
            ..fully_populated()
        }
    }

    #[test]
    fn test_each_line_is_a_full_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        let mut sink = JsonlSink::open(&path).unwrap();
        sink.append(&record_at(100)).unwrap();
        sink.append(&record_at(200)).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let records: Vec<ComputedRecord> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records, vec![record_at(100), record_at(200)]);
    }

    #[test]
    fn test_restart_after_torn_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        {
            let mut sink = JsonlSink::open(&path).unwrap();
            sink.append(&record_at(100)).unwrap();
        }
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"timestamp\":\"2024").unwrap();
        drop(f);

        let mut sink = JsonlSink::open(&path).unwrap();
        assert_eq!(sink.append(&record_at(100)).unwrap(), SinkOutcome::Duplicate);
        assert_eq!(sink.append(&record_at(200)).unwrap(), SinkOutcome::Written);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().all(|l| serde_json::from_str::<serde_json::Value>(l).is_ok()));
    }
}
