//! Flat CSV export with an evolving header.
//!
//! The header only ever grows. When a record carries a column the file has not seen, the
//! file is rewritten under the widened header (temp file + rename) and older rows get an
//! empty cell for it. Columns a record no longer reports stay in the header and are left empty.

use anyhow::Context;
use csv::{ReaderBuilder, WriterBuilder};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::{repair_torn_tail, RecordSink, SinkError, SinkKind, SinkOutcome};
use crate::domain::ComputedRecord;
use crate::error::PipelineError;

#[derive(Debug)]
pub struct CsvSink {
    path: PathBuf,
    header: Vec<String>,
    last_unix_ts: Option<i64>,
}

impl CsvSink {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let mut sink = Self {
            path,
            header: Vec::new(),
            last_unix_ts: None,
        };
        if sink.path.exists() {
            let removed = repair_torn_tail(&sink.path)
                .with_context(|| format!("Failed to repair {}", sink.path.display()))?;
            if removed > 0 {
                warn!(path = %sink.path.display(), bytes = removed, "dropped partial trailing CSV row");
            }
            sink.load_existing()
                .with_context(|| format!("Failed to read {}", sink.path.display()))?;
        }
        Ok(sink)
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    fn load_existing(&mut self) -> Result<(), SinkError> {
        let mut reader = ReaderBuilder::new().flexible(true).from_path(&self.path)?;
        self.header = reader.headers()?.iter().map(str::to_string).collect();
        let ts_col = self.header.iter().position(|h| h == "unix_ts");
        for row in reader.records() {
            let row = row?;
            let ts = ts_col
                .and_then(|i| row.get(i))
                .and_then(|v| v.parse::<i64>().ok());
            if let Some(ts) = ts {
                self.last_unix_ts = Some(self.last_unix_ts.map_or(ts, |last| last.max(ts)));
            }
        }
        Ok(())
    }

    /// Rewrite the file under `new_header`, padding existing rows with empty cells.
    fn widen(&mut self, new_header: Vec<String>) -> Result<(), SinkError> {
        let tmp = self.path.with_extension("csv.tmp");
        {
            let mut writer = WriterBuilder::new().from_path(&tmp)?;
            writer.write_record(&new_header)?;
            if !self.header.is_empty() {
                let mut reader = ReaderBuilder::new().flexible(true).from_path(&self.path)?;
                for row in reader.records() {
                    let row = row?;
                    let padded = (0..new_header.len()).map(|i| row.get(i).unwrap_or(""));
                    writer.write_record(padded)?;
                }
            }
            writer.flush()?;
            let file = writer
                .into_inner()
                .map_err(|e| SinkError::Io(e.into_error()))?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        self.header = new_header;
        Ok(())
    }
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl RecordSink for CsvSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Csv
    }

    fn append(&mut self, record: &ComputedRecord) -> Result<SinkOutcome, SinkError> {
        if self.last_unix_ts.is_some_and(|last| record.unix_ts <= last) {
            return Ok(SinkOutcome::Duplicate);
        }

        let map = record.to_json_map();
        let missing: Vec<String> = map
            .keys()
            .filter(|k| !self.header.contains(k))
            .cloned()
            .collect();

        if !missing.is_empty() || !self.path.exists() {
            if !self.header.is_empty() {
                PipelineError::SchemaDriftConflict {
                    sink: SinkKind::Csv,
                    columns: missing.clone(),
                }
                .log(record.unix_ts);
            }
            let mut widened = self.header.clone();
            widened.extend(missing);
            self.widen(widened)?;
        }

        let row: Vec<String> = self
            .header
            .iter()
            .map(|col| map.get(col).map(cell).unwrap_or_default())
            .collect();

        let file: File = OpenOptions::new().append(true).open(&self.path)?;
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
        writer.write_record(&row)?;
        writer.flush()?;
        if let Ok(file) = writer.into_inner() {
            file.sync_data()?;
        }

        self.last_unix_ts = Some(record.unix_ts);
        Ok(SinkOutcome::Written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::record::test_support::fully_populated;
    use crate::domain::{FieldValue, FIELD_NAMES};

    fn record_at(ts: i64) -> ComputedRecord {
        ComputedRecord {
            unix_ts: ts,
            ..fully_populated()
        }
    }

    fn rows(path: &Path) -> Vec<Vec<String>> {
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)
            .unwrap();
        reader
            .records()
            .map(|r| r.unwrap().iter().map(str::to_string).collect())
            .collect()
    }

    #[test]
    fn test_new_file_gets_header_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("records.csv");
        let mut sink = CsvSink::open(&path).unwrap();
        sink.append(&record_at(100)).unwrap();

        let all = rows(&path);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], FIELD_NAMES.iter().map(|s| s.to_string()).collect::<Vec<_>>());
        assert_eq!(all[1][1], "100");
    }

    #[test]
    fn test_header_widening_backfills_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.csv");
        std::fs::write(&path, "a,b,c\n1,2,3\n4,5,6\n").unwrap();

        let mut sink = CsvSink::open(&path).unwrap();
        let mut rec = record_at(100);
        rec.extra.insert("d".into(), FieldValue::Number(9.0));
        sink.append(&rec).unwrap();

        let all = rows(&path);
        assert_eq!(&all[0][..4], &["a", "b", "c", "timestamp"]);
        assert!(all[0].contains(&"d".to_string()));
        let width = all[0].len();
        assert_eq!(all[1].len(), width);
        assert_eq!(&all[1][..3], &["1", "2", "3"]);
        assert!(all[1][3..].iter().all(String::is_empty));
        assert_eq!(&all[2][..3], &["4", "5", "6"]);

        let d_col = all[0].iter().position(|h| h == "d").unwrap();
        assert_eq!(all[3][d_col], "9.0");
        assert_eq!(all[3][0], "");
    }

    #[test]
    fn test_reopen_skips_redelivered_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.csv");
        {
            let mut sink = CsvSink::open(&path).unwrap();
            sink.append(&record_at(100)).unwrap();
        }
        let mut sink = CsvSink::open(&path).unwrap();
        assert_eq!(sink.append(&record_at(100)).unwrap(), SinkOutcome::Duplicate);
        assert_eq!(sink.append(&record_at(200)).unwrap(), SinkOutcome::Written);
        assert_eq!(rows(&path).len(), 3);
    }

    #[test]
    fn test_torn_row_is_dropped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.csv");
        {
            let mut sink = CsvSink::open(&path).unwrap();
            sink.append(&record_at(100)).unwrap();
        }
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        std::io::Write::write_all(&mut f, b"2024-07-06T12:05:00Z,200,12").unwrap();
        drop(f);

        let mut sink = CsvSink::open(&path).unwrap();
        sink.append(&record_at(200)).unwrap();
        let all = rows(&path);
        assert_eq!(all.len(), 3);
        assert_eq!(all[2][1], "200");
        assert_eq!(all[2].len(), all[0].len());
    }

    #[test]
    fn test_dropped_field_written_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.csv");
        let mut sink = CsvSink::open(&path).unwrap();
        let mut first = record_at(100);
        first.extra.insert("pond_ph".into(), FieldValue::Number(7.0));
        sink.append(&first).unwrap();
        sink.append(&record_at(200)).unwrap();

        let all = rows(&path);
        let col = all[0].iter().position(|h| h == "pond_ph").unwrap();
        assert_eq!(all[1][col], "7.0");
        assert_eq!(all[2][col], "");
    }
}
