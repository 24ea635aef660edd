//! Persistence of computed records to three independent sinks.
//!
//! Every record goes to the SQLite store (primary, restart-recovery source), the CSV export
//! and the JSONL export. The sinks run concurrently on the blocking pool, each behind its
//! own timeout; one failing sink never prevents the others from writing.

pub mod csv;
pub mod jsonl;
pub mod sqlite;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use thiserror::Error;
use tracing::debug;

use crate::config::SinksConfig;
use crate::domain::ComputedRecord;
use crate::error::PipelineError;

pub use self::csv::CsvSink;
pub use self::jsonl::JsonlSink;
pub use self::sqlite::SqliteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SinkKind {
    Sqlite,
    Csv,
    Jsonl,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] ::csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("schema drift could not be resolved: {0}")]
    SchemaDrift(String),
}

/// What a sink did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOutcome {
    Written,
    /// A record with this `unix_ts` is already stored.
    Duplicate,
}

/// One durable record representation.
pub trait RecordSink: Send {
    fn kind(&self) -> SinkKind;
    fn append(&mut self, record: &ComputedRecord) -> Result<SinkOutcome, SinkError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkStatus {
    Written,
    SkippedDuplicate,
    Disabled,
    Failed(String),
    TimedOut,
}

impl SinkStatus {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SinkStatus::Written | SinkStatus::SkippedDuplicate)
    }
}

/// Per-sink outcome of one [`MultiSinkWriter::write`].
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResult {
    pub unix_ts: i64,
    pub statuses: Vec<(SinkKind, SinkStatus)>,
}

impl WriteResult {
    pub fn status(&self, kind: SinkKind) -> Option<&SinkStatus> {
        self.statuses.iter().find(|(k, _)| *k == kind).map(|(_, s)| s)
    }

    /// True when the SQLite store holds this record.
    pub fn structured_accepted(&self) -> bool {
        self.status(SinkKind::Sqlite).is_some_and(SinkStatus::is_accepted)
    }

    /// Whether the record may become the next cycle's "previous record".
    ///
    /// With the structured store disabled there is no durable primary, so the in-memory record
    /// always advances.
    pub fn advances_previous(&self) -> bool {
        match self.status(SinkKind::Sqlite) {
            Some(SinkStatus::Disabled) | None => true,
            Some(status) => status.is_accepted(),
        }
    }

    pub fn failed_sinks(&self) -> Vec<SinkKind> {
        self.statuses
            .iter()
            .filter(|(_, s)| matches!(s, SinkStatus::Failed(_) | SinkStatus::TimedOut))
            .map(|(k, _)| *k)
            .collect()
    }
}

type SharedSink = Arc<Mutex<dyn RecordSink>>;

pub struct MultiSinkWriter {
    sqlite: Option<Arc<Mutex<SqliteStore>>>,
    slots: Vec<(SinkKind, Option<SharedSink>)>,
    timeout: Duration,
}

impl MultiSinkWriter {
    pub fn new(
        sqlite: Option<SqliteStore>,
        csv: Option<CsvSink>,
        jsonl: Option<JsonlSink>,
        timeout: Duration,
    ) -> Self {
        let sqlite = sqlite.map(|s| Arc::new(Mutex::new(s)));
        let slots = vec![
            (
                SinkKind::Sqlite,
                sqlite.clone().map(|s| s as SharedSink),
            ),
            (
                SinkKind::Csv,
                csv.map(|s| Arc::new(Mutex::new(s)) as SharedSink),
            ),
            (
                SinkKind::Jsonl,
                jsonl.map(|s| Arc::new(Mutex::new(s)) as SharedSink),
            ),
        ];
        Self {
            sqlite,
            slots,
            timeout,
        }
    }

    /// Open every enabled sink from configuration.
    pub fn open(cfg: &SinksConfig, timeout: Duration) -> anyhow::Result<Self> {
        let sqlite = if cfg.sqlite.enabled {
            Some(SqliteStore::open(&cfg.sqlite.path)?)
        } else {
            None
        };
        let csv = if cfg.csv.enabled {
            Some(CsvSink::open(&cfg.csv.path)?)
        } else {
            None
        };
        let jsonl = if cfg.jsonl.enabled {
            Some(JsonlSink::open(&cfg.jsonl.path)?)
        } else {
            None
        };
        Ok(Self::new(sqlite, csv, jsonl, timeout))
    }

    /// Handle to the structured store, used for recovery and queries.
    pub fn store(&self) -> Option<Arc<Mutex<SqliteStore>>> {
        self.sqlite.clone()
    }

    /// Persist `record` to every enabled sink, concurrently, and wait for all of them.
    pub async fn write(&self, record: &ComputedRecord) -> WriteResult {
        let record = Arc::new(record.clone());
        let writes = self.slots.iter().map(|(kind, sink)| {
            let kind = *kind;
            let sink = sink.clone();
            let record = Arc::clone(&record);
            let timeout = self.timeout;
            async move { (kind, write_one(kind, sink, record, timeout).await) }
        });
        let statuses = join_all(writes).await;

        for (kind, status) in &statuses {
            let message = match status {
                SinkStatus::Failed(msg) => msg.clone(),
                SinkStatus::TimedOut => format!("timed out after {:?}", self.timeout),
                _ => continue,
            };
            PipelineError::SinkWriteFailure {
                sink: *kind,
                message,
            }
            .log(record.unix_ts);
        }

        WriteResult {
            unix_ts: record.unix_ts,
            statuses,
        }
    }
}

/// Cut a trailing partial line left by a crash mid-write. Returns the number of bytes removed.
pub(crate) fn repair_torn_tail(path: &std::path::Path) -> std::io::Result<u64> {
    use std::io::{Read, Seek, SeekFrom};

    const CHUNK: u64 = 4096;

    let mut file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(0);
    }

    let mut end = len;
    let mut buf = vec![0u8; CHUNK as usize];
    let keep = loop {
        let start = end.saturating_sub(CHUNK);
        let n = (end - start) as usize;
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut buf[..n])?;
        if let Some(pos) = buf[..n].iter().rposition(|b| *b == b'\n') {
            break start + pos as u64 + 1;
        }
        if start == 0 {
            break 0;
        }
        end = start;
    };

    if keep < len {
        file.set_len(keep)?;
        file.sync_all()?;
    }
    Ok(len - keep)
}

async fn write_one(
    kind: SinkKind,
    sink: Option<SharedSink>,
    record: Arc<ComputedRecord>,
    timeout: Duration,
) -> SinkStatus {
    let Some(sink) = sink else {
        return SinkStatus::Disabled;
    };
    let task = tokio::task::spawn_blocking(move || sink.lock().append(&record));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(Ok(SinkOutcome::Written))) => {
            debug!(sink = %kind, "record written");
            SinkStatus::Written
        }
        Ok(Ok(Ok(SinkOutcome::Duplicate))) => {
            debug!(sink = %kind, "record already present, skipped");
            SinkStatus::SkippedDuplicate
        }
        Ok(Ok(Err(e))) => SinkStatus::Failed(e.to_string()),
        Ok(Err(join_err)) => SinkStatus::Failed(format!("sink task panicked: {}", join_err)),
        // The blocking append keeps running and may still commit; the collector re-reads the
        // store before the next cycle.
        Err(_) => SinkStatus::TimedOut,
    }
}
