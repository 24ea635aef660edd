//! Structured record store.
//!
//! One row per `unix_ts`: the lossless `data_json` document plus one typed column per record
//! field. Columns are added with `ALTER TABLE` the first time a field carries a value, so new
//! sensors show up as queryable columns without a migration.

use anyhow::{bail, Context};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

use super::{RecordSink, SinkError, SinkKind, SinkOutcome};
use crate::domain::{ComputedRecord, FIELD_NAMES};

const SCHEMA_VERSION: i32 = 1;

/// Columns owned by the base schema.
const BASE_COLUMNS: [&str; 4] = ["unix_ts", "timestamp", "completeness_score", "data_json"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub total_records: i64,
    pub first_unix_ts: Option<i64>,
    pub last_unix_ts: Option<i64>,
    pub typed_columns: usize,
}

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    columns: HashSet<String>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // Committed rows must survive a crash mid-cycle.
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .context("failed to enable WAL journal")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("failed to set synchronous mode")?;
        debug!(journal_mode = %mode, path = %path.display(), "opened record store");

        migrate(&mut conn)?;
        let columns = table_columns(&conn).context("failed to read records schema")?;

        Ok(Self { conn, columns })
    }

    /// Most recent record by `unix_ts`, used to rehydrate the collector after a restart.
    pub fn latest(&self) -> Result<Option<ComputedRecord>, SinkError> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT data_json FROM records ORDER BY unix_ts DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| decode_record(&j)).transpose()
    }

    pub fn last_unix_ts(&self) -> Result<Option<i64>, SinkError> {
        let ts: Option<i64> = self
            .conn
            .query_row("SELECT MAX(unix_ts) FROM records", [], |row| row.get(0))?;
        Ok(ts)
    }

    /// Records with `from <= unix_ts <= to`, oldest first.
    pub fn range(&self, from: i64, to: i64) -> Result<Vec<ComputedRecord>, SinkError> {
        let mut stmt = self.conn.prepare(
            "SELECT data_json FROM records WHERE unix_ts BETWEEN ?1 AND ?2 ORDER BY unix_ts",
        )?;
        let rows = stmt.query_map(params![from, to], |row| row.get::<_, String>(0))?;
        let mut records = Vec::new();
        for json in rows {
            records.push(decode_record(&json?)?);
        }
        Ok(records)
    }

    pub fn stats(&self) -> Result<StoreStats, SinkError> {
        let (total_records, first_unix_ts, last_unix_ts) = self.conn.query_row(
            "SELECT COUNT(*), MIN(unix_ts), MAX(unix_ts) FROM records",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(StoreStats {
            total_records,
            first_unix_ts,
            last_unix_ts,
            typed_columns: self.columns.len().saturating_sub(BASE_COLUMNS.len()),
        })
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains(&name.to_ascii_lowercase())
    }
}

impl RecordSink for SqliteStore {
    fn kind(&self) -> SinkKind {
        SinkKind::Sqlite
    }

    fn append(&mut self, record: &ComputedRecord) -> Result<SinkOutcome, SinkError> {
        let map = record.to_json_map();
        let data_json = serde_json::to_string(&map)?;

        let tx = self.conn.transaction()?;

        // SQLite column names are case-insensitive; `columns` holds them lowercased.
        let mut added = Vec::new();
        for (key, value) in &map {
            let folded = key.to_ascii_lowercase();
            if self.columns.contains(&folded) || added.contains(&folded) || !is_safe_identifier(key)
            {
                continue;
            }
            let Some(sql_type) = column_type(value) else {
                continue;
            };
            tx.execute(
                &format!("ALTER TABLE records ADD COLUMN \"{}\" {}", key, sql_type),
                [],
            )?;
            added.push(folded);
        }

        let mut names: Vec<&str> = vec!["unix_ts", "timestamp", "completeness_score", "data_json"];
        let mut values: Vec<SqlValue> = vec![
            SqlValue::Integer(record.unix_ts),
            SqlValue::Text(record.timestamp.clone()),
            SqlValue::Real(record.completeness_score),
            SqlValue::Text(data_json),
        ];
        let mut bound: HashSet<String> = BASE_COLUMNS.iter().map(|c| c.to_string()).collect();
        for (key, value) in &map {
            let folded = key.to_ascii_lowercase();
            if bound.contains(&folded) || !is_safe_identifier(key) {
                continue;
            }
            // Keys differing only by case share one column; the first one fills it.
            if self.columns.contains(&folded) || added.contains(&folded) {
                names.push(key.as_str());
                values.push(to_sql(value));
                bound.insert(folded);
            }
        }

        let column_list = names
            .iter()
            .map(|n| format!("\"{}\"", n))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=names.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let inserted = tx.execute(
            &format!(
                "INSERT INTO records ({}) VALUES ({}) ON CONFLICT(unix_ts) DO NOTHING",
                column_list, placeholders
            ),
            params_from_iter(values),
        )?;
        tx.commit()?;

        if !added.is_empty() {
            info!(columns = ?added, "record store widened");
        }
        self.columns.extend(added);

        Ok(if inserted == 0 {
            SinkOutcome::Duplicate
        } else {
            SinkOutcome::Written
        })
    }
}

fn migrate(conn: &mut Connection) -> anyhow::Result<()> {
    let version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read user_version pragma")?;
    if version > SCHEMA_VERSION {
        bail!(
            "record store version ({}) is newer than supported schema ({})",
            version,
            SCHEMA_VERSION
        );
    }
    if version == SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction().context("failed to open migration transaction")?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS records (
            unix_ts            INTEGER PRIMARY KEY,
            timestamp          TEXT NOT NULL,
            completeness_score REAL NOT NULL,
            data_json          TEXT NOT NULL
        );",
    )
    .context("failed to initialize records schema")?;
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)
        .context("failed to update user_version pragma")?;
    tx.commit().context("failed to commit migrations")?;
    Ok(())
}

fn table_columns(conn: &Connection) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('records')")?;
    let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
    names.map(|n| n.map(|n| n.to_ascii_lowercase())).collect()
}

/// Decode a stored document. Rows whose open `extra` fields no longer decode are recovered
/// with the typed fields only.
fn decode_record(json: &str) -> Result<ComputedRecord, SinkError> {
    let doc: serde_json::Map<String, Value> = serde_json::from_str(json)?;
    match ComputedRecord::deserialize(Value::Object(doc.clone())) {
        Ok(record) => Ok(record),
        Err(e) => {
            let (typed, dropped): (serde_json::Map<_, _>, serde_json::Map<_, _>) = doc
                .into_iter()
                .partition(|(k, _)| FIELD_NAMES.contains(&k.as_str()));
            warn!(
                error = %e,
                dropped = ?dropped.keys().collect::<Vec<_>>(),
                "stored record has undecodable extra fields, dropping them"
            );
            Ok(ComputedRecord::deserialize(Value::Object(typed))?)
        }
    }
}

fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

/// Column affinity for a first observed value; nulls say nothing about the type.
fn column_type(value: &Value) -> Option<&'static str> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some("INTEGER"),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some("INTEGER"),
        Value::Number(_) => Some("REAL"),
        Value::String(_) => Some("TEXT"),
        Value::Array(_) | Value::Object(_) => Some("TEXT"),
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map_or(SqlValue::Null, SqlValue::Real),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}
