//! Recoverable and fatal failures of a collection cycle.

use thiserror::Error;
use tracing::Level;

use crate::domain::SourceKind;
use crate::sinks::SinkKind;

/// Pipeline error taxonomy.
///
/// Everything except [`PipelineError::ModelUnavailable`] under `ml_only` mode is recovered
/// inside a single cycle; see [`PipelineError::is_loop_fatal`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{source_kind} unavailable: {message}")]
    SourceUnavailable { source_kind: SourceKind, message: String },

    #[error("{source_kind} returned a malformed response: {message}")]
    SourceProtocolError { source_kind: SourceKind, message: String },

    #[error("{sink} write failed: {message}")]
    SinkWriteFailure { sink: SinkKind, message: String },

    #[error("{sink} header is missing columns {columns:?}")]
    SchemaDriftConflict { sink: SinkKind, columns: Vec<String> },

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("snapshot timestamp {snapshot_ts} is not newer than last persisted {last_persisted_ts}")]
    ClockAnomaly { snapshot_ts: i64, last_persisted_ts: i64 },
}

impl PipelineError {
    /// Log level used when the error is recovered.
    pub fn severity(&self) -> Level {
        match self {
            PipelineError::SourceUnavailable { .. } | PipelineError::ClockAnomaly { .. } => {
                Level::WARN
            }
            PipelineError::SourceProtocolError { .. }
            | PipelineError::SinkWriteFailure { .. }
            | PipelineError::ModelUnavailable(_) => Level::ERROR,
            PipelineError::SchemaDriftConflict { .. } => Level::INFO,
        }
    }

    /// Short machine-friendly error kind for structured logs.
    pub fn error_type(&self) -> &'static str {
        match self {
            PipelineError::SourceUnavailable { .. } => "SourceUnavailable",
            PipelineError::SourceProtocolError { .. } => "SourceProtocolError",
            PipelineError::SinkWriteFailure { .. } => "SinkWriteFailure",
            PipelineError::SchemaDriftConflict { .. } => "SchemaDriftConflict",
            PipelineError::ModelUnavailable(_) => "ModelUnavailable",
            PipelineError::ClockAnomaly { .. } => "ClockAnomaly",
        }
    }

    /// Only a missing model under `ml_only` stops the loop; cancellation is handled separately.
    pub fn is_loop_fatal(&self, ml_only: bool) -> bool {
        matches!(self, PipelineError::ModelUnavailable(_)) && ml_only
    }

    /// Emit this error through `tracing` at its own severity.
    pub fn log(&self, unix_ts: i64) {
        let kind = self.error_type();
        let level = self.severity();
        if level == Level::ERROR {
            tracing::error!(error_type = kind, unix_ts, error = %self, "recovered pipeline error");
        } else if level == Level::WARN {
            tracing::warn!(error_type = kind, unix_ts, error = %self, "recovered pipeline error");
        } else {
            tracing::info!(error_type = kind, unix_ts, error = %self, "recovered pipeline error");
        }
    }
}
