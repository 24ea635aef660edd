//! Sample sources: the inverter, the weather feed and the pond devices.
//!
//! Each source is polled once per cycle behind a timeout. Failures never leave the cycle;
//! they are converted into [`PipelineError`]s, logged, and the snapshot becomes `None`.

pub mod openweather;
#[cfg(feature = "sim")]
pub mod sim;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::domain::{Forecast, RawSnapshot, SourceKind};
use crate::error::PipelineError;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl SourceError {
    /// Map onto the pipeline taxonomy; timeouts and connection failures are both "unavailable".
    pub fn into_pipeline(self, source_kind: SourceKind) -> PipelineError {
        match self {
            SourceError::Protocol(message) => PipelineError::SourceProtocolError {
                source_kind,
                message,
            },
            other => PipelineError::SourceUnavailable {
                source_kind,
                message: other.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SourceError::Protocol(err.to_string())
        } else {
            SourceError::Unavailable(err.to_string())
        }
    }
}

/// Inverter driver; one register dump per poll.
#[async_trait]
pub trait InverterSource: Send + Sync {
    async fn poll(&self) -> Result<RawSnapshot, SourceError>;
}

/// Weather feed. Current conditions and the hourly forecast may fail independently.
#[async_trait]
pub trait WeatherSource: Send + Sync {
    async fn current(&self) -> Result<RawSnapshot, SourceError>;
    async fn forecast(&self) -> Result<Forecast, SourceError>;
}

/// Pond pump, relays and thermometers.
#[async_trait]
pub trait DeviceSource: Send + Sync {
    async fn status(&self) -> Result<RawSnapshot, SourceError>;
}

/// The set of sources the collection loop samples each cycle.
#[derive(Clone)]
pub struct Sources {
    pub inverter: Arc<dyn InverterSource>,
    pub weather: Arc<dyn WeatherSource>,
    pub devices: Arc<dyn DeviceSource>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_maps_to_unavailable() {
        let err = SourceError::Timeout(std::time::Duration::from_secs(5))
            .into_pipeline(SourceKind::Weather);
        assert_eq!(err.error_type(), "SourceUnavailable");
        assert!(err.to_string().contains("weather"));
    }

    #[test]
    fn test_protocol_maps_to_protocol_error() {
        let err = SourceError::Protocol("bad json".into()).into_pipeline(SourceKind::Inverter);
        assert_eq!(err.error_type(), "SourceProtocolError");
    }
}
