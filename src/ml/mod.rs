//! Model plumbing for the hybrid controller.
//!
//! Models are trained offline and shipped as JSON files. At runtime a model is loaded once,
//! its feature names are checked against what a [`ComputedRecord`] can provide, and
//! [`ModelHandle::predict`] maps the latest record to a pump-speed prediction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::domain::{ComputedRecord, FIELD_NAMES};

pub mod models;

pub use models::{LinearRegressionModel, MLModel};

/// Model files written with a different version are rejected.
pub const MODEL_FORMAT_VERSION: u32 = 1;

/// Prefix of one-hot working-mode features, e.g. `mode_LINE MODE`.
pub const MODE_FEATURE_PREFIX: &str = "mode_";

/// Record fields that carry text and cannot be fed to a numeric model directly.
const NON_NUMERIC_FIELDS: &[&str] = &[
    "timestamp",
    "season",
    "working_mode",
    "mains_status",
    "weather_description",
    "water_temp_trend",
    "fc_source",
];

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model file not found: {0}")]
    NotFound(PathBuf),
    #[error("incompatible model: {0}")]
    Incompatible(String),
    #[error("feature '{0}' is missing from the record")]
    MissingFeature(String),
    #[error("prediction failed: {0}")]
    Prediction(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    LinearRegression,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelMetadata {
    pub model_id: String,
    pub model_type: ModelType,
    pub version: String,
    pub trained_at: DateTime<Utc>,
    pub training_samples: usize,
    #[serde(default)]
    pub validation_metrics: Option<ValidationMetrics>,
    pub feature_names: Vec<String>,
    /// Record field the model was trained to predict
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationMetrics {
    pub mae: f64,  // Mean Absolute Error
    pub rmse: f64, // Root Mean Square Error
    pub r2: f64,   // R-squared
}

/// Feature Vector for ML models
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureVector {
    pub features: Vec<f64>,
    pub feature_names: Vec<String>,
}

impl FeatureVector {
    pub fn new(features: Vec<f64>, feature_names: Vec<String>) -> Result<Self, ModelError> {
        if features.len() != feature_names.len() {
            return Err(ModelError::Prediction(format!(
                "Feature count mismatch: {} features, {} names",
                features.len(),
                feature_names.len()
            )));
        }
        Ok(Self {
            features,
            feature_names,
        })
    }

    /// Pull `names` out of `record`. Every feature must resolve to a number.
    pub fn from_record(record: &ComputedRecord, names: &[String]) -> Result<Self, ModelError> {
        let map = record.to_json_map();
        let features = names
            .iter()
            .map(|name| {
                resolve_feature(record, &map, name)
                    .ok_or_else(|| ModelError::MissingFeature(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(features, names.to_vec())
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

fn resolve_feature(
    record: &ComputedRecord,
    map: &serde_json::Map<String, serde_json::Value>,
    name: &str,
) -> Option<f64> {
    if let Some(mode) = name.strip_prefix(MODE_FEATURE_PREFIX) {
        let current = record.working_mode.as_deref()?;
        return Some(if current == mode { 1.0 } else { 0.0 });
    }
    match map.get(name)? {
        serde_json::Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        serde_json::Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Whether a feature name can ever be produced from a record.
pub fn is_known_feature(name: &str) -> bool {
    if let Some(mode) = name.strip_prefix(MODE_FEATURE_PREFIX) {
        return !mode.is_empty();
    }
    FIELD_NAMES.contains(&name) && !NON_NUMERIC_FIELDS.contains(&name)
}

/// ML Prediction Result
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Prediction {
    pub value: f64,
}

impl Prediction {
    pub fn new(value: f64) -> Self {
        Self { value }
    }
}

/// On-disk model envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelFile {
    pub format_version: u32,
    pub model: LinearRegressionModel,
}

/// A loaded, validated model.
#[derive(Clone)]
pub struct ModelHandle {
    model: Arc<dyn MLModel>,
    path: PathBuf,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("model_id", &self.metadata().model_id)
            .field("path", &self.path)
            .finish()
    }
}

impl ModelHandle {
    pub fn new(model: Arc<dyn MLModel>, path: impl Into<PathBuf>) -> Self {
        Self {
            model,
            path: path.into(),
        }
    }

    pub fn metadata(&self) -> &ModelMetadata {
        self.model.metadata()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whole days between training and `now_ts`.
    pub fn age_days(&self, now_ts: i64) -> i64 {
        (now_ts - self.metadata().trained_at.timestamp()).div_euclid(86_400)
    }

    pub fn predict(&self, record: &ComputedRecord) -> Result<Prediction, ModelError> {
        let features = FeatureVector::from_record(record, &self.metadata().feature_names)?;
        let prediction = self.model.predict(&features)?;
        if !prediction.value.is_finite() {
            return Err(ModelError::Prediction("prediction is not finite".into()));
        }
        Ok(prediction)
    }
}

/// Load and validate a model file.
pub fn load_model(path: impl AsRef<Path>) -> Result<ModelHandle, ModelError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ModelError::NotFound(path.to_path_buf()),
        _ => ModelError::Incompatible(format!("{}: {}", path.display(), e)),
    })?;

    let file: ModelFile = serde_json::from_str(&text)
        .map_err(|e| ModelError::Incompatible(format!("{}: {}", path.display(), e)))?;
    if file.format_version != MODEL_FORMAT_VERSION {
        return Err(ModelError::Incompatible(format!(
            "format_version {} (expected {})",
            file.format_version, MODEL_FORMAT_VERSION
        )));
    }

    let meta = &file.model.metadata;
    if meta.feature_names.len() != file.model.coefficients.len() {
        return Err(ModelError::Incompatible(format!(
            "{} feature names but {} coefficients",
            meta.feature_names.len(),
            file.model.coefficients.len()
        )));
    }
    let unknown: Vec<&str> = meta
        .feature_names
        .iter()
        .map(String::as_str)
        .filter(|name| !is_known_feature(name))
        .collect();
    if !unknown.is_empty() {
        return Err(ModelError::Incompatible(format!(
            "unknown features {:?}",
            unknown
        )));
    }

    info!(
        model_id = %meta.model_id,
        version = %meta.version,
        features = meta.feature_names.len(),
        path = %path.display(),
        "model loaded"
    );
    Ok(ModelHandle::new(Arc::new(file.model), path))
}
