//! ML Model Definitions

use super::{FeatureVector, ModelError, ModelMetadata, ModelType, Prediction};
use serde::{Deserialize, Serialize};

/// Trait for ML models
pub trait MLModel: Send + Sync {
    /// Predict a value from features
    fn predict(&self, features: &FeatureVector) -> Result<Prediction, ModelError>;

    /// Get model metadata
    fn metadata(&self) -> &ModelMetadata;

    /// Get model type
    fn model_type(&self) -> ModelType {
        self.metadata().model_type
    }
}

/// Simple Linear Regression Model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearRegressionModel {
    pub metadata: ModelMetadata,
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

impl LinearRegressionModel {
    pub fn new(coefficients: Vec<f64>, intercept: f64, metadata: ModelMetadata) -> Self {
        Self {
            metadata,
            coefficients,
            intercept,
        }
    }
}

impl MLModel for LinearRegressionModel {
    fn predict(&self, features: &FeatureVector) -> Result<Prediction, ModelError> {
        if features.len() != self.coefficients.len() {
            return Err(ModelError::Prediction(format!(
                "Feature count mismatch: expected {}, got {}",
                self.coefficients.len(),
                features.len()
            )));
        }

        let prediction: f64 = features
            .features
            .iter()
            .zip(self.coefficients.iter())
            .map(|(f, c)| f * c)
            .sum::<f64>()
            + self.intercept;

        Ok(Prediction::new(prediction))
    }

    fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }
}
