//! Decision layer: pump speed and relay loads from the latest record.
//!
//! [`HybridController`] selects between the rule-based [`PumpHeuristic`] and a trained model
//! according to [`ControllerMode`]. The heuristic is always available; the model is only used
//! when it is loaded, fresh, and the record is complete enough to feed it.

pub mod heuristic;
pub mod safety;

use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{ControllerConfig, LoadsConfig, PumpConfig};
use crate::domain::ComputedRecord;
use crate::ml::{ModelError, ModelHandle};

pub use heuristic::PumpHeuristic;
pub use safety::{SafetyEnvelope, SafetyEvent};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ControllerMode {
    HeuristicOnly,
    MlOnly,
    #[default]
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LoadAction {
    Enable,
    Disable,
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DecisionSource {
    Heuristic,
    Model,
}

/// Output handed to whatever actuates the pump and relays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub unix_ts: i64,
    /// Percent of full speed.
    pub pump_speed: u8,
    pub load_action: LoadAction,
    pub source: DecisionSource,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("record cannot be fed to the model: {0}")]
    InputsOutOfDomain(String),
}

pub struct HybridController {
    mode: ControllerMode,
    min_completeness: f64,
    max_model_age_days: Option<i64>,
    heuristic: PumpHeuristic,
    envelope: SafetyEnvelope,
}

impl HybridController {
    /// Build the controller. In `ml_only` mode a missing or incompatible model is an error here,
    /// at startup, rather than a silent fallback later.
    pub fn new(
        cfg: &ControllerConfig,
        pump: PumpConfig,
        loads: LoadsConfig,
        model: Option<&ModelHandle>,
    ) -> Result<Self, ControllerError> {
        if cfg.mode == ControllerMode::MlOnly && model.is_none() {
            return Err(ControllerError::ModelUnavailable(match &cfg.model_path {
                Some(path) => format!("no usable model at {}", path.display()),
                None => "ml_only mode requires controller.model_path".to_string(),
            }));
        }

        info!(
            mode = %cfg.mode,
            min_completeness = cfg.min_completeness,
            model = model.map(|m| m.metadata().model_id.as_str()).unwrap_or("none"),
            "controller ready"
        );

        Ok(Self {
            mode: cfg.mode,
            min_completeness: cfg.min_completeness,
            max_model_age_days: cfg.max_model_age_days,
            heuristic: PumpHeuristic::new(pump, loads),
            envelope: SafetyEnvelope::new(),
        })
    }

    pub fn mode(&self) -> ControllerMode {
        self.mode
    }

    pub fn heuristic(&self) -> &PumpHeuristic {
        &self.heuristic
    }

    pub fn envelope(&self) -> &SafetyEnvelope {
        &self.envelope
    }

    /// Decide for `record`.
    ///
    /// `heuristic_only` and `hybrid` never fail. `ml_only` fails with
    /// [`ControllerError::ModelUnavailable`] if the model is gone or stale, and with
    /// [`ControllerError::InputsOutOfDomain`] if this record cannot be scored.
    pub fn decide(
        &self,
        record: &ComputedRecord,
        model: Option<&ModelHandle>,
    ) -> Result<Decision, ControllerError> {
        let decision = match self.mode {
            ControllerMode::HeuristicOnly => self.heuristic.decide(record),
            ControllerMode::MlOnly => {
                let model = model.ok_or_else(|| {
                    ControllerError::ModelUnavailable("model handle missing".to_string())
                })?;
                self.model_decision(record, model)?
            }
            ControllerMode::Hybrid => match model {
                None => self.heuristic.decide(record),
                Some(model) => match self.model_decision(record, model) {
                    Ok(decision) => decision,
                    Err(e) => {
                        debug!(unix_ts = record.unix_ts, reason = %e, "falling back to heuristic");
                        self.heuristic.decide(record)
                    }
                },
            },
        };

        info!(
            target: "decisions",
            unix_ts = decision.unix_ts,
            mode = %self.mode,
            source = %decision.source,
            pump_speed = decision.pump_speed,
            load_action = %decision.load_action,
            reason = %decision.reason,
            "decision"
        );
        Ok(decision)
    }

    fn model_decision(
        &self,
        record: &ComputedRecord,
        model: &ModelHandle,
    ) -> Result<Decision, ControllerError> {
        if let Some(max_age) = self.max_model_age_days {
            let age = model.age_days(record.unix_ts);
            if age > max_age {
                return Err(ControllerError::ModelUnavailable(format!(
                    "model {} is {} days old (max {})",
                    model.metadata().model_id,
                    age,
                    max_age
                )));
            }
        }

        let completeness = record.completeness_score;
        if completeness < self.min_completeness {
            return Err(ControllerError::InputsOutOfDomain(format!(
                "completeness {:.3} below {:.3}",
                completeness, self.min_completeness
            )));
        }

        let prediction = model.predict(record).map_err(|e| match e {
            ModelError::NotFound(_) | ModelError::Incompatible(_) => {
                ControllerError::ModelUnavailable(e.to_string())
            }
            ModelError::MissingFeature(_) | ModelError::Prediction(_) => {
                ControllerError::InputsOutOfDomain(e.to_string())
            }
        })?;

        let min = self.heuristic.min_speed_for(record.water_temp);
        let max = self.heuristic.max_speed();
        let pump_speed = self
            .envelope
            .clamp_pump_speed(record.unix_ts, prediction.value, min, max)
            .ok_or_else(|| {
                ControllerError::InputsOutOfDomain("prediction is not finite".to_string())
            })?;

        // Relays stay rule-based; the model only proposes a pump speed.
        let loads = self.heuristic.decide(record).load_action;

        Ok(Decision {
            unix_ts: record.unix_ts,
            pump_speed,
            load_action: loads,
            source: DecisionSource::Model,
            reason: format!(
                "model {} predicted {:.2}",
                model.metadata().model_id,
                prediction.value
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpeedBand;
    use crate::domain::record::test_support::fully_populated;
    use crate::ml::tests::pump_model;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn controller_config(mode: ControllerMode) -> ControllerConfig {
        ControllerConfig {
            mode,
            min_completeness: 0.8,
            model_path: None,
            max_model_age_days: Some(30),
        }
    }

    fn pump() -> PumpConfig {
        PumpConfig {
            default_min_speed: 20,
            max_speed: 90,
            speed_step: 10,
            min_volt: 25.0,
            max_volt: 27.0,
            speed_table: vec![
                SpeedBand { temp_c: 10.0, speed: 20 },
                SpeedBand { temp_c: 18.0, speed: 40 },
            ],
        }
    }

    fn loads() -> LoadsConfig {
        LoadsConfig {
            min_volt: 24.5,
            max_volt: 27.5,
        }
    }

    fn fresh_model() -> ModelHandle {
        let trained = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        ModelHandle::new(Arc::new(pump_model(trained)), "pump.json")
    }

    fn controller(mode: ControllerMode, model: Option<&ModelHandle>) -> HybridController {
        HybridController::new(&controller_config(mode), pump(), loads(), model).unwrap()
    }

    #[test]
    fn test_hybrid_without_model_returns_heuristic() {
        let c = controller(ControllerMode::Hybrid, None);
        let record = fully_populated();
        let decision = c.decide(&record, None).unwrap();
        assert_eq!(decision, c.heuristic().decide(&record));
    }

    #[test]
    fn test_hybrid_uses_model_when_complete() {
        let model = fresh_model();
        let c = controller(ControllerMode::Hybrid, Some(&model));
        let decision = c.decide(&fully_populated(), Some(&model)).unwrap();
        assert_eq!(decision.source, DecisionSource::Model);
        assert_eq!(decision.pump_speed, 54);
    }

    #[test]
    fn test_hybrid_falls_back_on_low_completeness() {
        let model = fresh_model();
        let c = controller(ControllerMode::Hybrid, Some(&model));
        let mut record = fully_populated();
        record.completeness_score = 0.5;
        let decision = c.decide(&record, Some(&model)).unwrap();
        assert_eq!(decision.source, DecisionSource::Heuristic);
    }

    #[test]
    fn test_hybrid_falls_back_on_missing_feature() {
        let model = fresh_model();
        let c = controller(ControllerMode::Hybrid, Some(&model));
        let mut record = fully_populated();
        record.water_temp = None;
        let decision = c.decide(&record, Some(&model)).unwrap();
        assert_eq!(decision.source, DecisionSource::Heuristic);
    }

    #[test]
    fn test_hybrid_falls_back_on_stale_model() {
        let trained = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let model = ModelHandle::new(Arc::new(pump_model(trained)), "old.json");
        let c = controller(ControllerMode::Hybrid, Some(&model));
        let decision = c.decide(&fully_populated(), Some(&model)).unwrap();
        assert_eq!(decision.source, DecisionSource::Heuristic);
    }

    #[test]
    fn test_model_output_is_clamped() {
        let model = fresh_model();
        let c = controller(ControllerMode::Hybrid, Some(&model));
        let mut record = fully_populated();
        // 2 * 60 + 10 + 5 = 135, above max_speed
        record.water_temp = Some(60.0);
        let decision = c.decide(&record, Some(&model)).unwrap();
        assert_eq!(decision.source, DecisionSource::Model);
        assert_eq!(decision.pump_speed, 90);
        assert_eq!(c.envelope().recent_events(10).len(), 1);
    }

    #[test]
    fn test_ml_only_without_model_fails_at_startup() {
        let result =
            HybridController::new(&controller_config(ControllerMode::MlOnly), pump(), loads(), None);
        assert!(matches!(result, Err(ControllerError::ModelUnavailable(_))));
    }

    #[test]
    fn test_ml_only_out_of_domain_is_an_error() {
        let model = fresh_model();
        let c = controller(ControllerMode::MlOnly, Some(&model));
        let mut record = fully_populated();
        record.completeness_score = 0.1;
        assert!(matches!(
            c.decide(&record, Some(&model)),
            Err(ControllerError::InputsOutOfDomain(_))
        ));
    }

    #[test]
    fn test_heuristic_only_ignores_model() {
        let model = fresh_model();
        let c = controller(ControllerMode::HeuristicOnly, Some(&model));
        let decision = c.decide(&fully_populated(), Some(&model)).unwrap();
        assert_eq!(decision.source, DecisionSource::Heuristic);
    }

    #[test]
    fn test_mode_parses_snake_case() {
        let mode: ControllerMode = serde_json::from_str("\"ml_only\"").unwrap();
        assert_eq!(mode, ControllerMode::MlOnly);
        assert_eq!(ControllerMode::HeuristicOnly.to_string(), "heuristic_only");
    }
}
