//! Rule-based pump and relay policy.
//!
//! A pure function of the record: no state is carried between calls, so the heuristic is
//! also the reference the model output is compared against.

use crate::config::{LoadsConfig, PumpConfig, SpeedBand};
use crate::domain::ComputedRecord;
use crate::features::LINE_MODE;

use super::{Decision, DecisionSource, LoadAction};

#[derive(Debug, Clone)]
pub struct PumpHeuristic {
    pump: PumpConfig,
    loads: LoadsConfig,
    /// Speed table sorted by temperature.
    table: Vec<SpeedBand>,
}

impl PumpHeuristic {
    pub fn new(pump: PumpConfig, loads: LoadsConfig) -> Self {
        let mut table = pump.speed_table.clone();
        table.sort_by(|a, b| a.temp_c.total_cmp(&b.temp_c));
        Self { pump, loads, table }
    }

    pub fn max_speed(&self) -> u8 {
        self.pump.max_speed
    }

    /// Lowest pump speed allowed at `water_temp`.
    pub fn min_speed_for(&self, water_temp: Option<f64>) -> u8 {
        let speed = match (water_temp, self.table.first(), self.table.last()) {
            (Some(t), Some(first), Some(last)) => {
                if t <= first.temp_c {
                    first.speed
                } else if t >= last.temp_c {
                    last.speed
                } else {
                    // Greatest key below the temperature.
                    let idx = self.table.partition_point(|b| b.temp_c <= t);
                    self.table[idx - 1].speed
                }
            }
            _ => self.pump.default_min_speed,
        };
        speed.min(self.pump.max_speed)
    }

    pub fn decide(&self, record: &ComputedRecord) -> Decision {
        let min = self.min_speed_for(record.water_temp);
        let max = self.pump.max_speed;
        let current = record.pump_speed.unwrap_or(min).clamp(min, max);
        let on_grid = record.working_mode.as_deref() == Some(LINE_MODE);

        let (pump_speed, load_action, reason) = if on_grid {
            (min, LoadAction::Disable, "on grid: pump to minimum, loads off".to_string())
        } else if let Some(vbat) = record.battery_voltage {
            let (speed, pump_reason) = if vbat > self.pump.max_volt {
                (current.saturating_add(self.pump.speed_step).min(max), "battery high: pump up")
            } else if vbat < self.pump.min_volt {
                (current.saturating_sub(self.pump.speed_step).max(min), "battery low: pump down")
            } else {
                (current, "battery in band: pump hold")
            };
            let load_action = if vbat >= self.loads.max_volt {
                LoadAction::Enable
            } else if vbat <= self.loads.min_volt {
                LoadAction::Disable
            } else {
                LoadAction::Hold
            };
            (speed, load_action, format!("{} at {:.2} V", pump_reason, vbat))
        } else {
            (current, LoadAction::Hold, "battery voltage unknown: hold".to_string())
        };

        Decision {
            unix_ts: record.unix_ts,
            pump_speed,
            load_action,
            source: DecisionSource::Heuristic,
            reason,
        }
    }
}
