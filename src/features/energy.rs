//! Trapezoidal energy integration between consecutive records.
//!
//! Sign conventions follow the power-flow snapshot: battery power is positive while
//! charging and negative while discharging; PV, load and grid import are non-negative.

use serde::{Deserialize, Serialize};

use crate::domain::ComputedRecord;

/// Instantaneous power per channel (W).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PowerSample {
    pub pv_w: Option<f64>,
    pub load_w: Option<f64>,
    pub grid_w: Option<f64>,
    pub battery_w: Option<f64>,
}

impl PowerSample {
    pub fn of(record: &ComputedRecord) -> Self {
        Self {
            pv_w: record.pv_total_power,
            load_w: record.output_power,
            grid_w: record.grid_power,
            battery_w: record.battery_power,
        }
    }
}

/// Energy moved since the previous record (Wh). `None` means "not integrable", never zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyDeltas {
    pub from_pv_wh: Option<f64>,
    pub from_grid_wh: Option<f64>,
    pub to_load_wh: Option<f64>,
    pub to_battery_wh: Option<f64>,
    pub from_battery_wh: Option<f64>,
}

impl EnergyDeltas {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Average of two readings, or `None` if either side is missing.
fn average(prev_w: Option<f64>, curr_w: Option<f64>) -> Option<f64> {
    Some((prev_w? + curr_w?) / 2.0)
}

/// Integrate every channel between `prev` at `prev_ts` and `curr` at `now_ts`.
///
/// Gaps that are non-positive or longer than `max_gap_secs` are not integrated at all.
pub fn integrate(
    prev: &PowerSample,
    prev_ts: i64,
    curr: &PowerSample,
    now_ts: i64,
    max_gap_secs: i64,
) -> EnergyDeltas {
    let dt = now_ts - prev_ts;
    if dt <= 0 || dt > max_gap_secs {
        return EnergyDeltas::default();
    }
    let dt_hours = dt as f64 / 3600.0;

    // Directional channels cannot run backwards.
    let directional = |p: Option<f64>, c: Option<f64>| average(p, c).map(|avg| avg.max(0.0) * dt_hours);

    // Net battery flow is split by the sign of the averaged power.
    let (to_battery_wh, from_battery_wh) = match average(prev.battery_w, curr.battery_w) {
        Some(avg) if avg >= 0.0 => (Some(avg * dt_hours), Some(0.0)),
        Some(avg) => (Some(0.0), Some(-avg * dt_hours)),
        None => (None, None),
    };

    EnergyDeltas {
        from_pv_wh: directional(prev.pv_w, curr.pv_w),
        from_grid_wh: directional(prev.grid_w, curr.grid_w),
        to_load_wh: directional(prev.load_w, curr.load_w),
        to_battery_wh,
        from_battery_wh,
    }
}
