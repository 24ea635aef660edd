//! Fraction of semantically relevant record fields that carry a value.

use serde_json::Value;

use crate::domain::ComputedRecord;

/// Fields never scored: identity and calendar fields are always present, targets are
/// always empty at write time, and the score itself is not an observation.
pub const UNSCORED_FIELDS: &[&str] = &[
    "timestamp",
    "unix_ts",
    "hour",
    "day_of_week",
    "month",
    "season",
    "is_weekend",
    "is_daytime",
    "is_night",
    "next_hour_pv_power",
    "optimal_pump_speed",
    "should_charge_battery",
    "completeness_score",
];

fn is_filled(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// Names of the typed record fields that take part in scoring.
pub fn scored_fields() -> Vec<String> {
    crate::domain::FIELD_NAMES
        .iter()
        .filter(|name| !UNSCORED_FIELDS.contains(*name))
        .map(|name| name.to_string())
        .collect()
}

/// Completeness in `[0, 1]`. Keys in `extra` are ignored so new sensors do not shift the score.
pub fn score(record: &ComputedRecord) -> f64 {
    let map = record.to_json_map();
    let scored = scored_fields();
    if scored.is_empty() {
        return 0.0;
    }
    let filled = scored
        .iter()
        .filter(|name| map.get(name.as_str()).is_some_and(is_filled))
        .count();
    filled as f64 / scored.len() as f64
}
