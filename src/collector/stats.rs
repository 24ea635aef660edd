use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

use crate::sinks::SinkKind;

/// Running totals since the loop started.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollectorStats {
    pub total_collected: u64,
    pub total_skipped: u64,
    pub clock_anomalies: u64,
    pub missing_water_temp: u64,
    pub missing_forecast: u64,
    pub sink_failures: BTreeMap<String, u64>,
}

impl CollectorStats {
    pub fn record_sink_failure(&mut self, sink: SinkKind) {
        *self.sink_failures.entry(sink.to_string()).or_default() += 1;
    }

    pub fn sink_failures_for(&self, sink: SinkKind) -> u64 {
        self.sink_failures
            .get(&sink.to_string())
            .copied()
            .unwrap_or(0)
    }

    pub fn note_missing_water_temp(&mut self, unix_ts: i64) {
        self.missing_water_temp += 1;
        if should_warn(self.missing_water_temp) {
            warn!(
                unix_ts,
                count = self.missing_water_temp,
                field = "water_temp",
                "water temperature missing"
            );
        }
    }

    pub fn note_missing_forecast(&mut self, unix_ts: i64) {
        self.missing_forecast += 1;
        if should_warn(self.missing_forecast) {
            warn!(
                unix_ts,
                count = self.missing_forecast,
                field = "fc_dt",
                "forecast missing"
            );
        }
    }
}

/// Warn on the first miss and every tenth after that.
fn should_warn(count: u64) -> bool {
    count == 1 || count % 10 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_cadence() {
        let warned: Vec<u64> = (1..=25).filter(|c| should_warn(*c)).collect();
        assert_eq!(warned, vec![1, 10, 20]);
    }

    #[test]
    fn test_sink_failures_are_counted_per_sink() {
        let mut stats = CollectorStats::default();
        stats.record_sink_failure(SinkKind::Csv);
        stats.record_sink_failure(SinkKind::Csv);
        stats.record_sink_failure(SinkKind::Sqlite);
        assert_eq!(stats.sink_failures_for(SinkKind::Csv), 2);
        assert_eq!(stats.sink_failures_for(SinkKind::Sqlite), 1);
        assert_eq!(stats.sink_failures_for(SinkKind::Jsonl), 0);
    }
}
