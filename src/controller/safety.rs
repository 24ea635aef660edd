//! Safe operating envelope for model-proposed pump speeds.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::warn;

/// Safety event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SafetyEvent {
    /// Proposed speed was outside the envelope and got clamped
    PumpSpeedClamped {
        unix_ts: i64,
        requested: f64,
        applied: u8,
        min: u8,
        max: u8,
    },
    /// Proposed speed was NaN or infinite
    NonFiniteSpeed { unix_ts: i64 },
}

/// Clamps model output into `[min, max]` and keeps a short history of interventions.
pub struct SafetyEnvelope {
    last_events: Mutex<VecDeque<SafetyEvent>>,
    max_event_history: usize,
}

impl Default for SafetyEnvelope {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyEnvelope {
    pub fn new() -> Self {
        Self {
            last_events: Mutex::new(VecDeque::new()),
            max_event_history: 100,
        }
    }

    /// Clamp `requested` into `[min, max]`. Returns `None` for non-finite input.
    pub fn clamp_pump_speed(&self, unix_ts: i64, requested: f64, min: u8, max: u8) -> Option<u8> {
        if !requested.is_finite() {
            self.record_event(SafetyEvent::NonFiniteSpeed { unix_ts });
            warn!(unix_ts, "rejected non-finite pump speed");
            return None;
        }

        let (lo, hi) = (f64::from(min.min(max)), f64::from(max));
        let applied = requested.round().clamp(lo, hi) as u8;
        if requested < lo || requested > hi {
            self.record_event(SafetyEvent::PumpSpeedClamped {
                unix_ts,
                requested,
                applied,
                min,
                max,
            });
            warn!(
                unix_ts,
                requested,
                applied,
                min,
                max,
                "pump speed clamped to safe envelope"
            );
        }
        Some(applied)
    }

    fn record_event(&self, event: SafetyEvent) {
        let mut events = self.last_events.lock();
        events.push_back(event);
        if events.len() > self.max_event_history {
            events.pop_front();
        }
    }

    /// Get recent safety events
    pub fn recent_events(&self, count: usize) -> Vec<SafetyEvent> {
        let events = self.last_events.lock();
        let start = events.len().saturating_sub(count);
        events.iter().skip(start).cloned().collect()
    }
}
