//! The collection loop: sample, compute, persist, decide, sleep.
//!
//! Cycles are strictly sequential. The loop owns the "previous record" used for energy
//! integration and water-temperature trends; it is rehydrated from the SQLite store by
//! [`CollectionLoop::recover`] and only advances once the store has accepted a record.
//! Cancellation is observed between phases and never interrupts a sink write.

pub mod clock;
pub mod stats;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CollectorConfig;
use crate::controller::{ControllerError, ControllerMode, Decision, HybridController};
use crate::domain::{ComputedRecord, SnapshotBundle, SourceKind};
use crate::error::PipelineError;
use crate::features::calendar::{is_night_hour, local_hour};
use crate::features::{FeatureComputer, FeatureSettings};
use crate::ml::ModelHandle;
use crate::sinks::{MultiSinkWriter, SinkKind, SinkStatus, WriteResult};
use crate::sources::{SourceError, Sources};

pub use clock::{Clock, ManualClock, SystemClock};
pub use stats::CollectorStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum CollectorPhase {
    Idle,
    Sampling,
    Computing,
    Persisting,
    ShuttingDown,
    Stopped,
}

/// Result of one [`CollectionLoop::run_cycle`].
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    /// The record went through the sinks; `decision` is `None` if the controller declined.
    Persisted {
        record: Box<ComputedRecord>,
        write: WriteResult,
        decision: Option<Decision>,
    },
    /// Snapshot timestamp was not newer than the last persisted record. Nothing was written.
    ClockAnomaly {
        snapshot_ts: i64,
        last_persisted_ts: i64,
    },
    /// Cancellation was observed before anything was persisted.
    Cancelled,
}

pub struct CollectionLoop {
    sources: Sources,
    computer: FeatureComputer,
    writer: MultiSinkWriter,
    controller: HybridController,
    model: Option<ModelHandle>,
    clock: Arc<dyn Clock>,
    base_interval: Duration,
    night_multiplier: u32,
    source_timeout: Duration,
    previous: Option<ComputedRecord>,
    last_persisted_ts: Option<i64>,
    /// Set when a store write timed out; the write may still have committed.
    resync_pending: bool,
    phase: CollectorPhase,
    stats: CollectorStats,
    decisions: watch::Sender<Option<Decision>>,
}

impl CollectionLoop {
    pub fn new(
        cfg: &CollectorConfig,
        sources: Sources,
        writer: MultiSinkWriter,
        controller: HybridController,
        model: Option<ModelHandle>,
    ) -> anyhow::Result<Self> {
        let settings = FeatureSettings::from_config(cfg)?;
        let (decisions, _) = watch::channel(None);
        Ok(Self {
            sources,
            computer: FeatureComputer::new(settings),
            writer,
            controller,
            model,
            clock: Arc::new(SystemClock),
            base_interval: cfg.base_interval(),
            night_multiplier: cfg.night_multiplier.max(1),
            source_timeout: cfg.source_timeout(),
            previous: None,
            last_persisted_ts: None,
            resync_pending: false,
            phase: CollectorPhase::Idle,
            stats: CollectorStats::default(),
            decisions,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn phase(&self) -> CollectorPhase {
        self.phase
    }

    pub fn stats(&self) -> &CollectorStats {
        &self.stats
    }

    pub fn previous(&self) -> Option<&ComputedRecord> {
        self.previous.as_ref()
    }

    pub fn writer(&self) -> &MultiSinkWriter {
        &self.writer
    }

    /// Latest decision, for whatever actuates the pump and relays.
    pub fn subscribe(&self) -> watch::Receiver<Option<Decision>> {
        self.decisions.subscribe()
    }

    /// Rehydrate the previous record from the structured store.
    pub async fn recover(&mut self) -> anyhow::Result<()> {
        if self.writer.store().is_none() {
            info!("structured store disabled, starting without a previous record");
            return Ok(());
        }

        match self.read_latest().await? {
            Some(record) => {
                info!(
                    unix_ts = record.unix_ts,
                    timestamp = %record.timestamp,
                    "recovered previous record"
                );
                self.last_persisted_ts = Some(record.unix_ts);
                self.previous = Some(record);
            }
            None => info!("structured store is empty, starting fresh"),
        }
        Ok(())
    }

    async fn read_latest(&self) -> anyhow::Result<Option<ComputedRecord>> {
        let Some(store) = self.writer.store() else {
            return Ok(None);
        };
        Ok(tokio::task::spawn_blocking(move || store.lock().latest()).await??)
    }

    /// Adopt the store's newest record if a timed-out write landed after all.
    async fn resync_previous(&mut self) {
        self.resync_pending = false;
        let latest = match self.read_latest().await {
            Ok(latest) => latest,
            Err(e) => {
                warn!(error = %e, "could not re-read structured store, previous record kept");
                return;
            }
        };
        let Some(record) = latest else {
            return;
        };
        if self.last_persisted_ts.map_or(true, |last| record.unix_ts > last) {
            info!(
                unix_ts = record.unix_ts,
                "timed-out write reached the store, previous record resynced"
            );
            self.last_persisted_ts = Some(record.unix_ts);
            self.previous = Some(record);
        }
    }

    /// Interval to wait after a cycle finishing at `now_ts`.
    pub fn next_interval(&self, now_ts: i64) -> Duration {
        if is_night_hour(local_hour(now_ts, self.computer.settings().tz)) {
            self.base_interval * self.night_multiplier
        } else {
            self.base_interval
        }
    }

    /// Run cycles until `token` is cancelled or a fatal error occurs.
    pub async fn run(&mut self, token: CancellationToken) -> Result<CollectorStats, PipelineError> {
        info!(
            base_interval_secs = self.base_interval.as_secs(),
            night_multiplier = self.night_multiplier,
            mode = %self.controller.mode(),
            "collection loop started"
        );

        let result = loop {
            match self.run_cycle(&token).await {
                Ok(CycleOutcome::Cancelled) => break Ok(()),
                Ok(_) => {}
                Err(e) => break Err(e),
            }

            self.phase = CollectorPhase::Idle;
            let wait = self.next_interval(self.clock.now_ts());
            debug!(wait_secs = wait.as_secs(), "waiting for next cycle");
            tokio::select! {
                biased;
                _ = token.cancelled() => break Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }
        };

        self.phase = CollectorPhase::ShuttingDown;
        if let Err(e) = &result {
            e.log(self.clock.now_ts());
        }
        self.phase = CollectorPhase::Stopped;
        info!(
            total_collected = self.stats.total_collected,
            total_skipped = self.stats.total_skipped,
            clock_anomalies = self.stats.clock_anomalies,
            "collection loop stopped"
        );
        result.map(|_| self.stats.clone())
    }

    /// One full cycle. Only a loop-fatal error is returned as `Err`.
    pub async fn run_cycle(
        &mut self,
        token: &CancellationToken,
    ) -> Result<CycleOutcome, PipelineError> {
        if token.is_cancelled() {
            return Ok(self.cancelled());
        }
        if self.resync_pending {
            self.resync_previous().await;
        }

        self.set_phase(CollectorPhase::Sampling);
        let now_ts = self.clock.now_ts();
        if let Some(last) = self.last_persisted_ts {
            if now_ts <= last {
                let err = PipelineError::ClockAnomaly {
                    snapshot_ts: now_ts,
                    last_persisted_ts: last,
                };
                err.log(now_ts);
                self.stats.clock_anomalies += 1;
                self.stats.total_skipped += 1;
                self.phase = CollectorPhase::Idle;
                return Ok(CycleOutcome::ClockAnomaly {
                    snapshot_ts: now_ts,
                    last_persisted_ts: last,
                });
            }
        }

        let bundle = self.sample(now_ts).await;
        if token.is_cancelled() {
            return Ok(self.cancelled());
        }

        self.set_phase(CollectorPhase::Computing);
        let record = self
            .computer
            .compute(self.previous.as_ref(), &bundle, now_ts);
        if record.water_temp.is_none() {
            self.stats.note_missing_water_temp(now_ts);
        }
        if record.fc_dt.is_none() {
            self.stats.note_missing_forecast(now_ts);
        }
        if token.is_cancelled() {
            return Ok(self.cancelled());
        }

        // From here on the cycle runs to completion even if cancelled.
        self.set_phase(CollectorPhase::Persisting);
        let write = self.writer.write(&record).await;
        for sink in write.failed_sinks() {
            self.stats.record_sink_failure(sink);
        }
        if write.statuses.iter().any(|(_, s)| s.is_accepted()) {
            self.stats.total_collected += 1;
        } else {
            self.stats.total_skipped += 1;
        }

        if write.advances_previous() {
            self.last_persisted_ts = Some(record.unix_ts);
            self.previous = Some(record.clone());
            info!(
                unix_ts = record.unix_ts,
                completeness = record.completeness_score,
                summary = %record.summary(),
                "record persisted"
            );
        } else {
            warn!(
                unix_ts = record.unix_ts,
                "structured store rejected the record, previous record kept"
            );
            self.resync_pending = write.status(SinkKind::Sqlite) == Some(&SinkStatus::TimedOut);
        }

        let decision = self.decide(&record)?;
        self.phase = CollectorPhase::Idle;
        Ok(CycleOutcome::Persisted {
            record: Box::new(record),
            write,
            decision,
        })
    }

    fn decide(&mut self, record: &ComputedRecord) -> Result<Option<Decision>, PipelineError> {
        match self.controller.decide(record, self.model.as_ref()) {
            Ok(decision) => {
                self.decisions.send_replace(Some(decision.clone()));
                Ok(Some(decision))
            }
            Err(ControllerError::ModelUnavailable(msg)) => {
                let err = PipelineError::ModelUnavailable(msg);
                if err.is_loop_fatal(self.controller.mode() == ControllerMode::MlOnly) {
                    return Err(err);
                }
                err.log(record.unix_ts);
                Ok(None)
            }
            Err(e @ ControllerError::InputsOutOfDomain(_)) => {
                warn!(
                    target: "decisions",
                    unix_ts = record.unix_ts,
                    error = %e,
                    "no decision this cycle"
                );
                Ok(None)
            }
        }
    }

    async fn sample(&self, now_ts: i64) -> SnapshotBundle {
        let limit = self.source_timeout;
        let (inverter, weather, forecast, devices) = tokio::join!(
            bounded(SourceKind::Inverter, limit, now_ts, self.sources.inverter.poll()),
            bounded(SourceKind::Weather, limit, now_ts, self.sources.weather.current()),
            bounded(SourceKind::Forecast, limit, now_ts, self.sources.weather.forecast()),
            bounded(SourceKind::Devices, limit, now_ts, self.sources.devices.status()),
        );
        SnapshotBundle {
            inverter,
            weather,
            forecast,
            devices,
        }
    }

    fn set_phase(&mut self, phase: CollectorPhase) {
        debug!(from = %self.phase, to = %phase, "collector phase");
        self.phase = phase;
    }

    fn cancelled(&mut self) -> CycleOutcome {
        self.set_phase(CollectorPhase::ShuttingDown);
        CycleOutcome::Cancelled
    }
}

/// Await one source under `limit`. Failures are logged and become `None`.
async fn bounded<T>(
    kind: SourceKind,
    limit: Duration,
    now_ts: i64,
    fut: impl Future<Output = Result<T, SourceError>>,
) -> Option<T> {
    let result = match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SourceError::Timeout(limit)),
    };
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            e.into_pipeline(kind).log(now_ts);
            None
        }
    }
}
