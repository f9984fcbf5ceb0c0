use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::daemon::engine::{EngineEvent, RunStateEngine};
use crate::daemon::ledger::CycleLedger;
use crate::daemon::records::RunState;
use crate::daemon::sensor::{ActivitySensor, ConfirmationFilter};
use crate::daemon::shift::ShiftCalendar;
use crate::daemon::snapshot::{ConfigSummary, Counts, SnapshotBus, Transition};
use crate::storage::MachineStore;
use crate::util::logging::{debug, error, info, warn};
use crate::util::threading::{ThreadHandle, ThreadRegistry};

/// Consecutive sensor failures before the snapshot flags the sensor degraded
/// and the loop falls back to the idle cadence.
const DEGRADED_AFTER_FAILURES: u32 = 5;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub stop_threshold_secs: i64,
    pub sample_interval_ms: u64,
    pub idle_interval_ms: u64,
    pub commit_retries: u32,
    pub confirm_frames: u32,
    pub min_confidence: f64,
    pub shift_seconds: i64,
}

pub struct PipelineResources {
    pub store: Arc<dyn MachineStore>,
    pub sensor: Box<dyn ActivitySensor>,
    pub calendar: ShiftCalendar,
    pub bus: Arc<SnapshotBus>,
}

/// Drives sensor -> filter -> calendar gate -> engine -> ledger and publishes
/// a snapshot after every step. All tick logic takes an explicit instant so
/// tests can replay a day without touching the wall clock.
pub struct Pipeline {
    config: PipelineConfig,
    sensor: Box<dyn ActivitySensor>,
    filter: ConfirmationFilter,
    calendar: ShiftCalendar,
    engine: RunStateEngine,
    ledger: CycleLedger,
    bus: Arc<SnapshotBus>,
    counts: Counts,
    last_sample_at: Option<DateTime<Utc>>,
    last_transition: Option<Transition>,
    in_window: bool,
    sensor_fail_streak: u32,
    cfg_summary: ConfigSummary,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        resources: PipelineResources,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let PipelineResources {
            store,
            sensor,
            calendar,
            bus,
        } = resources;

        let local = now.with_timezone(&Local);
        let ledger = CycleLedger::load(store, local.date_naive())?;
        let cfg_summary = ConfigSummary {
            stop_threshold_secs: config.stop_threshold_secs,
            sample_interval_ms: config.sample_interval_ms,
            idle_interval_ms: config.idle_interval_ms,
            shift_seconds: config.shift_seconds,
            confirm_frames: config.confirm_frames,
        };

        let pipeline = Self {
            engine: RunStateEngine::new(config.stop_threshold_secs),
            filter: ConfirmationFilter::new(config.confirm_frames, config.min_confidence),
            config,
            sensor,
            in_window: calendar.contains(local.time()),
            calendar,
            ledger,
            bus,
            counts: Counts::default(),
            last_sample_at: None,
            last_transition: None,
            sensor_fail_streak: 0,
            cfg_summary,
        };
        pipeline.publish(now);
        Ok(pipeline)
    }

    /// One poll step at an explicit instant.
    pub fn tick(&mut self, now: DateTime<Utc>) {
        let local = now.with_timezone(&Local);
        if let Err(e) = self.ledger.roll_over_if_new_day(local.date_naive()) {
            // Counters stay on the old day; the next tick retries.
            error!("day roll-over failed: {e}");
        }

        let in_window = self.calendar.contains(local.time());
        if in_window != self.in_window {
            debug!(
                "shift window {} at {}",
                if in_window { "opened" } else { "closed" },
                local.time()
            );
            self.in_window = in_window;
        }

        let confirmed = if in_window {
            match self.sensor.sample() {
                Ok(reading) => {
                    self.counts.samples_seen += 1;
                    self.last_sample_at = Some(now);
                    if self.sensor_fail_streak > 0 {
                        info!(
                            "sensor recovered after {} failed polls",
                            self.sensor_fail_streak
                        );
                        self.sensor_fail_streak = 0;
                    }
                    self.filter.observe(reading)
                }
                Err(e) => {
                    self.counts.sensor_failures += 1;
                    self.sensor_fail_streak = self.sensor_fail_streak.saturating_add(1);
                    if self.sensor_fail_streak == 1 || self.sensor_fail_streak % 20 == 0 {
                        warn!(
                            "sensor poll failed ({} in a row): {e:#}",
                            self.sensor_fail_streak
                        );
                    }
                    // Keep the last confirmed state; skip the engine this tick.
                    self.publish(now);
                    return;
                }
            }
        } else {
            // Outside the working window the sensor is left alone and the
            // machine winds down through the normal debounce.
            self.filter.reset();
            false
        };

        if let Some(event) = self.engine.on_sample(confirmed, now) {
            self.apply_event(event);
        }
        self.publish(now);
    }

    fn apply_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::EnteredRun { at } => {
                info!("RUN confirmed at {at}");
                self.note_transition(RunState::Stop, RunState::Run, at);
                if let Err(e) = self.ledger.record_transition(RunState::Run, at) {
                    warn!("audit append failed: {e}");
                }
            }
            EngineEvent::EnteredStop { run_started_at, at } => {
                self.note_transition(RunState::Run, RunState::Stop, at);
                self.close_with_retry(run_started_at, at);
                if let Err(e) = self.ledger.record_transition(RunState::Stop, at) {
                    warn!("audit append failed: {e}");
                }
            }
        }
    }

    fn note_transition(&mut self, from: RunState, to: RunState, at: DateTime<Utc>) {
        let tr = Transition { from, to, at };
        self.counts.transitions_seen += 1;
        self.last_transition = Some(tr);
        self.bus.push_transition(tr);
    }

    fn close_with_retry(&mut self, started_at: DateTime<Utc>, stopped_at: DateTime<Utc>) {
        let mut attempt = 0;
        loop {
            match self.ledger.close_run(started_at, stopped_at) {
                Ok(closed) => {
                    self.counts.cycles_closed += 1;
                    info!(
                        "cycle {} closed: {}s runtime, {}s total today",
                        closed.cycle.cycle_no,
                        closed.cycle.runtime_sec,
                        closed.summary.total_runtime_sec
                    );
                    return;
                }
                Err(e) if e.is_transient() && attempt < self.config.commit_retries => {
                    attempt += 1;
                    warn!("cycle commit busy (attempt {attempt}): {e}");
                    thread::sleep(Duration::from_millis(50 * u64::from(attempt)));
                }
                Err(e) => {
                    // The engine already moved on; the cycle is lost, not
                    // replayed against a stale state.
                    self.counts.commit_failures += 1;
                    error!("cycle commit failed, dropping cycle: {e}");
                    self.bus
                        .push_health(format!("cycle commit failed at {stopped_at}: {e}"));
                    return;
                }
            }
        }
    }

    fn publish(&self, now: DateTime<Utc>) {
        self.bus.publish(
            self.engine.current(),
            self.engine.run_started_at(),
            self.ledger.cycle_count(),
            self.ledger.runtime_sec(),
            self.last_sample_at,
            self.last_transition,
            self.in_window,
            self.sensor_fail_streak >= DEGRADED_AFTER_FAILURES,
            self.counts,
            self.cfg_summary.clone(),
            now,
        );
    }

    fn cadence(&self) -> Duration {
        if self.in_window && self.sensor_fail_streak < DEGRADED_AFTER_FAILURES {
            Duration::from_millis(self.config.sample_interval_ms)
        } else {
            Duration::from_millis(self.config.idle_interval_ms)
        }
    }

    pub fn run(mut self, shutdown_rx: Receiver<()>) {
        info!("pipeline thread started");
        loop {
            match shutdown_rx.recv_timeout(self.cadence()) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => self.tick(Utc::now()),
            }
        }
        info!("pipeline thread exiting");
    }
}

pub struct PipelineHandle {
    shutdown_tx: Sender<()>,
    thread: ThreadHandle,
}

impl PipelineHandle {
    /// Clonable sender for signal handlers.
    pub fn shutdown_signal(&self) -> Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn shutdown_and_join(self) -> thread::Result<()> {
        let _ = self.shutdown_tx.try_send(());
        self.thread.join()
    }
}

pub fn spawn_pipeline(pipeline: Pipeline, registry: &ThreadRegistry) -> Result<PipelineHandle> {
    let (shutdown_tx, shutdown_rx) = bounded(1);
    let thread = registry.spawn("pipeline", move || pipeline.run(shutdown_rx))?;
    Ok(PipelineHandle {
        shutdown_tx,
        thread,
    })
}
