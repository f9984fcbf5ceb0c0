use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::watch;

use crate::daemon::records::RunState;

/// Immutable view of the machine published after every pipeline tick.
/// Readers clone the `Arc`, never lock the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub seq: u64,
    pub state: RunState,
    pub run_started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub current_cycle: i64,
    pub today_runtime_sec: i64,
    pub last_sample_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_transition: Option<Transition>,
    #[serde(default)]
    pub transitions_recent: Vec<Transition>,
    pub in_shift_window: bool,
    pub sensor_degraded: bool,
    pub counts: Counts,
    pub config: ConfigSummary,
    pub health: Vec<String>,
    pub published_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Transition {
    pub from: RunState,
    pub to: RunState,
    pub at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct Counts {
    pub samples_seen: u64,
    pub transitions_seen: u64,
    pub cycles_closed: u64,
    pub commit_failures: u64,
    pub sensor_failures: u64,
}

/// Effective tuning knobs, echoed so operators can confirm what the daemon
/// actually loaded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigSummary {
    pub stop_threshold_secs: i64,
    pub sample_interval_ms: u64,
    pub idle_interval_ms: u64,
    pub shift_seconds: i64,
    pub confirm_frames: u32,
}

impl MachineSnapshot {
    pub fn empty() -> Self {
        Self {
            seq: 0,
            state: RunState::Stop,
            run_started_at: None,
            current_cycle: 0,
            today_runtime_sec: 0,
            last_sample_at: None,
            last_transition: None,
            transitions_recent: Vec::new(),
            in_shift_window: false,
            sensor_degraded: false,
            counts: Counts::default(),
            config: ConfigSummary::default(),
            health: Vec::new(),
            published_at: chrono::Utc::now(),
        }
    }
}

/// Single-writer bus between the pipeline and the HTTP side. The pipeline
/// publishes whole snapshots; readers either grab the latest or subscribe to
/// the watch channel for streaming.
pub struct SnapshotBus {
    seq: AtomicU64,
    snapshot_tx: watch::Sender<Arc<MachineSnapshot>>,
    snapshot_rx: watch::Receiver<Arc<MachineSnapshot>>,
    health_tx: watch::Sender<VecDeque<String>>,
    health_rx: watch::Receiver<VecDeque<String>>,
    transitions_tx: watch::Sender<VecDeque<Transition>>,
    transitions_rx: watch::Receiver<VecDeque<Transition>>,
}

impl SnapshotBus {
    pub fn new() -> Self {
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(MachineSnapshot::empty()));
        let (health_tx, health_rx) = watch::channel(VecDeque::with_capacity(64));
        let (transitions_tx, transitions_rx) = watch::channel(VecDeque::with_capacity(64));
        Self {
            seq: AtomicU64::new(0),
            snapshot_tx,
            snapshot_rx,
            health_tx,
            health_rx,
            transitions_tx,
            transitions_rx,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn publish(
        &self,
        state: RunState,
        run_started_at: Option<chrono::DateTime<chrono::Utc>>,
        current_cycle: i64,
        today_runtime_sec: i64,
        last_sample_at: Option<chrono::DateTime<chrono::Utc>>,
        last_transition: Option<Transition>,
        in_shift_window: bool,
        sensor_degraded: bool,
        counts: Counts,
        config: ConfigSummary,
        published_at: chrono::DateTime<chrono::Utc>,
    ) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let transitions_recent = self.recent_transitions(5);
        let health = self.current_health();
        let snap = MachineSnapshot {
            seq,
            state,
            run_started_at,
            current_cycle,
            today_runtime_sec,
            last_sample_at,
            last_transition,
            transitions_recent,
            in_shift_window,
            sensor_degraded,
            counts,
            config,
            health,
            published_at,
        };
        let _ = self.snapshot_tx.send(Arc::new(snap));
    }

    pub fn push_transition(&self, t: Transition) {
        let mut buf = {
            let guard = self.transitions_rx.borrow();
            guard.clone()
        };
        if buf.len() >= 64 {
            let _ = buf.pop_front();
        }
        buf.push_back(t);
        let _ = self.transitions_tx.send(buf);
    }

    pub fn recent_transitions(&self, limit: usize) -> Vec<Transition> {
        let buf = self.transitions_rx.borrow();
        let n = limit.min(buf.len());
        buf.iter().rev().take(n).copied().collect()
    }

    pub fn push_health(&self, msg: impl Into<String>) {
        let mut buf = {
            let guard = self.health_rx.borrow();
            guard.clone()
        };
        if buf.len() >= 64 {
            let _ = buf.pop_front();
        }
        buf.push_back(msg.into());
        let _ = self.health_tx.send(buf);
    }

    pub fn current_health(&self) -> Vec<String> {
        self.health_rx.borrow().iter().cloned().collect()
    }

    pub fn snapshot(&self) -> Arc<MachineSnapshot> {
        self.snapshot_rx.borrow().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<Arc<MachineSnapshot>> {
        self.snapshot_rx.clone()
    }
}

impl Default for SnapshotBus {
    fn default() -> Self {
        Self::new()
    }
}
