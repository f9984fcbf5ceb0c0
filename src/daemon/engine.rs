use crate::daemon::records::RunState;
use chrono::{DateTime, Duration, Utc};

/// Transition emitted by the engine. A stop carries the start instant of the
/// run it closes so the caller can book the cycle without consulting any
/// other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    EnteredRun {
        at: DateTime<Utc>,
    },
    EnteredStop {
        run_started_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Stopped,
    Running {
        started_at: DateTime<Utc>,
        last_active_at: DateTime<Utc>,
    },
}

/// Debounce state machine over confirmed activity samples.
///
/// STOP -> RUN fires on the first active sample. RUN -> STOP fires only once
/// the gap since the last active sample strictly exceeds the stop threshold,
/// so single missed frames never fragment a run. Every input carries its
/// instant; the engine never reads a clock, which keeps replays of a sample
/// sequence byte-for-byte deterministic.
pub struct RunStateEngine {
    phase: Phase,
    stop_threshold: Duration,
}

impl RunStateEngine {
    pub fn new(stop_threshold_secs: i64) -> Self {
        Self {
            phase: Phase::Stopped,
            stop_threshold: Duration::seconds(stop_threshold_secs),
        }
    }

    pub fn current(&self) -> RunState {
        match self.phase {
            Phase::Stopped => RunState::Stop,
            Phase::Running { .. } => RunState::Run,
        }
    }

    /// Start instant of the in-progress run. Set iff the state is RUN.
    pub fn run_started_at(&self) -> Option<DateTime<Utc>> {
        match self.phase {
            Phase::Stopped => None,
            Phase::Running { started_at, .. } => Some(started_at),
        }
    }

    pub fn on_sample(&mut self, active: bool, now: DateTime<Utc>) -> Option<EngineEvent> {
        match (&mut self.phase, active) {
            (Phase::Stopped, true) => {
                self.phase = Phase::Running {
                    started_at: now,
                    last_active_at: now,
                };
                Some(EngineEvent::EnteredRun { at: now })
            }
            (Phase::Running { last_active_at, .. }, true) => {
                *last_active_at = now;
                None
            }
            (
                Phase::Running {
                    started_at,
                    last_active_at,
                },
                false,
            ) => {
                if now.signed_duration_since(*last_active_at) > self.stop_threshold {
                    let run_started_at = *started_at;
                    self.phase = Phase::Stopped;
                    Some(EngineEvent::EnteredStop {
                        run_started_at,
                        at: now,
                    })
                } else {
                    None
                }
            }
            (Phase::Stopped, false) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn replay(engine: &mut RunStateEngine, samples: &[(bool, i64)]) -> Vec<EngineEvent> {
        samples
            .iter()
            .filter_map(|&(active, at)| engine.on_sample(active, t(at)))
            .collect()
    }

    #[test]
    fn single_active_sample_closes_after_threshold_gap() {
        let mut engine = RunStateEngine::new(10);
        let mut samples = vec![(true, 0)];
        samples.extend((1..=11).map(|s| (false, s)));

        let events = replay(&mut engine, &samples);

        assert_eq!(
            events,
            vec![
                EngineEvent::EnteredRun { at: t(0) },
                EngineEvent::EnteredStop {
                    run_started_at: t(0),
                    at: t(11),
                },
            ]
        );
        assert_eq!(engine.current(), RunState::Stop);
        // Runtime spans the idle tail that triggered the stop.
        assert_eq!(t(11).signed_duration_since(t(0)).num_seconds(), 11);
    }

    #[test]
    fn activity_within_threshold_extends_the_run() {
        let mut engine = RunStateEngine::new(10);
        let mut samples = vec![(true, 0)];
        samples.extend((1..=4).map(|s| (false, s)));
        samples.push((true, 5));
        samples.extend((6..=20).map(|s| (false, s)));

        let events = replay(&mut engine, &samples);

        // No stop near t=5; one continuous run closed at the first sample
        // strictly past the 10s gap after the refresh at t=5.
        assert_eq!(
            events,
            vec![
                EngineEvent::EnteredRun { at: t(0) },
                EngineEvent::EnteredStop {
                    run_started_at: t(0),
                    at: t(16),
                },
            ]
        );
    }

    #[test]
    fn gap_equal_to_threshold_does_not_stop() {
        let mut engine = RunStateEngine::new(10);
        assert!(engine.on_sample(true, t(0)).is_some());
        assert!(engine.on_sample(false, t(10)).is_none());
        assert_eq!(engine.current(), RunState::Run);
        assert!(engine.on_sample(false, t(11)).is_some());
    }

    #[test]
    fn active_while_running_only_refreshes() {
        let mut engine = RunStateEngine::new(10);
        assert!(engine.on_sample(true, t(0)).is_some());
        let started = engine.run_started_at();
        for s in 1..=30 {
            assert!(engine.on_sample(true, t(s)).is_none());
        }
        assert_eq!(engine.run_started_at(), started);
        assert_eq!(engine.current(), RunState::Run);
    }

    #[test]
    fn inactive_while_stopped_is_a_no_op() {
        let mut engine = RunStateEngine::new(10);
        for s in 0..100 {
            assert!(engine.on_sample(false, t(s)).is_none());
        }
        assert_eq!(engine.current(), RunState::Stop);
        assert_eq!(engine.run_started_at(), None);
    }

    #[test]
    fn run_start_is_present_iff_running() {
        let mut engine = RunStateEngine::new(10);
        assert_eq!(engine.run_started_at(), None);

        engine.on_sample(true, t(0));
        assert_eq!(engine.run_started_at(), Some(t(0)));

        engine.on_sample(false, t(20));
        assert_eq!(engine.current(), RunState::Stop);
        assert_eq!(engine.run_started_at(), None);

        engine.on_sample(true, t(25));
        assert_eq!(engine.run_started_at(), Some(t(25)));
    }

    #[test]
    fn replaying_a_sequence_yields_identical_transitions() {
        let samples: Vec<(bool, i64)> = (0..120)
            .map(|s| ((s / 7) % 3 != 2 && s % 5 != 0, s))
            .collect();

        let mut first = RunStateEngine::new(10);
        let mut second = RunStateEngine::new(10);
        assert_eq!(replay(&mut first, &samples), replay(&mut second, &samples));
        assert_eq!(first.current(), second.current());
    }

    #[test]
    fn back_to_back_cycles_each_emit_one_stop() {
        let mut engine = RunStateEngine::new(3);
        let mut samples = Vec::new();
        for cycle in 0..3 {
            let base = cycle * 20;
            samples.push((true, base));
            samples.push((true, base + 2));
            samples.extend((base + 3..base + 10).map(|s| (false, s)));
        }

        let events = replay(&mut engine, &samples);
        let stops = events
            .iter()
            .filter(|e| matches!(e, EngineEvent::EnteredStop { .. }))
            .count();
        let runs = events
            .iter()
            .filter(|e| matches!(e, EngineEvent::EnteredRun { .. }))
            .count();
        assert_eq!(runs, 3);
        assert_eq!(stops, 3);
    }
}
