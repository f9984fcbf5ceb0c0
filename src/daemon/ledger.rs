use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};

use crate::daemon::records::{RunState, StateChangeEntry};
use crate::storage::{ClosedRun, MachineStore, StoreResult};
use crate::util::logging::info;

/// Today's cycle counters, hydrated from the store at startup and folded
/// forward as runs close. The store stays authoritative; the cache exists so
/// the per-sample path never touches SQLite.
pub struct CycleLedger {
    store: Arc<dyn MachineStore>,
    date: NaiveDate,
    cycle_count: i64,
    runtime_sec: i64,
}

impl CycleLedger {
    pub fn load(store: Arc<dyn MachineStore>, today: NaiveDate) -> StoreResult<Self> {
        let totals = store.day_totals(today)?;
        info!(
            "ledger hydrated for {today}: {} cycles, {}s runtime",
            totals.cycles, totals.runtime_sec
        );
        Ok(Self {
            store,
            date: today,
            cycle_count: totals.cycles,
            runtime_sec: totals.runtime_sec,
        })
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn cycle_count(&self) -> i64 {
        self.cycle_count
    }

    pub fn runtime_sec(&self) -> i64 {
        self.runtime_sec
    }

    /// Re-hydrates when the local calendar date moves on. Returns true when a
    /// roll-over happened.
    pub fn roll_over_if_new_day(&mut self, today: NaiveDate) -> StoreResult<bool> {
        if today == self.date {
            return Ok(false);
        }
        let totals = self.store.day_totals(today)?;
        info!(
            "day rolled over {} -> {today}: {} cycles, {}s runtime",
            self.date, totals.cycles, totals.runtime_sec
        );
        self.date = today;
        self.cycle_count = totals.cycles;
        self.runtime_sec = totals.runtime_sec;
        Ok(true)
    }

    /// Commits one finished run under today's date and adopts the counters
    /// the store settled on.
    pub fn close_run(
        &mut self,
        started_at: DateTime<Utc>,
        stopped_at: DateTime<Utc>,
    ) -> StoreResult<ClosedRun> {
        let closed = self.store.close_run(self.date, started_at, stopped_at)?;
        self.cycle_count = closed.summary.total_cycles;
        self.runtime_sec = closed.summary.total_runtime_sec;
        Ok(closed)
    }

    /// Appends one transition to the audit trail with the current counters.
    pub fn record_transition(&self, state: RunState, at: DateTime<Utc>) -> StoreResult<()> {
        self.store.log_state_change(&StateChangeEntry {
            timestamp: at,
            state,
            current_cycle: self.cycle_count,
            today_runtime_sec: self.runtime_sec,
        })
    }
}
