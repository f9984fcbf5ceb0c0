use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use crate::daemon::records::{
    CycleRecord, DailySummary, DowntimeEpisode, DowntimeReason, StateChangeEntry,
};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Caller handed us something that can never be persisted.
    #[error("{0}")]
    Validation(String),
    /// The write lost a uniqueness race, e.g. a second open downtime episode.
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    /// A stored row no longer parses; the ledger needs operator attention.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Lock contention clears on retry; everything else is permanent for a
    /// given call.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Counters the in-memory ledger rebuilds from at startup and day roll-over.
#[derive(Debug, Clone, Copy, Default)]
pub struct DayTotals {
    pub cycles: i64,
    pub runtime_sec: i64,
}

/// Closed-episode aggregate for one reason code.
#[derive(Debug, Clone)]
pub struct ReasonTotal {
    pub reason: DowntimeReason,
    pub episodes: i64,
    pub total_sec: i64,
}

/// One month's totals inside a yearly report.
#[derive(Debug, Clone, Copy)]
pub struct MonthlyRollup {
    pub month: u32,
    pub total_cycles: i64,
    pub total_runtime_sec: i64,
    pub total_downtime_sec: i64,
}

/// Everything `close_run` committed, returned so the caller can adopt the new
/// counters without a second read.
#[derive(Debug, Clone)]
pub struct ClosedRun {
    pub cycle: CycleRecord,
    pub summary: DailySummary,
}

/// Durable ledger behind the daemon. One pipeline thread owns the machine
/// lifecycle writes; downtime and read calls may come from any thread.
pub trait MachineStore: Send + Sync {
    /// Atomically appends the finished cycle and folds it into that day's
    /// summary. Rejects non-positive runtimes.
    fn close_run(
        &self,
        date: NaiveDate,
        started_at: DateTime<Utc>,
        stopped_at: DateTime<Utc>,
    ) -> StoreResult<ClosedRun>;

    /// Appends one RUN/STOP transition to the audit trail.
    fn log_state_change(&self, entry: &StateChangeEntry) -> StoreResult<()>;

    fn day_totals(&self, date: NaiveDate) -> StoreResult<DayTotals>;

    /// Cycles of one day, oldest first.
    fn cycles_for(&self, date: NaiveDate) -> StoreResult<Vec<CycleRecord>>;

    fn summary_for(&self, date: NaiveDate) -> StoreResult<Option<DailySummary>>;

    /// Opens a downtime episode. Fails with [`StoreError::Conflict`] while
    /// another episode is still open.
    fn start_downtime(
        &self,
        reason: DowntimeReason,
        at: DateTime<Utc>,
        date: NaiveDate,
    ) -> StoreResult<DowntimeEpisode>;

    /// Closes the open episode and folds its duration into the summary of the
    /// day it started on.
    fn stop_downtime(&self, at: DateTime<Utc>) -> StoreResult<DowntimeEpisode>;

    fn active_downtime(&self) -> StoreResult<Option<DowntimeEpisode>>;

    /// Closed-episode totals per reason for one day.
    fn downtime_by_reason(&self, date: NaiveDate) -> StoreResult<Vec<ReasonTotal>>;

    /// Episodes newest-first, optionally bounded by start/end dates.
    fn downtime_history(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        limit: i64,
    ) -> StoreResult<Vec<DowntimeEpisode>>;

    /// Longest closed episodes of one day, ties broken by most recent start.
    fn longest_downtime(&self, date: NaiveDate, limit: i64) -> StoreResult<Vec<DowntimeEpisode>>;

    /// Closed episodes of one day, oldest first.
    fn downtime_for(&self, date: NaiveDate) -> StoreResult<Vec<DowntimeEpisode>>;

    /// Daily summaries in `[start, end]`, ascending by date.
    fn summaries_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> StoreResult<Vec<DailySummary>>;

    /// Per-month totals for one calendar year, ascending by month.
    fn monthly_rollup(&self, year: i32) -> StoreResult<Vec<MonthlyRollup>>;

    /// Closed-episode totals per reason across a date range.
    fn downtime_reason_rollup(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> StoreResult<Vec<ReasonTotal>>;
}

pub mod sqlite3;
