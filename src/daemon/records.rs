use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Observable machine state. STOP is the initial and fail-safe state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Run,
    Stop,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Run => f.write_str("RUN"),
            RunState::Stop => f.write_str("STOP"),
        }
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUN" => Ok(RunState::Run),
            "STOP" => Ok(RunState::Stop),
            other => Err(format!("unknown run state '{other}'")),
        }
    }
}

/// Operator-declared downtime cause. Stored as the code text; the label is
/// what reports print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DowntimeReason {
    SetupDie,
    Repair,
    Maintenance,
    MaterialShortage,
    PowerFailure,
    QualityCheck,
    WaitingApproval,
    OperatorBreak,
    #[serde(rename = "OTHER_1")]
    Other1,
    #[serde(rename = "OTHER_2")]
    Other2,
}

impl DowntimeReason {
    pub const ALL: [DowntimeReason; 10] = [
        DowntimeReason::SetupDie,
        DowntimeReason::Repair,
        DowntimeReason::Maintenance,
        DowntimeReason::MaterialShortage,
        DowntimeReason::PowerFailure,
        DowntimeReason::QualityCheck,
        DowntimeReason::WaitingApproval,
        DowntimeReason::OperatorBreak,
        DowntimeReason::Other1,
        DowntimeReason::Other2,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DowntimeReason::SetupDie => "SETUP_DIE",
            DowntimeReason::Repair => "REPAIR",
            DowntimeReason::Maintenance => "MAINTENANCE",
            DowntimeReason::MaterialShortage => "MATERIAL_SHORTAGE",
            DowntimeReason::PowerFailure => "POWER_FAILURE",
            DowntimeReason::QualityCheck => "QUALITY_CHECK",
            DowntimeReason::WaitingApproval => "WAITING_APPROVAL",
            DowntimeReason::OperatorBreak => "OPERATOR_BREAK",
            DowntimeReason::Other1 => "OTHER_1",
            DowntimeReason::Other2 => "OTHER_2",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DowntimeReason::SetupDie => "Die setup / changeover",
            DowntimeReason::Repair => "Machine fault / repair",
            DowntimeReason::Maintenance => "Planned maintenance",
            DowntimeReason::MaterialShortage => "Waiting for material",
            DowntimeReason::PowerFailure => "Power failure",
            DowntimeReason::QualityCheck => "Quality check",
            DowntimeReason::WaitingApproval => "Waiting for approval",
            DowntimeReason::OperatorBreak => "Operator break",
            DowntimeReason::Other1 => "Other (1)",
            DowntimeReason::Other2 => "Other (2)",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|r| r.as_str() == code)
    }
}

impl fmt::Display for DowntimeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One completed RUN episode. Append-only; `cycle_no` is 1-based per day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub date: NaiveDate,
    pub cycle_no: i64,
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
    pub runtime_sec: i64,
}

/// Aggregate counters for one calendar date, upserted alongside every cycle
/// close and every completed downtime episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub total_cycles: i64,
    pub total_runtime_sec: i64,
    pub total_downtime_sec: i64,
    #[serde(rename = "availability")]
    pub availability_pct: f64,
}

impl DailySummary {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            total_cycles: 0,
            total_runtime_sec: 0,
            total_downtime_sec: 0,
            availability_pct: 0.0,
        }
    }
}

/// Operator-declared downtime interval. At most one episode is active at any
/// instant; `end_time` and `duration_sec` are set only on close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DowntimeEpisode {
    pub id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub reason: DowntimeReason,
    pub duration_sec: Option<i64>,
    pub date: NaiveDate,
    pub is_active: bool,
}

/// Audit-trail row written on every confirmed transition. Diagnostic only;
/// nothing is recomputed from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangeEntry {
    pub timestamp: DateTime<Utc>,
    pub state: RunState,
    pub current_cycle: i64,
    pub today_runtime_sec: i64,
}

/// Canonical availability metric: runtime against the configured shift
/// budget, capped at 100 and rounded to two decimals. Stored in
/// `daily_summary` and served by the summary endpoints.
pub fn shift_relative_availability(runtime_sec: i64, shift_seconds: i64) -> f64 {
    if shift_seconds <= 0 {
        return 0.0;
    }
    let pct = (runtime_sec as f64 / shift_seconds as f64 * 100.0).min(100.0);
    (pct * 100.0).round() / 100.0
}

/// Report-only availability metric: runtime share of accounted time
/// (runtime + downtime). Reads 100 when nothing was accounted at all.
pub fn runtime_ratio_availability(runtime_sec: i64, downtime_sec: i64) -> f64 {
    let total = runtime_sec + downtime_sec;
    if total <= 0 {
        return 100.0;
    }
    let pct = runtime_sec as f64 / total as f64 * 100.0;
    (pct * 100.0).round() / 100.0
}

/// `HH:MM:SS` with hours left uncapped, for report sheets.
pub fn format_hms(total_secs: i64) -> String {
    let secs = total_secs.max(0);
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
