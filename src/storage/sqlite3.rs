use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Rows, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::daemon::records::{
    shift_relative_availability, CycleRecord, DailySummary, DowntimeEpisode, DowntimeReason,
    StateChangeEntry,
};
use crate::storage::{
    ClosedRun, DayTotals, MachineStore, MonthlyRollup, ReasonTotal, StoreError, StoreResult,
};

const BUSY_TIMEOUT_MS: u64 = 5_000;

/// SQLite-backed ledger. Opens a short-lived connection per call so readers
/// on the HTTP side never queue behind the pipeline's write transactions.
pub struct SqliteStore {
    db_path: PathBuf,
    shift_seconds: i64,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(db_path: P, shift_seconds: i64) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {:?}", parent))?;
        }

        let store = Self {
            db_path,
            shift_seconds,
        };
        let conn = store.conn()?;
        Self::init_db(&conn)?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
        Ok(conn)
    }

    fn init_db(conn: &Connection) -> StoreResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS machine_state (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                state TEXT NOT NULL,
                current_cycle INTEGER NOT NULL,
                today_runtime_sec INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS cycle_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                date TEXT NOT NULL,
                cycle_no INTEGER NOT NULL,
                start_time TEXT NOT NULL,
                stop_time TEXT NOT NULL,
                runtime_sec INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cycle_log_date ON cycle_log(date);
            CREATE TABLE IF NOT EXISTS daily_summary (
                date TEXT PRIMARY KEY,
                total_cycles INTEGER NOT NULL,
                total_runtime_sec INTEGER NOT NULL,
                total_downtime_sec INTEGER NOT NULL,
                availability REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS downtime_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                start_time TEXT NOT NULL,
                end_time TEXT,
                reason TEXT NOT NULL,
                duration_sec INTEGER,
                date TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_downtime_date ON downtime_log(date);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_downtime_one_active
                ON downtime_log(is_active) WHERE is_active = 1;",
        )?;
        Ok(())
    }

    fn summary_row(conn: &Connection, date: NaiveDate) -> StoreResult<Option<DailySummary>> {
        let mut stmt = conn.prepare(
            "SELECT date, total_cycles, total_runtime_sec, total_downtime_sec, availability
             FROM daily_summary WHERE date = ?1",
        )?;
        let mut rows = stmt.query([date_str(date)])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::summary_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn summary_from_row(row: &Row) -> StoreResult<DailySummary> {
        let date_s: String = row.get(0)?;
        Ok(DailySummary {
            date: parse_date(&date_s)?,
            total_cycles: row.get(1)?,
            total_runtime_sec: row.get(2)?,
            total_downtime_sec: row.get(3)?,
            availability_pct: row.get(4)?,
        })
    }

    fn upsert_summary(conn: &Connection, summary: &DailySummary) -> StoreResult<()> {
        conn.execute(
            "INSERT OR REPLACE INTO daily_summary
                 (date, total_cycles, total_runtime_sec, total_downtime_sec, availability)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                date_str(summary.date),
                summary.total_cycles,
                summary.total_runtime_sec,
                summary.total_downtime_sec,
                summary.availability_pct
            ],
        )?;
        Ok(())
    }

    fn episode_from_row(row: &Row) -> StoreResult<DowntimeEpisode> {
        let start_s: String = row.get(1)?;
        let end_s: Option<String> = row.get(2)?;
        let reason_s: String = row.get(3)?;
        let date_s: String = row.get(5)?;
        let end_time = match end_s {
            Some(s) => Some(parse_ts(&s)?),
            None => None,
        };
        Ok(DowntimeEpisode {
            id: row.get(0)?,
            start_time: parse_ts(&start_s)?,
            end_time,
            reason: parse_reason(&reason_s)?,
            duration_sec: row.get(4)?,
            date: parse_date(&date_s)?,
            is_active: row.get::<_, i64>(6)? != 0,
        })
    }

    fn collect_episodes(rows: &mut Rows) -> StoreResult<Vec<DowntimeEpisode>> {
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Self::episode_from_row(row)?);
        }
        Ok(out)
    }

    fn collect_reason_totals(rows: &mut Rows) -> StoreResult<Vec<ReasonTotal>> {
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let reason_s: String = row.get(0)?;
            out.push(ReasonTotal {
                reason: parse_reason(&reason_s)?,
                episodes: row.get(1)?,
                total_sec: row.get(2)?,
            });
        }
        Ok(out)
    }
}

impl MachineStore for SqliteStore {
    fn close_run(
        &self,
        date: NaiveDate,
        started_at: DateTime<Utc>,
        stopped_at: DateTime<Utc>,
    ) -> StoreResult<ClosedRun> {
        let runtime_sec = stopped_at.signed_duration_since(started_at).num_seconds();
        if runtime_sec <= 0 {
            return Err(StoreError::Validation(format!(
                "cycle runtime must be positive, got {runtime_sec}s"
            )));
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut summary =
            Self::summary_row(&tx, date)?.unwrap_or_else(|| DailySummary::empty(date));
        summary.total_cycles += 1;
        summary.total_runtime_sec += runtime_sec;
        summary.availability_pct =
            shift_relative_availability(summary.total_runtime_sec, self.shift_seconds);

        let cycle = CycleRecord {
            date,
            cycle_no: summary.total_cycles,
            start_time: started_at,
            stop_time: stopped_at,
            runtime_sec,
        };
        tx.execute(
            "INSERT INTO cycle_log (date, cycle_no, start_time, stop_time, runtime_sec)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                date_str(date),
                cycle.cycle_no,
                cycle.start_time.to_rfc3339(),
                cycle.stop_time.to_rfc3339(),
                cycle.runtime_sec
            ],
        )?;
        Self::upsert_summary(&tx, &summary)?;
        tx.commit()?;

        Ok(ClosedRun { cycle, summary })
    }

    fn log_state_change(&self, entry: &StateChangeEntry) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO machine_state (timestamp, state, current_cycle, today_runtime_sec)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.timestamp.to_rfc3339(),
                entry.state.to_string(),
                entry.current_cycle,
                entry.today_runtime_sec
            ],
        )?;
        Ok(())
    }

    fn day_totals(&self, date: NaiveDate) -> StoreResult<DayTotals> {
        let conn = self.conn()?;
        let (cycles, runtime_sec) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(runtime_sec), 0) FROM cycle_log WHERE date = ?1",
            [date_str(date)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(DayTotals {
            cycles,
            runtime_sec,
        })
    }

    fn cycles_for(&self, date: NaiveDate) -> StoreResult<Vec<CycleRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT date, cycle_no, start_time, stop_time, runtime_sec
             FROM cycle_log WHERE date = ?1 ORDER BY cycle_no ASC",
        )?;
        let mut rows = stmt.query([date_str(date)])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let date_s: String = row.get(0)?;
            let start_s: String = row.get(2)?;
            let stop_s: String = row.get(3)?;
            out.push(CycleRecord {
                date: parse_date(&date_s)?,
                cycle_no: row.get(1)?,
                start_time: parse_ts(&start_s)?,
                stop_time: parse_ts(&stop_s)?,
                runtime_sec: row.get(4)?,
            });
        }
        Ok(out)
    }

    fn summary_for(&self, date: NaiveDate) -> StoreResult<Option<DailySummary>> {
        let conn = self.conn()?;
        Self::summary_row(&conn, date)
    }

    fn start_downtime(
        &self,
        reason: DowntimeReason,
        at: DateTime<Utc>,
        date: NaiveDate,
    ) -> StoreResult<DowntimeEpisode> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let open: Option<i64> = tx
            .query_row("SELECT id FROM downtime_log WHERE is_active = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        if let Some(id) = open {
            return Err(StoreError::Conflict(format!(
                "downtime episode {id} is still open"
            )));
        }

        let inserted = tx.execute(
            "INSERT INTO downtime_log (start_time, end_time, reason, duration_sec, date, is_active)
             VALUES (?1, NULL, ?2, NULL, ?3, 1)",
            params![at.to_rfc3339(), reason.as_str(), date_str(date)],
        );
        match inserted {
            Ok(_) => {}
            // The partial unique index backstops the check above.
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(StoreError::Conflict(
                    "a downtime episode is already open".into(),
                ));
            }
            Err(e) => return Err(e.into()),
        }
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(DowntimeEpisode {
            id,
            start_time: at,
            end_time: None,
            reason,
            duration_sec: None,
            date,
            is_active: true,
        })
    }

    fn stop_downtime(&self, at: DateTime<Utc>) -> StoreResult<DowntimeEpisode> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let open = tx
            .query_row(
                "SELECT id, start_time, reason, date FROM downtime_log WHERE is_active = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, start_s, reason_s, date_s)) = open else {
            return Err(StoreError::NotFound("no downtime episode is open".into()));
        };

        let start_time = parse_ts(&start_s)?;
        let reason = parse_reason(&reason_s)?;
        let date = parse_date(&date_s)?;
        let duration_sec = at.signed_duration_since(start_time).num_seconds().max(0);

        tx.execute(
            "UPDATE downtime_log SET end_time = ?1, duration_sec = ?2, is_active = 0
             WHERE id = ?3",
            params![at.to_rfc3339(), duration_sec, id],
        )?;

        // Downtime folds into the day the episode started on.
        let mut summary =
            Self::summary_row(&tx, date)?.unwrap_or_else(|| DailySummary::empty(date));
        summary.total_downtime_sec += duration_sec;
        summary.availability_pct =
            shift_relative_availability(summary.total_runtime_sec, self.shift_seconds);
        Self::upsert_summary(&tx, &summary)?;
        tx.commit()?;

        Ok(DowntimeEpisode {
            id,
            start_time,
            end_time: Some(at),
            reason,
            duration_sec: Some(duration_sec),
            date,
            is_active: false,
        })
    }

    fn active_downtime(&self) -> StoreResult<Option<DowntimeEpisode>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, start_time, end_time, reason, duration_sec, date, is_active
             FROM downtime_log WHERE is_active = 1",
        )?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::episode_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn downtime_by_reason(&self, date: NaiveDate) -> StoreResult<Vec<ReasonTotal>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT reason, COUNT(*) AS episodes, COALESCE(SUM(duration_sec), 0) AS total_sec
             FROM downtime_log
             WHERE date = ?1 AND is_active = 0
             GROUP BY reason
             ORDER BY total_sec DESC",
        )?;
        let mut rows = stmt.query([date_str(date)])?;
        Self::collect_reason_totals(&mut rows)
    }

    fn downtime_history(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        limit: i64,
    ) -> StoreResult<Vec<DowntimeEpisode>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, start_time, end_time, reason, duration_sec, date, is_active
             FROM downtime_log
             WHERE is_active = 0
               AND date >= COALESCE(?1, date) AND date <= COALESCE(?2, date)
             ORDER BY start_time DESC
             LIMIT ?3",
        )?;
        let mut rows = stmt.query(params![
            start.map(date_str),
            end.map(date_str),
            limit.max(1)
        ])?;
        Self::collect_episodes(&mut rows)
    }

    fn longest_downtime(&self, date: NaiveDate, limit: i64) -> StoreResult<Vec<DowntimeEpisode>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, start_time, end_time, reason, duration_sec, date, is_active
             FROM downtime_log
             WHERE date = ?1 AND is_active = 0
             ORDER BY duration_sec DESC, start_time DESC
             LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![date_str(date), limit.max(1)])?;
        Self::collect_episodes(&mut rows)
    }

    fn downtime_for(&self, date: NaiveDate) -> StoreResult<Vec<DowntimeEpisode>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, start_time, end_time, reason, duration_sec, date, is_active
             FROM downtime_log
             WHERE date = ?1 AND is_active = 0
             ORDER BY start_time ASC",
        )?;
        let mut rows = stmt.query([date_str(date)])?;
        Self::collect_episodes(&mut rows)
    }

    fn summaries_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> StoreResult<Vec<DailySummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT date, total_cycles, total_runtime_sec, total_downtime_sec, availability
             FROM daily_summary
             WHERE date >= ?1 AND date <= ?2
             ORDER BY date ASC",
        )?;
        let mut rows = stmt.query(params![date_str(start), date_str(end)])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Self::summary_from_row(row)?);
        }
        Ok(out)
    }

    fn monthly_rollup(&self, year: i32) -> StoreResult<Vec<MonthlyRollup>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT CAST(strftime('%m', date) AS INTEGER) AS month,
                    SUM(total_cycles), SUM(total_runtime_sec), SUM(total_downtime_sec)
             FROM daily_summary
             WHERE strftime('%Y', date) = ?1
             GROUP BY month
             ORDER BY month ASC",
        )?;
        let mut rows = stmt.query([format!("{year:04}")])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(MonthlyRollup {
                month: row.get(0)?,
                total_cycles: row.get(1)?,
                total_runtime_sec: row.get(2)?,
                total_downtime_sec: row.get(3)?,
            });
        }
        Ok(out)
    }

    fn downtime_reason_rollup(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> StoreResult<Vec<ReasonTotal>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT reason, COUNT(*) AS episodes, COALESCE(SUM(duration_sec), 0) AS total_sec
             FROM downtime_log
             WHERE date >= ?1 AND date <= ?2 AND is_active = 0
             GROUP BY reason
             ORDER BY total_sec DESC",
        )?;
        let mut rows = stmt.query(params![date_str(start), date_str(end)])?;
        Self::collect_reason_totals(&mut rows)
    }
}

fn date_str(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn parse_ts(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {s:?}: {e}")))
}

fn parse_date(s: &str) -> StoreResult<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| StoreError::Corrupt(format!("bad date {s:?}: {e}")))
}

fn parse_reason(s: &str) -> StoreResult<DowntimeReason> {
    DowntimeReason::from_code(s)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown downtime reason {s:?}")))
}
