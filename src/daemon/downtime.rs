use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::daemon::records::{DowntimeEpisode, DowntimeReason};
use crate::storage::{MachineStore, StoreResult};
use crate::util::logging::info;

/// Day-level downtime rollup. Every reason code appears, zero-filled, so
/// consumers can render a fixed table without probing for missing keys.
#[derive(Debug, Clone, Serialize)]
pub struct DowntimeDaySummary {
    pub date: NaiveDate,
    pub total_downtime_sec: i64,
    pub by_reason: BTreeMap<String, i64>,
}

/// Operator-driven downtime bookkeeping on top of the store. The store
/// enforces the single-open-episode rule; this layer adds the reporting
/// shapes and logs episode boundaries.
#[derive(Clone)]
pub struct DowntimeTracker {
    store: Arc<dyn MachineStore>,
}

impl DowntimeTracker {
    pub fn new(store: Arc<dyn MachineStore>) -> Self {
        Self { store }
    }

    pub fn start(
        &self,
        reason: DowntimeReason,
        now: DateTime<Utc>,
        today: NaiveDate,
    ) -> StoreResult<DowntimeEpisode> {
        let episode = self.store.start_downtime(reason, now, today)?;
        info!("downtime {} opened ({})", episode.id, reason.as_str());
        Ok(episode)
    }

    pub fn stop(&self, now: DateTime<Utc>) -> StoreResult<DowntimeEpisode> {
        let episode = self.store.stop_downtime(now)?;
        info!(
            "downtime {} closed after {}s ({})",
            episode.id,
            episode.duration_sec.unwrap_or(0),
            episode.reason.as_str()
        );
        Ok(episode)
    }

    pub fn active(&self) -> StoreResult<Option<DowntimeEpisode>> {
        self.store.active_downtime()
    }

    pub fn summary_for(&self, date: NaiveDate) -> StoreResult<DowntimeDaySummary> {
        let mut by_reason: BTreeMap<String, i64> = DowntimeReason::ALL
            .iter()
            .map(|r| (r.as_str().to_string(), 0))
            .collect();
        let mut total = 0;
        for row in self.store.downtime_by_reason(date)? {
            total += row.total_sec;
            by_reason.insert(row.reason.as_str().to_string(), row.total_sec);
        }
        Ok(DowntimeDaySummary {
            date,
            total_downtime_sec: total,
            by_reason,
        })
    }

    pub fn history(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        limit: i64,
    ) -> StoreResult<Vec<DowntimeEpisode>> {
        self.store.downtime_history(start, end, limit)
    }

    /// Ten longest closed episodes of the day.
    pub fn top_for(&self, date: NaiveDate) -> StoreResult<Vec<DowntimeEpisode>> {
        self.store.longest_downtime(date, 10)
    }
}
