use anyhow::{anyhow, bail, Context, Result};
use chrono::{Datelike, Local, NaiveDate};
use std::collections::HashMap;
use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::daemon::records::{format_hms, runtime_ratio_availability, DailySummary};
use crate::storage::{MachineStore, ReasonTotal};

const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// A validated export request. Construction rejects incomplete or
/// impossible parameter sets so report builders never see them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportRequest {
    Daily { date: NaiveDate },
    Monthly { year: i32, month: u32 },
    Yearly { year: i32 },
}

impl ReportRequest {
    pub fn from_params(
        report_type: Option<&str>,
        year: Option<i32>,
        month: Option<u32>,
        day: Option<u32>,
    ) -> Result<Self> {
        let kind = report_type.ok_or_else(|| anyhow!("missing report_type"))?;
        match kind {
            "daily" => {
                let year = year.ok_or_else(|| anyhow!("daily report requires year"))?;
                let month = month.ok_or_else(|| anyhow!("daily report requires month"))?;
                let day = day.ok_or_else(|| anyhow!("daily report requires day"))?;
                let date = NaiveDate::from_ymd_opt(year, month, day)
                    .ok_or_else(|| anyhow!("invalid date {year:04}-{month:02}-{day:02}"))?;
                Ok(Self::Daily { date })
            }
            "monthly" => {
                let year = year.ok_or_else(|| anyhow!("monthly report requires year"))?;
                let month = month.ok_or_else(|| anyhow!("monthly report requires month"))?;
                if !(1..=12).contains(&month) {
                    bail!("invalid month {month}");
                }
                Ok(Self::Monthly { year, month })
            }
            "yearly" => {
                let year = year.ok_or_else(|| anyhow!("yearly report requires year"))?;
                Ok(Self::Yearly { year })
            }
            other => bail!("unknown report_type {other:?}"),
        }
    }

    pub fn filename(&self) -> String {
        match self {
            Self::Daily { date } => format!("Daily_Report_{date}.zip"),
            Self::Monthly { year, month } => format!("Monthly_Report_{year:04}-{month:02}.zip"),
            Self::Yearly { year } => format!("Yearly_Report_{year:04}.zip"),
        }
    }
}

/// Builds the ZIP-of-CSVs artifact for one request. Everything is
/// assembled in memory; reports cover at most a year of daily rows.
pub fn build_report(store: &dyn MachineStore, request: ReportRequest) -> Result<(String, Vec<u8>)> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    match request {
        ReportRequest::Daily { date } => daily_sheets(store, date, &mut zip)?,
        ReportRequest::Monthly { year, month } => monthly_sheets(store, year, month, &mut zip)?,
        ReportRequest::Yearly { year } => yearly_sheets(store, year, &mut zip)?,
    }
    let bytes = zip.finish().context("finalize report archive")?.into_inner();
    Ok((request.filename(), bytes))
}

fn daily_sheets(
    store: &dyn MachineStore,
    date: NaiveDate,
    zip: &mut ZipWriter<Cursor<Vec<u8>>>,
) -> Result<()> {
    let episodes = store.downtime_for(date)?;
    add_sheet(zip, "downtime_log.csv", |w| {
        w.write_record(["No.", "Start", "End", "Reason", "Duration (min)"])?;
        for (index, episode) in episodes.iter().enumerate() {
            let end = episode.end_time.map(local_stamp).unwrap_or_default();
            let minutes = episode.duration_sec.unwrap_or(0) as f64 / 60.0;
            w.write_record([
                (index + 1).to_string(),
                local_stamp(episode.start_time),
                end,
                episode.reason.label().to_string(),
                format!("{minutes:.1}"),
            ])?;
        }
        Ok(())
    })?;

    let summary = store
        .summary_for(date)?
        .unwrap_or_else(|| DailySummary::empty(date));
    add_sheet(zip, "machine_summary.csv", |w| {
        w.write_record(["Date", "Total Cycles", "Runtime", "Downtime", "Availability (%)"])?;
        w.write_record([
            summary.date.to_string(),
            summary.total_cycles.to_string(),
            format_hms(summary.total_runtime_sec),
            format_hms(summary.total_downtime_sec),
            format!(
                "{:.2}",
                runtime_ratio_availability(summary.total_runtime_sec, summary.total_downtime_sec)
            ),
        ])?;
        Ok(())
    })
}

fn monthly_sheets(
    store: &dyn MachineStore,
    year: i32,
    month: u32,
    zip: &mut ZipWriter<Cursor<Vec<u8>>>,
) -> Result<()> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| anyhow!("invalid month {year:04}-{month:02}"))?;
    let days = days_in_month(year, month);
    let last = NaiveDate::from_ymd_opt(year, month, days)
        .ok_or_else(|| anyhow!("invalid month {year:04}-{month:02}"))?;

    let by_date: HashMap<NaiveDate, DailySummary> = store
        .summaries_between(first, last)?
        .into_iter()
        .map(|s| (s.date, s))
        .collect();

    add_sheet(zip, "daily_performance.csv", |w| {
        w.write_record(["Day", "Cycles", "Runtime", "Downtime", "Availability (%)"])?;
        for day in 1..=days {
            let date = NaiveDate::from_ymd_opt(year, month, day).unwrap_or(first);
            let summary = day_summary(&by_date, date);
            w.write_record([
                day.to_string(),
                summary.total_cycles.to_string(),
                format_hms(summary.total_runtime_sec),
                format_hms(summary.total_downtime_sec),
                format!(
                    "{:.2}",
                    runtime_ratio_availability(
                        summary.total_runtime_sec,
                        summary.total_downtime_sec,
                    )
                ),
            ])?;
        }
        Ok(())
    })?;

    let totals = store.downtime_reason_rollup(first, last)?;
    reason_sheet(zip, "top_downtime_reasons.csv", &totals, ReasonUnit::Minutes)
}

fn yearly_sheets(
    store: &dyn MachineStore,
    year: i32,
    zip: &mut ZipWriter<Cursor<Vec<u8>>>,
) -> Result<()> {
    let by_month: HashMap<u32, (i64, i64, i64)> = store
        .monthly_rollup(year)?
        .into_iter()
        .map(|m| {
            (
                m.month,
                (m.total_cycles, m.total_runtime_sec, m.total_downtime_sec),
            )
        })
        .collect();

    add_sheet(zip, "monthly_performance.csv", |w| {
        w.write_record(["Month", "Cycles", "Runtime", "Downtime", "Availability (%)"])?;
        for (index, name) in MONTH_NAMES.iter().enumerate() {
            let (cycles, runtime, downtime) = by_month
                .get(&(index as u32 + 1))
                .copied()
                .unwrap_or_default();
            w.write_record([
                (*name).to_string(),
                cycles.to_string(),
                format_hms(runtime),
                format_hms(downtime),
                format!("{:.2}", runtime_ratio_availability(runtime, downtime)),
            ])?;
        }
        Ok(())
    })?;

    let first = NaiveDate::from_ymd_opt(year, 1, 1)
        .ok_or_else(|| anyhow!("invalid year {year}"))?;
    let last = NaiveDate::from_ymd_opt(year, 12, 31)
        .ok_or_else(|| anyhow!("invalid year {year}"))?;
    let totals = store.downtime_reason_rollup(first, last)?;
    reason_sheet(
        zip,
        "top_downtime_reasons_yearly.csv",
        &totals,
        ReasonUnit::Hours,
    )
}

#[derive(Clone, Copy)]
enum ReasonUnit {
    Minutes,
    Hours,
}

fn reason_sheet(
    zip: &mut ZipWriter<Cursor<Vec<u8>>>,
    name: &str,
    totals: &[ReasonTotal],
    unit: ReasonUnit,
) -> Result<()> {
    let lost: i64 = totals.iter().map(|t| t.total_sec).sum();
    add_sheet(zip, name, |w| {
        let (duration_header, share_header) = match unit {
            ReasonUnit::Minutes => ("Total (min)", "Share (%)"),
            ReasonUnit::Hours => ("Total (h)", "Impact (%)"),
        };
        w.write_record(["Reason", "Occurrences", duration_header, share_header])?;
        for total in totals {
            let amount = match unit {
                ReasonUnit::Minutes => total.total_sec as f64 / 60.0,
                ReasonUnit::Hours => total.total_sec as f64 / 3600.0,
            };
            let share = if lost > 0 {
                total.total_sec as f64 / lost as f64 * 100.0
            } else {
                0.0
            };
            w.write_record([
                total.reason.label().to_string(),
                total.episodes.to_string(),
                format!("{amount:.1}"),
                format!("{share:.1}"),
            ])?;
        }
        Ok(())
    })
}

fn add_sheet<F>(zip: &mut ZipWriter<Cursor<Vec<u8>>>, name: &str, fill: F) -> Result<()>
where
    F: FnOnce(&mut csv::Writer<Vec<u8>>) -> csv::Result<()>,
{
    let mut writer = csv::Writer::from_writer(Vec::new());
    fill(&mut writer).with_context(|| format!("write rows of {name}"))?;
    let data = writer
        .into_inner()
        .map_err(|e| anyhow!("finish sheet {name}: {}", e.error()))?;
    zip.start_file(
        name,
        SimpleFileOptions::default().compression_method(CompressionMethod::Deflated),
    )
    .with_context(|| format!("start sheet {name}"))?;
    zip.write_all(&data)
        .with_context(|| format!("store sheet {name}"))?;
    Ok(())
}

fn local_stamp(t: chrono::DateTime<chrono::Utc>) -> String {
    t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

// Days with no stored summary render as zeros under their own date.
fn day_summary(by_date: &HashMap<NaiveDate, DailySummary>, date: NaiveDate) -> DailySummary {
    by_date
        .get(&date)
        .cloned()
        .unwrap_or_else(|| DailySummary::empty(date))
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    next.and_then(|d| d.pred_opt()).map(|d| d.day()).unwrap_or(31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::records::DowntimeReason;
    use crate::storage::sqlite3::SqliteStore;
    use chrono::{DateTime, Utc};
    use std::io::Read;

    fn open_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store =
            SqliteStore::open(dir.path().join("machmon.sqlite3"), 27_000).expect("open store");
        (dir, store)
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn sheet_rows(bytes: &[u8], name: &str) -> Vec<Vec<String>> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes.to_vec())).expect("open archive");
        let mut file = archive.by_name(name).expect("sheet present");
        let mut text = String::new();
        file.read_to_string(&mut text).expect("read sheet");
        csv::Reader::from_reader(text.as_bytes())
            .records()
            .map(|r| r.unwrap().iter().map(str::to_string).collect())
            .collect()
    }

    fn seed_day(store: &SqliteStore, date: NaiveDate) {
        store
            .close_run(
                date,
                ts(&format!("{date}T09:00:00Z")),
                ts(&format!("{date}T09:10:00Z")),
            )
            .unwrap();
        store
            .start_downtime(DowntimeReason::Repair, ts(&format!("{date}T11:00:00Z")), date)
            .unwrap();
        store
            .stop_downtime(ts(&format!("{date}T11:05:00Z")))
            .unwrap();
    }

    #[test]
    fn daily_report_carries_both_sheets() {
        let (_dir, store) = open_store();
        let date = d("2025-03-10");
        seed_day(&store, date);

        let (filename, bytes) =
            build_report(&store, ReportRequest::Daily { date }).expect("build");
        assert_eq!(filename, "Daily_Report_2025-03-10.zip");

        let log = sheet_rows(&bytes, "downtime_log.csv");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0][0], "1");
        assert_eq!(log[0][3], "Machine fault / repair");
        assert_eq!(log[0][4], "5.0");

        let summary = sheet_rows(&bytes, "machine_summary.csv");
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0][0], "2025-03-10");
        assert_eq!(summary[0][1], "1");
        assert_eq!(summary[0][2], "00:10:00");
        assert_eq!(summary[0][3], "00:05:00");
        // 600s runtime over 900s accounted.
        assert_eq!(summary[0][4], "66.67");
    }

    #[test]
    fn monthly_report_has_one_row_per_day() {
        let (_dir, store) = open_store();
        seed_day(&store, d("2025-02-03"));
        seed_day(&store, d("2025-02-14"));

        let (filename, bytes) = build_report(
            &store,
            ReportRequest::Monthly {
                year: 2025,
                month: 2,
            },
        )
        .expect("build");
        assert_eq!(filename, "Monthly_Report_2025-02.zip");

        let rows = sheet_rows(&bytes, "daily_performance.csv");
        assert_eq!(rows.len(), 28);
        assert_eq!(rows[2][0], "3");
        assert_eq!(rows[2][1], "1");
        assert_eq!(rows[0][1], "0");
        assert_eq!(rows[0][2], "00:00:00");

        let reasons = sheet_rows(&bytes, "top_downtime_reasons.csv");
        assert_eq!(reasons.len(), 1);
        assert_eq!(reasons[0][0], "Machine fault / repair");
        assert_eq!(reasons[0][1], "2");
        assert_eq!(reasons[0][2], "10.0");
        assert_eq!(reasons[0][3], "100.0");
    }

    #[test]
    fn yearly_report_covers_all_twelve_months() {
        let (_dir, store) = open_store();
        seed_day(&store, d("2025-01-15"));
        seed_day(&store, d("2025-06-20"));

        let (filename, bytes) =
            build_report(&store, ReportRequest::Yearly { year: 2025 }).expect("build");
        assert_eq!(filename, "Yearly_Report_2025.zip");

        let rows = sheet_rows(&bytes, "monthly_performance.csv");
        assert_eq!(rows.len(), 12);
        assert_eq!(rows[0][0], "January");
        assert_eq!(rows[0][1], "1");
        assert_eq!(rows[5][0], "June");
        assert_eq!(rows[5][2], "00:10:00");
        assert_eq!(rows[11][1], "0");

        let reasons = sheet_rows(&bytes, "top_downtime_reasons_yearly.csv");
        assert_eq!(reasons[0][0], "Machine fault / repair");
        assert_eq!(reasons[0][2], "0.2");
    }

    #[test]
    fn request_validation_catches_incomplete_parameters() {
        assert!(ReportRequest::from_params(None, Some(2025), None, None).is_err());
        assert!(ReportRequest::from_params(Some("weekly"), Some(2025), None, None).is_err());
        assert!(ReportRequest::from_params(Some("daily"), Some(2025), Some(2), None).is_err());
        assert!(ReportRequest::from_params(Some("daily"), Some(2025), Some(2), Some(30)).is_err());
        assert!(ReportRequest::from_params(Some("monthly"), Some(2025), Some(13), None).is_err());
        assert!(ReportRequest::from_params(Some("yearly"), None, None, None).is_err());

        assert_eq!(
            ReportRequest::from_params(Some("daily"), Some(2025), Some(2), Some(28)).unwrap(),
            ReportRequest::Daily { date: d("2025-02-28") }
        );
        assert_eq!(
            ReportRequest::from_params(Some("yearly"), Some(2024), Some(7), Some(1)).unwrap(),
            ReportRequest::Yearly { year: 2024 }
        );
    }

    #[test]
    fn days_in_month_handles_leap_years() {
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(2025, 2), 28);
        assert_eq!(days_in_month(2025, 12), 31);
        assert_eq!(days_in_month(2025, 4), 30);
    }

    #[test]
    fn missing_days_get_an_empty_summary_for_their_own_date() {
        let mut by_date = HashMap::new();
        let stored = DailySummary {
            date: d("2025-02-03"),
            total_cycles: 4,
            total_runtime_sec: 600,
            total_downtime_sec: 0,
            availability_pct: 2.22,
        };
        by_date.insert(stored.date, stored.clone());

        assert_eq!(day_summary(&by_date, d("2025-02-03")), stored);

        let filler = day_summary(&by_date, d("2025-02-04"));
        assert_eq!(filler.date, d("2025-02-04"));
        assert_eq!(filler.total_cycles, 0);
        assert_eq!(filler.total_runtime_sec, 0);
    }
}
