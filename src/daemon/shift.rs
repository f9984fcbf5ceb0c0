use crate::util::config::ShiftConfig;
use anyhow::{Context, Result, bail};
use chrono::NaiveTime;

/// Working window for one shift: a wall-clock interval minus break
/// intervals. Pure; callers decide which clock an instant comes from.
///
/// All interval bounds are inclusive on both ends, so an instant exactly on
/// `work_start`, `work_end`, or a break edge behaves predictably: window
/// edges count as working, break edges count as break.
#[derive(Debug, Clone)]
pub struct ShiftCalendar {
    work_start: NaiveTime,
    work_end: NaiveTime,
    breaks: Vec<(NaiveTime, NaiveTime)>,
}

impl ShiftCalendar {
    pub fn new(
        work_start: NaiveTime,
        work_end: NaiveTime,
        breaks: Vec<(NaiveTime, NaiveTime)>,
    ) -> Self {
        Self {
            work_start,
            work_end,
            breaks,
        }
    }

    pub fn from_config(cfg: &ShiftConfig) -> Result<Self> {
        let work_start = parse_hhmm(&cfg.work_start)
            .with_context(|| format!("bad shift.work_start '{}'", cfg.work_start))?;
        let work_end = parse_hhmm(&cfg.work_end)
            .with_context(|| format!("bad shift.work_end '{}'", cfg.work_end))?;
        if work_start > work_end {
            bail!(
                "shift.work_start {} is after shift.work_end {}",
                cfg.work_start,
                cfg.work_end
            );
        }

        let mut breaks = Vec::with_capacity(cfg.breaks.len());
        for (start_s, end_s) in &cfg.breaks {
            let start =
                parse_hhmm(start_s).with_context(|| format!("bad break start '{start_s}'"))?;
            let end = parse_hhmm(end_s).with_context(|| format!("bad break end '{end_s}'"))?;
            if start > end {
                bail!("break start {start_s} is after break end {end_s}");
            }
            breaks.push((start, end));
        }

        Ok(Self::new(work_start, work_end, breaks))
    }

    /// True iff `t` lies in the working window and in none of the breaks.
    pub fn contains(&self, t: NaiveTime) -> bool {
        if t < self.work_start || t > self.work_end {
            return false;
        }
        !self
            .breaks
            .iter()
            .any(|&(start, end)| t >= start && t <= end)
    }

    /// Calendar spanning the whole day with no breaks, for replay harnesses
    /// that should never gate samples.
    pub fn always_open() -> Self {
        let end_of_day = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
        Self::new(NaiveTime::MIN, end_of_day, Vec::new())
    }
}

impl Default for ShiftCalendar {
    fn default() -> Self {
        let shipped = crate::util::config::AppConfig::default().shift;
        ShiftCalendar::from_config(&shipped).unwrap_or_else(|_| ShiftCalendar::always_open())
    }
}

fn parse_hhmm(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|e| anyhow::anyhow!("expected HH:MM, got '{s}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).expect("valid time")
    }

    fn hms(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).expect("valid time")
    }

    #[test]
    fn default_calendar_matches_shipped_shift() {
        let cal = ShiftCalendar::default();
        let cases = [
            (hm(7, 59), false),
            (hm(8, 0), true),
            (hm(9, 30), true),
            (hm(10, 0), false),   // break edge is a break
            (hm(10, 15), false),  // closing edge too
            (hms(10, 15, 1), true),
            (hm(12, 30), false),
            (hm(13, 0), false),
            (hms(13, 0, 1), true),
            (hm(15, 10), false),
            (hm(17, 30), true),   // window edge is working
            (hms(17, 30, 1), false),
            (hm(18, 0), false),
            (hm(2, 0), false),
        ];
        for (t, expected) in cases {
            assert_eq!(cal.contains(t), expected, "at {t}");
        }
    }

    #[test]
    fn always_open_accepts_any_instant() {
        let cal = ShiftCalendar::always_open();
        assert!(cal.contains(hm(0, 0)));
        assert!(cal.contains(hm(12, 0)));
        assert!(cal.contains(hms(23, 59, 59)));
    }

    fn shipped_shift() -> ShiftConfig {
        crate::util::config::AppConfig::default().shift
    }

    #[test]
    fn from_config_rejects_malformed_times() {
        let mut cfg = shipped_shift();
        cfg.work_start = "8am".to_string();
        assert!(ShiftCalendar::from_config(&cfg).is_err());

        let mut cfg = shipped_shift();
        cfg.work_end = "07:00".to_string();
        assert!(ShiftCalendar::from_config(&cfg).is_err());

        let mut cfg = shipped_shift();
        cfg.breaks = vec![("10:30".to_string(), "10:00".to_string())];
        assert!(ShiftCalendar::from_config(&cfg).is_err());
    }

    #[test]
    fn seconds_in_break_strings_are_accepted() {
        let cfg = ShiftConfig {
            work_start: "06:00:00".to_string(),
            work_end: "14:00".to_string(),
            breaks: vec![("09:00".to_string(), "09:10:30".to_string())],
        };
        let cal = ShiftCalendar::from_config(&cfg).expect("calendar");
        assert!(cal.contains(hm(6, 0)));
        assert!(!cal.contains(hms(9, 10, 30)));
        assert!(cal.contains(hms(9, 10, 31)));
    }
}
