//! Business calendar — decides when a step may fire.
//!
//! Pure and deterministic: everything is computed from the input instant, the
//! step delay and the BusinessHours record. Work happens in the calendar's
//! local (zoned) time and is converted to an absolute instant only at the end,
//! so DST transitions shift wall-clock hours rather than the work window.
//!
//! Weekdays are numbered 0 = Sunday .. 6 = Saturday. The work window is
//! half-open: `[start, end)`.

use std::collections::HashSet;

use cadence_core::error::{CadenceError, Result};
use cadence_core::types::{BusinessHours, Delay, DelayUnit};
use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Day advances before giving up. Two years of days plus DST retries.
const MAX_ITERATIONS: usize = 800;

/// A validated, ready-to-evaluate BusinessHours record.
#[derive(Debug, Clone)]
pub struct Calendar {
    tz: Tz,
    work_days: [bool; 7],
    start: NaiveTime,
    end: NaiveTime,
    holidays: HashSet<NaiveDate>,
}

impl Calendar {
    /// Validate a BusinessHours record.
    pub fn from_hours(hours: &BusinessHours) -> Result<Self> {
        let tz: Tz = hours
            .timezone
            .parse()
            .map_err(|e| CadenceError::Calendar(format!("Unknown timezone '{}': {e}", hours.timezone)))?;

        let mut work_days = [false; 7];
        for &d in &hours.work_days {
            if d > 6 {
                return Err(CadenceError::Calendar(format!("Work day {d} out of range 0-6")));
            }
            work_days[d as usize] = true;
        }
        if !work_days.iter().any(|d| *d) {
            return Err(CadenceError::Calendar(format!(
                "Business hours '{}' have no work days",
                hours.id
            )));
        }

        let start = parse_hhmm(&hours.start)?;
        let end = parse_hhmm(&hours.end)?;
        if start >= end {
            return Err(CadenceError::Calendar(format!(
                "Empty work window {}-{} in '{}'",
                hours.start, hours.end, hours.id
            )));
        }

        Ok(Self {
            tz,
            work_days,
            start,
            end,
            holidays: hours.holidays.iter().copied().collect(),
        })
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    fn is_work_day(&self, date: NaiveDate) -> bool {
        self.work_days[date.weekday().num_days_from_sunday() as usize] && !self.holidays.contains(&date)
    }

    /// Is `instant` inside the work window on a work day?
    pub fn is_eligible(&self, instant: DateTime<Utc>) -> bool {
        let local = instant.with_timezone(&self.tz).naive_local();
        let time = local.time();
        self.is_work_day(local.date()) && time >= self.start && time < self.end
    }

    /// Add `delay` to `from` in local time, then snap into the calendar.
    pub fn next_eligible_after(&self, from: DateTime<Utc>, delay: Delay) -> Result<DateTime<Utc>> {
        let candidate = match delay.unit {
            // Day delays keep the local wall-clock time across DST changes.
            DelayUnit::Days => {
                from.with_timezone(&self.tz).naive_local() + Duration::days(delay.amount as i64)
            }
            _ => (from + delay_duration(delay)).with_timezone(&self.tz).naive_local(),
        };
        self.snap_local(candidate)
    }

    fn snap_local(&self, mut candidate: NaiveDateTime) -> Result<DateTime<Utc>> {
        for _ in 0..MAX_ITERATIONS {
            let date = candidate.date();
            if !self.is_work_day(date) {
                candidate = self.next_day_start(date)?;
                continue;
            }
            let time = candidate.time();
            if time < self.start {
                candidate = date.and_time(self.start);
            } else if time >= self.end {
                candidate = self.next_day_start(date)?;
                continue;
            }

            match self.tz.from_local_datetime(&candidate) {
                LocalResult::Single(dt) => return Ok(dt.with_timezone(&Utc)),
                LocalResult::Ambiguous(earliest, _) => return Ok(earliest.with_timezone(&Utc)),
                // Wall-clock time skipped by a DST jump.
                LocalResult::None => candidate += Duration::hours(1),
            }
        }

        Err(CadenceError::Calendar(format!(
            "No eligible instant within {MAX_ITERATIONS} iterations (every day a holiday?)"
        )))
    }

    fn next_day_start(&self, date: NaiveDate) -> Result<NaiveDateTime> {
        date.succ_opt()
            .map(|d| d.and_time(self.start))
            .ok_or_else(|| CadenceError::Calendar("Date overflow".into()))
    }
}

/// Absolute duration of a delay (days = 24h).
pub fn delay_duration(delay: Delay) -> Duration {
    let amount = delay.amount as i64;
    match delay.unit {
        DelayUnit::Minutes => Duration::minutes(amount),
        DelayUnit::Hours => Duration::hours(amount),
        DelayUnit::Days => Duration::days(amount),
    }
}

/// `from + delay`, moved forward into `calendar`'s next eligible instant.
/// With no calendar the sum is returned unchanged.
pub fn next_eligible(
    from: DateTime<Utc>,
    delay: Delay,
    calendar: Option<&BusinessHours>,
) -> Result<DateTime<Utc>> {
    match calendar {
        None => Ok(from + delay_duration(delay)),
        Some(hours) => Calendar::from_hours(hours)?.next_eligible_after(from, delay),
    }
}

/// Is `instant` eligible under `calendar`? Always true with no calendar.
pub fn is_eligible(instant: DateTime<Utc>, calendar: Option<&BusinessHours>) -> Result<bool> {
    match calendar {
        None => Ok(true),
        Some(hours) => Ok(Calendar::from_hours(hours)?.is_eligible(instant)),
    }
}

fn parse_hhmm(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .map_err(|e| CadenceError::Calendar(format!("Invalid time '{s}' (want HH:MM): {e}")))
}
