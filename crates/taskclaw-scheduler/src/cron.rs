//! Lightweight cron expression parser.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds)
//! Per field: `*`, `N`, `A-B`, `*/N`, `A-B/N`, `N/S` and comma lists of those.
//! Example: "0 9 * * 1-5" = weekdays at 9:00 UTC
//!
//! 4-field and 6-field (Quartz, with seconds) expressions are rejected.
//! No cron crate dependency.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use taskclaw_core::error::{Result, TaskClawError};

/// How far ahead `next_after` searches before giving up (e.g. "0 0 30 2 *").
const MAX_LOOKAHEAD_DAYS: i64 = 366 * 5;

/// A parsed 5-field cron schedule. Each field is a bitmask of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
    /// Day-of-month field was not a wildcard.
    dom_restricted: bool,
    /// Day-of-week field was not a wildcard.
    dow_restricted: bool,
}

impl CronSchedule {
    /// Parse a 5-field expression.
    pub fn parse(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(TaskClawError::Validation(format!(
                "cron expression '{expression}' has {} fields (need 5: MIN HOUR DOM MON DOW)",
                parts.len()
            )));
        }

        let field = |idx: usize, name: &str, min: u32, max: u32| {
            parse_field(parts[idx], min, max).ok_or_else(|| {
                TaskClawError::Validation(format!(
                    "invalid {name} field '{}' in cron expression '{expression}' (allowed {min}-{max})",
                    parts[idx]
                ))
            })
        };

        let minutes = field(0, "minute", 0, 59)?;
        let hours = field(1, "hour", 0, 23)?;
        let days_of_month = field(2, "day-of-month", 1, 31)?;
        let months = field(3, "month", 1, 12)?;
        let mut days_of_week = field(4, "day-of-week", 0, 7)?;
        // 7 is an alias for Sunday.
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week | 1) & !(1 << 7);
        }

        Ok(Self {
            minutes,
            hours: hours as u32,
            days_of_month: days_of_month as u32,
            months: months as u16,
            days_of_week: days_of_week as u8,
            dom_restricted: !parts[2].starts_with('*'),
            dow_restricted: !parts[4].starts_with('*'),
        })
    }

    /// First matching minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = (after + Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;
        let horizon = after + Duration::days(MAX_LOOKAHEAD_DAYS);

        while candidate <= horizon {
            let date = candidate.date_naive();

            if self.months & (1 << date.month()) == 0 {
                candidate = start_of_next_month(date)?;
                continue;
            }
            if !self.day_matches(date) {
                candidate = (date + Duration::days(1)).and_hms_opt(0, 0, 0)?.and_utc();
                continue;
            }
            if self.hours & (1 << candidate.hour()) == 0 {
                candidate = candidate.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if self.minutes & (1 << candidate.minute()) == 0 {
                candidate += Duration::minutes(1);
                continue;
            }
            return Some(candidate);
        }

        None
    }

    /// The next `count` fire times after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut times = Vec::with_capacity(count);
        let mut cursor = after;
        while times.len() < count {
            match self.next_after(cursor) {
                Some(next) => {
                    times.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        times
    }

    /// Vixie cron semantics: when both day fields are restricted, either may match.
    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom_ok = self.days_of_month & (1 << date.day()) != 0;
        let dow_ok = self.days_of_week & (1 << date.weekday().num_days_from_sunday()) != 0;
        if self.dom_restricted && self.dow_restricted {
            dom_ok || dow_ok
        } else {
            dom_ok && dow_ok
        }
    }
}

/// Check a cron expression without keeping the parsed schedule.
pub fn validate(expression: &str) -> bool {
    CronSchedule::parse(expression).is_ok()
}

/// Parse a simple cron expression and compute the next run time.
pub fn next_run_from_cron(expression: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match CronSchedule::parse(expression) {
        Ok(schedule) => schedule.next_after(after),
        Err(e) => {
            tracing::warn!("Invalid cron expression: {e}");
            None
        }
    }
}

/// Parse a cron field into a bitmask of matching values.
fn parse_field(field: &str, min: u32, max: u32) -> Option<u64> {
    let mut mask = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let n: u32 = step.parse().ok()?;
                if n == 0 {
                    return None;
                }
                (range, Some(n))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let a: u32 = a.parse().ok()?;
            let b: u32 = b.parse().ok()?;
            if a > b {
                return None;
            }
            (a, b)
        } else {
            let n: u32 = range.parse().ok()?;
            // "5/15" means every 15 starting at 5
            if step.is_some() { (n, max) } else { (n, n) }
        };

        if lo < min || hi > max {
            return None;
        }

        for v in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
            mask |= 1 << v;
        }
    }
    Some(mask)
}

fn start_of_next_month(date: NaiveDate) -> Option<DateTime<Utc>> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    Some(NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?.and_utc())
}
