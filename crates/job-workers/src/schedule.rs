//! Recurrence rules for repeatable jobs
//!
//! Cron patterns are evaluated in UTC with the `cron` crate, which expects a
//! leading seconds field. Classic 5-field patterns are accepted too: they get
//! `0` seconds and their day-of-week numbers are shifted from the Unix
//! convention (0 or 7 = Sunday) to the crate's (1 = Sunday).
//!
//! Fixed intervals are aligned to multiples of the interval since the epoch,
//! so every scheduler instance computes the same run times.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use shared::RepeatOptions;

use crate::error::{WorkerError, WorkerResult};

/// A parsed recurrence rule
#[derive(Debug, Clone)]
pub enum RepeatSchedule {
    Cron(Box<cron::Schedule>),
    Every(Duration),
}

impl RepeatSchedule {
    /// Parse repeat options; exactly one of `pattern` and `every_ms` must be set
    pub fn parse(opts: &RepeatOptions) -> WorkerResult<Self> {
        match (&opts.pattern, opts.every_ms) {
            (Some(_), Some(_)) => Err(WorkerError::invalid_schedule(
                "set either a cron pattern or an interval, not both",
            )),
            (None, None) => Err(WorkerError::invalid_schedule(
                "a cron pattern or an interval is required",
            )),
            (None, Some(0)) => Err(WorkerError::invalid_schedule("interval must be positive")),
            (None, Some(every)) if i64::try_from(every).is_err() => Err(
                WorkerError::invalid_schedule(format!("interval of {} ms is out of range", every)),
            ),
            (None, Some(every)) => Ok(RepeatSchedule::Every(Duration::from_millis(every))),
            (Some(pattern), None) => {
                let normalized = normalize_pattern(pattern)?;
                let schedule = cron::Schedule::from_str(&normalized).map_err(|e| {
                    WorkerError::invalid_schedule(format!("invalid cron pattern '{}': {}", pattern, e))
                })?;

                if schedule.upcoming(Utc).next().is_none() {
                    return Err(WorkerError::invalid_schedule(format!(
                        "cron pattern '{}' never fires",
                        pattern
                    )));
                }

                Ok(RepeatSchedule::Cron(Box::new(schedule)))
            }
        }
    }

    /// First run strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            RepeatSchedule::Cron(schedule) => schedule.after(&after).next(),
            RepeatSchedule::Every(every) => {
                let every_ms = i64::try_from(every.as_millis()).ok().filter(|ms| *ms > 0)?;
                let next = (after.timestamp_millis().div_euclid(every_ms) + 1).checked_mul(every_ms)?;
                DateTime::from_timestamp_millis(next)
            }
        }
    }
}

/// Convert a 5-field pattern to the 6-field form; 6 and 7 fields pass through
fn normalize_pattern(pattern: &str) -> WorkerResult<String> {
    let fields: Vec<&str> = pattern.split_whitespace().collect();

    match fields.len() {
        5 => {
            let dow = fields[4]
                .split(',')
                .map(shift_day_of_week)
                .collect::<Vec<_>>()
                .join(",");
            Ok(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], dow
            ))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(WorkerError::invalid_schedule(format!(
            "cron pattern '{}' has {} fields, expected 5 or 6",
            pattern, n
        ))),
    }
}

/// Unix day number (0-7, Sunday = 0 or 7) to cron crate day number (1-7, Sunday = 1)
fn shift_day(n: u8) -> u8 {
    if n >= 7 {
        1
    } else {
        n + 1
    }
}

fn shift_day_of_week(token: &str) -> String {
    let (range, step) = match token.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (token, None),
    };

    let shifted = match range.split_once('-') {
        Some((start, end)) => match (start.parse::<u8>(), end.parse::<u8>()) {
            (Ok(0), Ok(7)) => "1-7".to_string(),
            // A range ending on Sunday wraps around
            (Ok(start), Ok(7)) if step.is_none() => format!("{}-7,1", shift_day(start)),
            (Ok(start), Ok(end)) => format!("{}-{}", shift_day(start), shift_day(end).max(shift_day(start))),
            _ => range.to_string(),
        },
        None => match range.parse::<u8>() {
            Ok(day) => shift_day(day).to_string(),
            Err(_) => range.to_string(),
        },
    };

    match step {
        Some(step) => format!("{}/{}", shifted, step),
        None => shifted,
    }
}
