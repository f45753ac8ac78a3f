//! Cron schedules and next-fire computation.
//!
//! Accepts standard 5-field cron (`minute hour day month weekday`), the
//! 6-field form with a leading seconds column, and the usual `@daily` style
//! shortcuts. Numeric weekdays follow standard cron: `0` and `7` are Sunday.
//! Expressions are parsed once, at construction, so a malformed schedule is
//! rejected before a DAG carrying it can be registered.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur when parsing or evaluating schedules.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Invalid cron expression.
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    /// Unknown timezone name.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// The expression has no occurrence after the requested instant.
    #[error("no more occurrences")]
    NoMoreOccurrences,
}

/// Day names indexed by standard cron weekday number.
const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed cron schedule bound to a timezone.
#[derive(Clone)]
pub struct Schedule {
    expression: String,
    timezone: Tz,
    /// False until a timezone is named; such schedules adopt a default.
    explicit_timezone: bool,
    cron: Box<CronSchedule>,
}

impl Schedule {
    /// Parse an expression without naming a timezone.
    ///
    /// It is evaluated in UTC unless a default is applied with
    /// [`Schedule::set_default_timezone`], which the scheduler does on
    /// registration.
    pub fn new(expression: impl Into<String>) -> Result<Self, ScheduleError> {
        let expression = expression.into();
        let cron = parse(&expression)?;
        Ok(Self {
            expression,
            timezone: Tz::UTC,
            explicit_timezone: false,
            cron: Box::new(cron),
        })
    }

    /// Parse an expression whose fields are evaluated in `timezone`.
    pub fn with_timezone(
        expression: impl Into<String>,
        timezone: &str,
    ) -> Result<Self, ScheduleError> {
        let expression = expression.into();
        let timezone: Tz = timezone
            .parse()
            .map_err(|_| ScheduleError::InvalidTimezone(timezone.to_string()))?;
        let cron = parse(&expression)?;

        Ok(Self {
            expression,
            timezone,
            explicit_timezone: true,
            cron: Box::new(cron),
        })
    }

    /// Evaluate in `timezone` unless the schedule already names one.
    pub fn set_default_timezone(&mut self, timezone: Tz) {
        if !self.explicit_timezone {
            self.timezone = timezone;
        }
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        let local = after.with_timezone(&self.timezone);
        self.cron
            .after(&local)
            .next()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or(ScheduleError::NoMoreOccurrences)
    }

    /// First fire time strictly after the current instant.
    pub fn next(&self) -> Result<DateTime<Utc>, ScheduleError> {
        self.next_after(Utc::now())
    }

    /// Up to `n` consecutive fire times after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>, n: usize) -> Vec<DateTime<Utc>> {
        let local = after.with_timezone(&self.timezone);
        self.cron
            .after(&local)
            .take(n)
            .map(|dt| dt.with_timezone(&Utc))
            .collect()
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> &str {
        self.timezone.name()
    }
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schedule")
            .field("expression", &self.expression)
            .field("timezone", &self.timezone.name())
            .finish()
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.expression, self.timezone.name())
    }
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

fn parse(expression: &str) -> Result<CronSchedule, ScheduleError> {
    let trimmed = expression.trim();
    let expanded = if trimmed.starts_with('@') {
        expand_shortcut(trimmed).ok_or_else(|| ScheduleError::InvalidCron {
            expression: expression.to_string(),
            reason: "unknown shortcut".into(),
        })?
    } else {
        trimmed
    };

    let invalid = |reason: String| ScheduleError::InvalidCron {
        expression: expression.to_string(),
        reason,
    };

    let mut fields: Vec<String> = expanded.split_whitespace().map(str::to_string).collect();
    match fields.len() {
        5 => fields.insert(0, "0".to_string()),
        6 => {}
        n => return Err(invalid(format!("expected 5 or 6 fields, got {n}"))),
    }
    fields[5] = normalize_weekdays(&fields[5]).map_err(invalid)?;

    CronSchedule::from_str(&fields.join(" ")).map_err(|e| invalid(e.to_string()))
}

/// Rewrite numeric weekday items as day names.
///
/// The cron crate numbers weekdays 1-7 from Sunday, standard cron numbers
/// them 0-7 with both ends meaning Sunday. Names mean the same to both, so
/// numeric items (single days, ranges, steps) are expanded into the set of
/// days they cover. Items that already use names pass through untouched.
fn normalize_weekdays(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days = [false; 7];
    let mut named = Vec::new();
    for item in field.split(',') {
        if item.chars().any(|c| c.is_ascii_alphabetic()) {
            named.push(item);
            continue;
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: usize = step
                    .parse()
                    .ok()
                    .filter(|step| *step > 0)
                    .ok_or_else(|| format!("invalid weekday step '{step}'"))?;
                (range, Some(step))
            }
            None => (item, None),
        };
        let (start, end) = if range == "*" {
            (0, 6)
        } else if let Some((start, end)) = range.split_once('-') {
            (weekday_number(start)?, weekday_number(end)?)
        } else {
            let day = weekday_number(range)?;
            (day, if step.is_some() { 6 } else { day })
        };
        if start > end {
            return Err(format!("invalid weekday range '{range}'"));
        }

        for day in (start..=end).step_by(step.unwrap_or(1)) {
            days[day % 7] = true;
        }
    }

    let mut items: Vec<&str> = WEEKDAYS
        .iter()
        .zip(days)
        .filter_map(|(name, set)| set.then_some(*name))
        .collect();
    items.extend(named);
    Ok(items.join(","))
}

fn weekday_number(token: &str) -> Result<usize, String> {
    token
        .parse()
        .ok()
        .filter(|day| *day <= 7)
        .ok_or_else(|| format!("invalid weekday '{token}'"))
}

fn expand_shortcut(shortcut: &str) -> Option<&'static str> {
    let expanded = match shortcut.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => "0 0 1 1 *",
        "@monthly" => "0 0 1 * *",
        "@weekly" => "0 0 * * SUN",
        "@daily" | "@midnight" => "0 0 * * *",
        "@hourly" => "0 * * * *",
        _ => return None,
    };
    Some(expanded)
}
