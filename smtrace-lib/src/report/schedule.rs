use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, TimeZone};

use crate::{Error, Result};

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// A parsed cron expression.
///
/// Accepts classic 5 field crontab lines (`min hour dom month dow`, weekday 0 or 7
/// is Sunday) as well as 6 and 7 field expressions with leading seconds and an
/// optional trailing year. Fire times are wall-clock times in the zone of the
/// instant passed to [next_after](Self::next_after).
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    /// # Errors
    /// [Error::Cron] if the expression is invalid.
    pub fn parse(expr: &str) -> Result<Self> {
        let normalized = normalize(expr);
        let schedule = cron::Schedule::from_str(&normalized).map_err(|source| Error::Cron {
            expr: expr.to_string(),
            source,
        })?;
        Ok(CronSchedule {
            expr: expr.to_string(),
            schedule,
        })
    }

    /// The expression as configured.
    #[must_use]
    pub fn expression(&self) -> &str {
        &self.expr
    }

    /// The first fire time strictly after `after`, in the time zone of `after`.
    #[must_use]
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedule.after(after).next()
    }
}

impl FromStr for CronSchedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Display for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expr)
    }
}

/// Rewrite a crontab line into the seconds-first syntax of the `cron` crate.
fn normalize(expr: &str) -> String {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return fields.join(" ");
    }
    format!(
        "0 {} {} {} {} {}",
        fields[0],
        fields[1],
        fields[2],
        fields[3],
        weekdays(fields[4])
    )
}

/// Replace numeric crontab weekdays (Sunday is 0 or 7) by names, which mean the
/// same to the `cron` crate.
///
/// The crate has no day after Saturday, so numeric ranges ending on 7 are expanded
/// into a list of days.
fn weekdays(field: &str) -> String {
    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };
            if let Some(days) = through_sunday(range, step) {
                return days;
            }
            let range = range
                .split('-')
                .map(|day| match day.parse::<usize>() {
                    Ok(n) if n <= 7 => WEEKDAYS[n % 7].to_string(),
                    _ => day.to_string(),
                })
                .collect::<Vec<_>>()
                .join("-");
            match step {
                Some(step) => format!("{range}/{step}"),
                None => range,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Expand a numeric `lo-7[/step]` range into day names, `None` for anything else.
fn through_sunday(range: &str, step: Option<&str>) -> Option<String> {
    let (lo, hi) = range.split_once('-')?;
    let (lo, hi) = (lo.parse::<usize>().ok()?, hi.parse::<usize>().ok()?);
    if hi != 7 || lo > hi {
        return None;
    }
    let step = match step {
        Some(step) => step.parse::<usize>().ok().filter(|s| *s > 0)?,
        None => 1,
    };
    let mut days: Vec<&str> = Vec::default();
    for n in (lo..=hi).step_by(step) {
        let day = WEEKDAYS[n % 7];
        if !days.contains(&day) {
            days.push(day);
        }
    }
    Some(days.join(","))
}
