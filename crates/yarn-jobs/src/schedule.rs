use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use yarn_types::config::parse_duration;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid interval {0:?}")]
    InvalidInterval(String),

    #[error("invalid cron expression {expr:?}: {source}")]
    InvalidCron {
        expr: String,
        #[source]
        source: cron::error::Error,
    },
}

/// When a job runs: a fixed interval (`@every 5m`) or a cron expression
/// with a leading seconds field (`0 0 1 * * Sun`, `@hourly`).
#[derive(Debug, Clone)]
pub enum Schedule {
    Every(Duration),
    Cron(Box<cron::Schedule>),
}

impl Schedule {
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let expr = expr.trim();
        if let Some(interval) = expr.strip_prefix("@every") {
            return match parse_duration(interval) {
                Some(d) if !d.is_zero() => Ok(Self::Every(d)),
                _ => Err(ScheduleError::InvalidInterval(expr.to_owned())),
            };
        }
        cron::Schedule::from_str(expr)
            .map(|s| Self::Cron(Box::new(s)))
            .map_err(|source| ScheduleError::InvalidCron {
                expr: expr.to_owned(),
                source,
            })
    }

    /// Next run strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Every(d) => TimeDelta::from_std(*d).ok().and_then(|d| now.checked_add_signed(d)),
            Self::Cron(s) => s.after(&now).next(),
        }
    }
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
