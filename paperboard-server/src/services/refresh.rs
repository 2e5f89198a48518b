//! Plugin instance refresh cadence.
//!
//! `refresh_interval` accepts `"<n>m"`, `"<n>h"`, a bare number of minutes,
//! `"daily"`, `"daily@HH:MM"` and `"weekly"`. Daily and weekly cadences form
//! the daily family: out-of-band renders for them are independent and leave
//! the fixed slot alone.

use crate::services::time_window::parse_hhmm;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use chrono_tz::Tz;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshCadence {
    Interval(Duration),
    Daily { at: Option<NaiveTime> },
    Weekly,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CadenceParseError {
    #[error("'{0}' is not a recognised refresh interval")]
    Unrecognised(String),
    #[error("interval must be at least one minute")]
    TooShort,
    #[error("interval must not exceed 365 days")]
    TooLong,
}

/// Longest accepted interval: 365 days.
pub const MAX_INTERVAL_MINUTES: i64 = 365 * 24 * 60;

impl FromStr for RefreshCadence {
    type Err = CadenceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_ascii_lowercase();
        let unrecognised = || CadenceParseError::Unrecognised(s.to_string());

        if value == "weekly" {
            return Ok(Self::Weekly);
        }
        if value == "daily" {
            return Ok(Self::Daily { at: None });
        }
        if let Some(time) = value.strip_prefix("daily@") {
            let at = parse_hhmm(time).map_err(|_| unrecognised())?;
            return Ok(Self::Daily { at: Some(at) });
        }

        let (digits, minutes_per_unit) = if let Some(d) = value.strip_suffix('h') {
            (d, 60)
        } else if let Some(d) = value.strip_suffix('m') {
            (d, 1)
        } else {
            (value.as_str(), 1)
        };

        let count: i64 = digits.parse().map_err(|_| unrecognised())?;
        if count < 1 {
            return Err(CadenceParseError::TooShort);
        }
        let minutes = count
            .checked_mul(minutes_per_unit)
            .filter(|m| *m <= MAX_INTERVAL_MINUTES)
            .ok_or(CadenceParseError::TooLong)?;
        Duration::try_minutes(minutes)
            .map(Self::Interval)
            .ok_or(CadenceParseError::TooLong)
    }
}

impl RefreshCadence {
    pub fn is_daily_family(&self) -> bool {
        matches!(self, Self::Daily { .. } | Self::Weekly)
    }

    /// Next regular render after `from`. Fixed daily slots are interpreted in
    /// the owner's timezone. An interval that would leave the representable
    /// range falls back to one day.
    pub fn next_due(&self, from: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
        let after = |delta: Duration| {
            from.checked_add_signed(delta)
                .or_else(|| from.checked_add_signed(Duration::days(1)))
                .unwrap_or(from)
        };

        match self {
            Self::Interval(every) => after(*every),
            Self::Weekly => after(Duration::days(7)),
            Self::Daily { at: None } => after(Duration::days(1)),
            Self::Daily { at: Some(at) } => {
                let local_date = from.with_timezone(&tz).date_naive();
                // Today's slot if still ahead, otherwise tomorrow's.
                [Some(local_date), local_date.succ_opt()]
                    .into_iter()
                    .flatten()
                    .filter_map(|d| d.and_time(*at).and_local_timezone(tz).earliest())
                    .map(|local| local.with_timezone(&Utc))
                    .find(|candidate| *candidate > from)
                    .unwrap_or_else(|| after(Duration::days(1)))
            }
        }
    }
}

/// Falls back to the default cadence when the stored value no longer parses.
pub fn cadence_or_default(value: &str) -> RefreshCadence {
    value.parse().unwrap_or_else(|e| {
        tracing::warn!("{}; using 15 minute refresh", e);
        RefreshCadence::Interval(Duration::minutes(15))
    })
}
