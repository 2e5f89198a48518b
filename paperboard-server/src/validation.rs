//! Write-time validation. Every failure names the offending field so the
//! API can report it back verbatim.

use crate::error::{AppError, AppResult};
use crate::services::refresh::RefreshCadence;
use crate::services::time_window::{parse_hhmm, DayMask};
use chrono::NaiveTime;
use chrono_tz::Tz;

pub fn time_of_day(field: &'static str, value: &str) -> AppResult<NaiveTime> {
    parse_hhmm(value).map_err(|_| AppError::validation(field, format!("'{}' is not HH:MM", value)))
}

pub fn timezone(field: &'static str, value: &str) -> AppResult<Tz> {
    value
        .parse::<Tz>()
        .map_err(|_| AppError::validation(field, format!("'{}' is not an IANA timezone", value)))
}

pub fn day_mask(value: i32) -> AppResult<DayMask> {
    DayMask::from_bits(value).ok_or_else(|| {
        AppError::validation("day_mask", format!("{} is outside 1..=127", value))
    })
}

/// Both ends set (and valid) or both absent.
pub fn optional_window(
    start_field: &'static str,
    start: Option<&str>,
    end_field: &'static str,
    end: Option<&str>,
) -> AppResult<()> {
    match (start, end) {
        (Some(s), Some(e)) => {
            time_of_day(start_field, s)?;
            time_of_day(end_field, e)?;
            Ok(())
        }
        (None, None) => Ok(()),
        (None, Some(_)) => Err(AppError::validation(start_field, "required when an end time is set")),
        (Some(_), None) => Err(AppError::validation(end_field, "required when a start time is set")),
    }
}

pub fn refresh_interval(value: &str) -> AppResult<RefreshCadence> {
    value
        .parse::<RefreshCadence>()
        .map_err(|e| AppError::validation("refresh_interval", e.to_string()))
}

pub fn settings_json(value: &serde_json::Value) -> AppResult<String> {
    if !value.is_object() {
        return Err(AppError::validation("settings", "must be a JSON object"));
    }
    Ok(value.to_string())
}

pub fn duration_override(value: Option<i32>) -> AppResult<Option<i32>> {
    match value {
        Some(secs) if secs <= 0 => Err(AppError::validation(
            "duration_override",
            "must be a positive number of seconds",
        )),
        other => Ok(other),
    }
}
