//! Device sleep window evaluation.
//!
//! Pure functions only: callers pass the device configuration, the owner's
//! timezone and the instant to evaluate. The diagnostics endpoint uses the
//! same entry points to preview arbitrary instants.

use crate::models::Device;
use crate::services::time_window::TimeWindow;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SleepConfig {
    pub enabled: bool,
    pub start: Option<String>,
    pub end: Option<String>,
    pub show_screen: bool,
}

impl From<&Device> for SleepConfig {
    fn from(device: &Device) -> Self {
        Self {
            enabled: device.sleep_enabled,
            start: device.sleep_start_time.clone(),
            end: device.sleep_end_time.clone(),
            show_screen: device.sleep_show_screen,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SleepState {
    pub enabled: bool,
    pub start: Option<String>,
    pub end: Option<String>,
    pub show_screen: bool,
    pub currently_sleeping: bool,
    /// True when the device should get the sleep screen instead of an item.
    pub serving_sleep_screen: bool,
}

/// Resolves the owner's timezone, falling back to UTC.
pub fn owner_timezone(timezone: Option<&str>) -> Tz {
    match timezone {
        Some(name) => name.parse().unwrap_or_else(|_| {
            tracing::warn!("Unknown owner timezone '{}', falling back to UTC", name);
            chrono_tz::UTC
        }),
        None => chrono_tz::UTC,
    }
}

pub fn is_sleeping(config: &SleepConfig, tz: Tz, instant: DateTime<Utc>) -> bool {
    if !config.enabled {
        return false;
    }

    let (Some(start), Some(end)) = (config.start.as_deref(), config.end.as_deref()) else {
        return false;
    };

    match TimeWindow::parse(start, end) {
        Ok(window) => window.contains(instant.with_timezone(&tz).time()),
        Err(e) => {
            tracing::warn!("Ignoring malformed sleep window {}-{}: {}", start, end, e);
            false
        }
    }
}

pub fn evaluate(config: &SleepConfig, tz: Tz, instant: DateTime<Utc>) -> SleepState {
    let currently_sleeping = is_sleeping(config, tz, instant);
    SleepState {
        enabled: config.enabled,
        start: config.start.clone(),
        end: config.end.clone(),
        show_screen: config.show_screen,
        currently_sleeping,
        serving_sleep_screen: currently_sleeping && !config.show_screen,
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FirmwareWindowState {
    pub start: Option<String>,
    pub end: Option<String>,
    pub active: bool,
}

/// The firmware-update window shares the time comparison with sleep but has
/// no influence on content selection.
pub fn firmware_window(device: &Device, tz: Tz, instant: DateTime<Utc>) -> FirmwareWindowState {
    let active = match (
        device.firmware_update_start_time.as_deref(),
        device.firmware_update_end_time.as_deref(),
    ) {
        (Some(start), Some(end)) => TimeWindow::parse(start, end)
            .map(|w| w.contains(instant.with_timezone(&tz).time()))
            .unwrap_or(false),
        _ => false,
    };

    FirmwareWindowState {
        start: device.firmware_update_start_time.clone(),
        end: device.firmware_update_end_time.clone(),
        active,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config(start: &str, end: &str, show_screen: bool) -> SleepConfig {
        SleepConfig {
            enabled: true,
            start: Some(start.to_string()),
            end: Some(end.to_string()),
            show_screen,
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
    }

    #[test]
    fn test_overnight_sleep_window() {
        let cfg = config("22:00", "06:00", false);
        assert!(is_sleeping(&cfg, chrono_tz::UTC, at(23, 30)));
        assert!(is_sleeping(&cfg, chrono_tz::UTC, at(5, 30)));
        assert!(!is_sleeping(&cfg, chrono_tz::UTC, at(6, 0)));
        assert!(!is_sleeping(&cfg, chrono_tz::UTC, at(21, 59)));
    }

    #[test]
    fn test_disabled_or_incomplete_never_sleeps() {
        let mut cfg = config("00:00", "23:59", false);
        cfg.enabled = false;
        assert!(!is_sleeping(&cfg, chrono_tz::UTC, at(12, 0)));

        let cfg = SleepConfig {
            enabled: true,
            start: Some("22:00".to_string()),
            end: None,
            show_screen: false,
        };
        assert!(!is_sleeping(&cfg, chrono_tz::UTC, at(23, 0)));
    }

    #[test]
    fn test_malformed_window_is_awake() {
        let cfg = config("late", "06:00", false);
        assert!(!is_sleeping(&cfg, chrono_tz::UTC, at(23, 0)));
    }

    #[test]
    fn test_evaluated_in_owner_timezone() {
        // 21:30 UTC is 22:30 in Berlin during winter time.
        let cfg = config("22:00", "06:00", false);
        let tz = owner_timezone(Some("Europe/Berlin"));
        assert!(is_sleeping(&cfg, tz, at(21, 30)));
        assert!(!is_sleeping(&cfg, chrono_tz::UTC, at(21, 30)));
    }

    #[test]
    fn test_unknown_owner_timezone_falls_back_to_utc() {
        assert_eq!(owner_timezone(Some("Mars/Olympus")), chrono_tz::UTC);
        assert_eq!(owner_timezone(None), chrono_tz::UTC);
    }

    #[test]
    fn test_show_screen_controls_sleep_screen() {
        let hidden = evaluate(&config("22:00", "06:00", false), chrono_tz::UTC, at(23, 0));
        assert!(hidden.currently_sleeping);
        assert!(hidden.serving_sleep_screen);

        let shown = evaluate(&config("22:00", "06:00", true), chrono_tz::UTC, at(23, 0));
        assert!(shown.currently_sleeping);
        assert!(!shown.serving_sleep_screen);

        let awake = evaluate(&config("22:00", "06:00", false), chrono_tz::UTC, at(12, 0));
        assert!(!awake.currently_sleeping);
        assert!(!awake.serving_sleep_screen);
    }
}
