//! Time-of-day windows and weekday masks shared by schedules, the sleep
//! window and the firmware-update window.
//!
//! Windows are `[start, end)`. When `end <= start` the window wraps past
//! midnight, so `22:00-06:00` covers late evening and early morning and
//! `00:00-00:00` covers the whole day.

use chrono::{NaiveTime, Weekday};
use std::fmt;

pub const HHMM_FORMAT: &str = "%H:%M";

pub fn parse_hhmm(value: &str) -> Result<NaiveTime, chrono::ParseError> {
    NaiveTime::parse_from_str(value.trim(), HHMM_FORMAT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, chrono::ParseError> {
        Ok(Self::new(parse_hhmm(start)?, parse_hhmm(end)?))
    }

    pub fn wraps_midnight(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.wraps_midnight() {
            time >= self.start || time < self.end
        } else {
            time >= self.start && time < self.end
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            self.start.format(HHMM_FORMAT),
            self.end.format(HHMM_FORMAT)
        )
    }
}

/// Seven-bit weekday set. Bit 0 is Monday, bit 6 is Sunday
/// (`Weekday::num_days_from_monday`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayMask(u8);

impl DayMask {
    pub const ALL: DayMask = DayMask(0b111_1111);
    pub const WEEKDAYS: DayMask = DayMask(0b001_1111);
    pub const WEEKEND: DayMask = DayMask(0b110_0000);

    /// Rejects empty masks and anything with bits above Sunday.
    pub fn from_bits(bits: i32) -> Option<Self> {
        if (1..=0b111_1111).contains(&bits) {
            Some(Self(bits as u8))
        } else {
            None
        }
    }

    pub fn from_days(days: &[Weekday]) -> Option<Self> {
        let bits = days
            .iter()
            .fold(0i32, |acc, d| acc | (1 << d.num_days_from_monday()));
        Self::from_bits(bits)
    }

    pub fn bits(&self) -> i32 {
        self.0 as i32
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn test_daytime_window_is_end_exclusive() {
        let window = TimeWindow::parse("09:00", "17:00").unwrap();
        assert!(!window.wraps_midnight());
        assert!(window.contains(t(9, 0, 0)));
        assert!(window.contains(t(16, 59, 59)));
        assert!(!window.contains(t(17, 0, 0)));
        assert!(!window.contains(t(8, 59, 59)));
    }

    #[test]
    fn test_overnight_window_wraps() {
        let window = TimeWindow::parse("22:00", "06:00").unwrap();
        assert!(window.wraps_midnight());
        assert!(window.contains(t(23, 30, 0)));
        assert!(window.contains(t(5, 30, 0)));
        assert!(window.contains(t(0, 0, 0)));
        assert!(!window.contains(t(6, 0, 0)));
        assert!(!window.contains(t(21, 59, 0)));
    }

    #[test]
    fn test_equal_bounds_cover_whole_day() {
        let window = TimeWindow::parse("00:00", "00:00").unwrap();
        assert!(window.contains(t(0, 0, 0)));
        assert!(window.contains(t(12, 0, 0)));
        assert!(window.contains(t(23, 59, 59)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_hhmm("25:00").is_err());
        assert!(parse_hhmm("noon").is_err());
        assert!(parse_hhmm("").is_err());
        assert_eq!(parse_hhmm(" 07:30 ").unwrap(), t(7, 30, 0));
    }

    #[test]
    fn test_day_mask_bits_start_on_monday() {
        let monday_only = DayMask::from_bits(1).unwrap();
        assert!(monday_only.contains(Weekday::Mon));
        assert!(!monday_only.contains(Weekday::Sun));

        assert!(DayMask::WEEKDAYS.contains(Weekday::Fri));
        assert!(!DayMask::WEEKDAYS.contains(Weekday::Sat));
        assert!(DayMask::WEEKEND.contains(Weekday::Sun));
        assert_eq!(
            DayMask::from_days(&[Weekday::Sat, Weekday::Sun]),
            Some(DayMask::WEEKEND)
        );
    }

    #[test]
    fn test_day_mask_range() {
        assert!(DayMask::from_bits(0).is_none());
        assert!(DayMask::from_bits(128).is_none());
        assert!(DayMask::from_bits(-1).is_none());
        assert_eq!(DayMask::from_bits(127), Some(DayMask::ALL));
    }

    #[test]
    fn test_window_display() {
        let window = TimeWindow::parse("22:00", "06:00").unwrap();
        assert_eq!(window.to_string(), "22:00-06:00");
    }
}
