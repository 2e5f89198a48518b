//! Resolves which playlist items are on rotation for a device at an instant.
//!
//! Resolution reads the store and never writes. Malformed schedules are
//! skipped with a warning so one bad row cannot blank a whole device.

use crate::models::{Playlist, PlaylistItem, Schedule};
use crate::services::time_window::{DayMask, TimeWindow};
use chrono::{DateTime, Datelike, Utc};
use chrono_tz::Tz;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Serialize)]
pub struct ActiveItems {
    pub playlist_id: Option<i32>,
    pub items: Vec<PlaylistItem>,
    pub current_item: Option<PlaylistItem>,
    pub visible_count: usize,
    pub active_count: usize,
}

impl ActiveItems {
    fn empty() -> Self {
        Self {
            playlist_id: None,
            items: Vec::new(),
            current_item: None,
            visible_count: 0,
            active_count: 0,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("day_mask {0} is outside 1..=127")]
    DayMask(i32),
    #[error("time window {0}-{1} is not HH:MM")]
    Window(String, String),
    #[error("unknown timezone {0}")]
    Timezone(String),
}

/// A schedule row parsed into something that can be tested against instants.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleRule {
    days: DayMask,
    window: TimeWindow,
    tz: Tz,
}

impl ScheduleRule {
    pub fn from_schedule(schedule: &Schedule) -> Result<Self, RuleError> {
        let days = DayMask::from_bits(schedule.day_mask).ok_or(RuleError::DayMask(schedule.day_mask))?;
        let window = TimeWindow::parse(&schedule.start_time, &schedule.end_time).map_err(|_| {
            RuleError::Window(schedule.start_time.clone(), schedule.end_time.clone())
        })?;
        let tz = schedule
            .timezone
            .parse::<Tz>()
            .map_err(|_| RuleError::Timezone(schedule.timezone.clone()))?;
        Ok(Self { days, window, tz })
    }

    /// Weekday and time of day are both taken in the schedule's timezone. An
    /// overnight window only matches on the weekday the local clock shows.
    pub fn matches(&self, instant: DateTime<Utc>) -> bool {
        let local = instant.with_timezone(&self.tz);
        self.days.contains(local.weekday()) && self.window.contains(local.time())
    }
}

/// An item is eligible when it has no active schedules, or when any active,
/// well-formed schedule matches.
pub fn is_item_eligible(schedules: &[Schedule], instant: DateTime<Utc>) -> bool {
    let mut active = schedules.iter().filter(|s| s.is_active).peekable();
    if active.peek().is_none() {
        return true;
    }

    active.any(|schedule| match ScheduleRule::from_schedule(schedule) {
        Ok(rule) => rule.matches(instant),
        Err(e) => {
            tracing::warn!(
                "Skipping malformed schedule {} on item {}: {}",
                schedule.id,
                schedule.playlist_item_id,
                e
            );
            false
        }
    })
}

pub fn default_playlist(
    conn: &mut SqliteConnection,
    device_id: i32,
) -> QueryResult<Option<Playlist>> {
    use crate::schema::playlists::dsl;

    dsl::playlists
        .filter(dsl::device_id.eq(device_id))
        .filter(dsl::is_default.eq(true))
        .select(Playlist::as_select())
        .first(conn)
        .optional()
}

pub fn schedules_by_item(
    conn: &mut SqliteConnection,
    item_ids: &[i32],
) -> QueryResult<HashMap<i32, Vec<Schedule>>> {
    use crate::schema::schedules::dsl;

    let rows = dsl::schedules
        .filter(dsl::playlist_item_id.eq_any(item_ids))
        .order(dsl::id.asc())
        .select(Schedule::as_select())
        .load(conn)?;

    let mut grouped: HashMap<i32, Vec<Schedule>> = HashMap::new();
    for row in rows {
        grouped.entry(row.playlist_item_id).or_default().push(row);
    }
    Ok(grouped)
}

pub fn active_items(
    conn: &mut SqliteConnection,
    device_id: i32,
    instant: DateTime<Utc>,
) -> QueryResult<ActiveItems> {
    use crate::schema::devices::dsl as devices_dsl;
    use crate::schema::playlist_items::dsl as items_dsl;

    // Fails with NotFound for an unknown device; everything below degrades.
    let current_id: Option<i32> = devices_dsl::devices
        .filter(devices_dsl::id.eq(device_id))
        .select(devices_dsl::last_playlist_item_id)
        .first(conn)?;

    let Some(playlist) = default_playlist(conn, device_id)? else {
        tracing::debug!("Device {} has no default playlist", device_id);
        return Ok(ActiveItems::empty());
    };

    let visible: Vec<PlaylistItem> = items_dsl::playlist_items
        .filter(items_dsl::playlist_id.eq(playlist.id))
        .filter(items_dsl::is_visible.eq(true))
        .order((items_dsl::item_order.asc(), items_dsl::id.asc()))
        .select(PlaylistItem::as_select())
        .load(conn)?;

    let item_ids: Vec<i32> = visible.iter().map(|i| i.id).collect();
    let schedules = schedules_by_item(conn, &item_ids)?;

    let visible_count = visible.len();
    let items: Vec<PlaylistItem> = visible
        .into_iter()
        .filter(|item| {
            let item_schedules = schedules.get(&item.id).map(Vec::as_slice).unwrap_or(&[]);
            is_item_eligible(item_schedules, instant)
        })
        .collect();

    // Identity lookup: the pointer survives reordering, and a pointer to an
    // item that is hidden, out of schedule or deleted simply resolves to None.
    let current_item = current_id.and_then(|id| items.iter().find(|i| i.id == id).cloned());

    tracing::debug!(
        "Device {} at {}: {} of {} visible items active",
        device_id,
        instant.to_rfc3339(),
        items.len(),
        visible_count
    );

    Ok(ActiveItems {
        playlist_id: Some(playlist.id),
        active_count: items.len(),
        items,
        current_item,
        visible_count,
    })
}
