//! Device-facing rotation: which screen a device should draw next.

use crate::config::DisplayConfig;
use crate::models::{Device, PlaylistItem};
use crate::services::notifications::DeviceEvent;
use crate::services::schedule_matcher::{active_items, default_playlist};
use crate::services::sleep_window::{evaluate, owner_timezone, SleepConfig};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "screen", rename_all = "snake_case")]
pub enum Screen {
    Sleep,
    Empty,
    Item {
        item: PlaylistItem,
        rendered_at: Option<chrono::NaiveDateTime>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct NextScreen {
    #[serde(flatten)]
    pub screen: Screen,
    /// Seconds until the device should ask again.
    pub refresh_secs: i32,
    /// True when the current-item pointer moved.
    #[serde(skip)]
    pub advanced: bool,
}

impl NextScreen {
    pub fn item_id(&self) -> Option<i32> {
        match &self.screen {
            Screen::Item { item, .. } => Some(item.id),
            _ => None,
        }
    }
}

/// Picks the item after the current one in the active set, by identity. An
/// unknown or filtered-out current item restarts from the top.
pub fn next_in_rotation(items: &[PlaylistItem], current: Option<i32>) -> Option<&PlaylistItem> {
    let position = current.and_then(|id| items.iter().position(|i| i.id == id));
    match position {
        Some(idx) => items.get((idx + 1) % items.len()),
        None => items.first(),
    }
}

/// The owner's timezone; unowned devices run on UTC.
pub fn device_timezone(conn: &mut SqliteConnection, device: &Device) -> QueryResult<Tz> {
    use crate::schema::users;

    let owner_tz: Option<String> = match device.owner_id {
        Some(owner_id) => users::table
            .find(owner_id)
            .select(users::timezone)
            .first::<Option<String>>(conn)
            .optional()?
            .flatten(),
        None => None,
    };
    Ok(owner_timezone(owner_tz.as_deref()))
}

pub fn settings_event(conn: &mut SqliteConnection, device: &Device, at: DateTime<Utc>) -> QueryResult<DeviceEvent> {
    let tz = device_timezone(conn, device)?;
    let settings = evaluate(&SleepConfig::from(device), tz, at);
    Ok(DeviceEvent::settings_updated(device.id, settings, at))
}

/// Snapshot of the default playlist's order after items moved, arrived in
/// bulk, or went away.
pub fn reorder_event(conn: &mut SqliteConnection, device_id: i32, at: DateTime<Utc>) -> QueryResult<DeviceEvent> {
    use crate::schema::playlist_items::dsl;

    let item_ids = match default_playlist(conn, device_id)? {
        Some(playlist) => dsl::playlist_items
            .filter(dsl::playlist_id.eq(playlist.id))
            .order((dsl::item_order.asc(), dsl::id.asc()))
            .select(dsl::id)
            .load(conn)?,
        None => Vec::new(),
    };
    Ok(DeviceEvent::items_reordered(device_id, item_ids, at))
}

/// Advances the device to its next screen and records that it checked in.
/// A sleeping device that hides content gets the sleep screen and keeps its
/// position.
pub fn next_screen(
    conn: &mut SqliteConnection,
    device: &Device,
    config: &DisplayConfig,
    now: DateTime<Utc>,
) -> QueryResult<NextScreen> {
    use crate::schema::devices::dsl as devices;
    use crate::schema::rendered_content::dsl as content;

    conn.transaction(|conn| {
        let tz = device_timezone(conn, device)?;

        diesel::update(devices::devices.find(device.id))
            .set(devices::last_seen_at.eq(Some(now.naive_utc())))
            .execute(conn)?;

        let sleep = evaluate(&SleepConfig::from(device), tz, now);
        if sleep.serving_sleep_screen {
            return Ok(NextScreen {
                screen: Screen::Sleep,
                refresh_secs: config.sleep_refresh_secs,
                advanced: false,
            });
        }

        let active = active_items(conn, device.id, now)?;
        let current = active.current_item.as_ref().map(|i| i.id);
        let Some(next) = next_in_rotation(&active.items, current).cloned() else {
            return Ok(NextScreen {
                screen: Screen::Empty,
                refresh_secs: config.default_duration_secs,
                advanced: false,
            });
        };

        let advanced = device.last_playlist_item_id != Some(next.id);
        if advanced {
            diesel::update(devices::devices.find(device.id))
                .set(devices::last_playlist_item_id.eq(Some(next.id)))
                .execute(conn)?;
        }

        let rendered_at = content::rendered_content
            .filter(content::plugin_instance_id.eq(next.plugin_instance_id))
            .select(content::rendered_at)
            .first(conn)
            .optional()?;

        Ok(NextScreen {
            refresh_secs: next.duration_override.unwrap_or(config.default_duration_secs),
            screen: Screen::Item { item: next, rendered_at },
            advanced,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{self, TestDb};
    use crate::models::Playlist;
    use crate::schema::{devices, playlist_items};
    use chrono::TimeZone;

    fn monday(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, 0, 0).unwrap()
    }

    fn reload(conn: &mut SqliteConnection, id: i32) -> Device {
        devices::table
            .find(id)
            .select(Device::as_select())
            .first(conn)
            .unwrap()
    }

    fn setup(db: &TestDb) -> (Device, Playlist, Vec<PlaylistItem>) {
        let mut conn = db.conn();
        let owner = test_support::user(&mut conn, "viewer", None);
        let def = test_support::definition(&mut conn, "photos");
        let inst = test_support::instance(&mut conn, &owner, &def, "15m");
        let (device, playlist) = test_support::device(&mut conn, &owner, "d-1");
        let items = (1..=3)
            .map(|order| test_support::item(&mut conn, &playlist, &inst, order, true))
            .collect();
        (device, playlist, items)
    }

    #[test]
    fn test_rotation_advances_and_wraps() {
        let db = TestDb::new();
        let (device, _, items) = setup(&db);
        let mut conn = db.conn();
        let config = DisplayConfig::default();

        let mut seen = Vec::new();
        for _ in 0..4 {
            let device = reload(&mut conn, device.id);
            let next = next_screen(&mut conn, &device, &config, monday(10)).unwrap();
            assert!(next.advanced);
            seen.push(next.item_id().unwrap());
        }

        assert_eq!(seen, vec![items[0].id, items[1].id, items[2].id, items[0].id]);
        assert!(reload(&mut conn, device.id).last_seen_at.is_some());
    }

    #[test]
    fn test_rotation_survives_reorder_and_deletion() {
        let db = TestDb::new();
        let (device, _, items) = setup(&db);
        let mut conn = db.conn();
        let config = DisplayConfig::default();

        // Currently on the second item; move it to the end.
        diesel::update(devices::table.find(device.id))
            .set(devices::last_playlist_item_id.eq(Some(items[1].id)))
            .execute(&mut conn)
            .unwrap();
        diesel::update(playlist_items::table.find(items[1].id))
            .set(playlist_items::item_order.eq(10))
            .execute(&mut conn)
            .unwrap();

        let current = reload(&mut conn, device.id);
        let next = next_screen(&mut conn, &current, &config, monday(10)).unwrap();
        assert_eq!(next.item_id(), Some(items[0].id));

        // Deleting the current item clears the pointer; rotation restarts.
        diesel::delete(playlist_items::table.find(items[0].id)).execute(&mut conn).unwrap();
        let device = reload(&mut conn, device.id);
        assert_eq!(device.last_playlist_item_id, None);
        let next = next_screen(&mut conn, &device, &config, monday(10)).unwrap();
        assert_eq!(next.item_id(), Some(items[2].id));
    }

    #[test]
    fn test_sleep_screen_keeps_position() {
        let db = TestDb::new();
        let (device, _, items) = setup(&db);
        let mut conn = db.conn();
        diesel::update(devices::table.find(device.id))
            .set((
                devices::sleep_enabled.eq(true),
                devices::sleep_start_time.eq(Some("22:00")),
                devices::sleep_end_time.eq(Some("06:00")),
                devices::sleep_show_screen.eq(false),
                devices::last_playlist_item_id.eq(Some(items[0].id)),
            ))
            .execute(&mut conn)
            .unwrap();

        let config = DisplayConfig::default();
        let current = reload(&mut conn, device.id);
        let next = next_screen(&mut conn, &current, &config, monday(23)).unwrap();
        assert_eq!(next.screen, Screen::Sleep);
        assert_eq!(next.refresh_secs, config.sleep_refresh_secs);
        assert_eq!(reload(&mut conn, device.id).last_playlist_item_id, Some(items[0].id));

        // Sleep that still shows content keeps rotating.
        diesel::update(devices::table.find(device.id))
            .set(devices::sleep_show_screen.eq(true))
            .execute(&mut conn)
            .unwrap();
        let current = reload(&mut conn, device.id);
        let next = next_screen(&mut conn, &current, &config, monday(23)).unwrap();
        assert_eq!(next.item_id(), Some(items[1].id));
    }

    #[test]
    fn test_empty_playlist_and_duration_override() {
        let db = TestDb::new();
        let (device, _, items) = setup(&db);
        let mut conn = db.conn();
        let config = DisplayConfig::default();

        diesel::update(playlist_items::table.find(items[0].id))
            .set(playlist_items::duration_override.eq(Some(60)))
            .execute(&mut conn)
            .unwrap();
        let next = next_screen(&mut conn, &device, &config, monday(10)).unwrap();
        assert_eq!(next.refresh_secs, 60);

        diesel::update(playlist_items::table)
            .set(playlist_items::is_visible.eq(false))
            .execute(&mut conn)
            .unwrap();
        let current = reload(&mut conn, device.id);
        let next = next_screen(&mut conn, &current, &config, monday(10)).unwrap();
        assert_eq!(next.screen, Screen::Empty);
        assert!(!next.advanced);
    }

    #[test]
    fn test_settings_event_uses_owner_timezone() {
        let db = TestDb::new();
        let mut conn = db.conn();
        let owner = test_support::user(&mut conn, "east", Some("America/New_York"));
        let (device, _) = test_support::device(&mut conn, &owner, "ny-1");
        diesel::update(devices::table.find(device.id))
            .set((
                devices::sleep_enabled.eq(true),
                devices::sleep_start_time.eq(Some("22:00")),
                devices::sleep_end_time.eq(Some("06:00")),
            ))
            .execute(&mut conn)
            .unwrap();
        let device = reload(&mut conn, device.id);

        // 23:00 UTC is 18:00 in New York.
        let DeviceEvent::DeviceSettingsUpdated { device_id, settings, .. } =
            settings_event(&mut conn, &device, monday(23)).unwrap()
        else {
            panic!("expected a settings event");
        };
        assert_eq!(device_id, device.id);
        assert!(settings.enabled);
        assert_eq!(settings.start.as_deref(), Some("22:00"));
        assert!(!settings.currently_sleeping);
    }

    #[test]
    fn test_reorder_event_lists_display_order() {
        let db = TestDb::new();
        let (device, _, items) = setup(&db);
        let mut conn = db.conn();
        diesel::update(playlist_items::table.find(items[0].id))
            .set(playlist_items::item_order.eq(10))
            .execute(&mut conn)
            .unwrap();

        let event = reorder_event(&mut conn, device.id, monday(10)).unwrap();
        assert_eq!(
            event,
            DeviceEvent::items_reordered(device.id, vec![items[1].id, items[2].id, items[0].id], monday(10))
        );

        let orphan = reorder_event(&mut conn, device.id + 100, monday(10)).unwrap();
        assert_eq!(orphan, DeviceEvent::items_reordered(device.id + 100, Vec::new(), monday(10)));
    }

    #[test]
    fn test_next_in_rotation_by_identity() {
        let db = TestDb::new();
        let (_, _, items) = setup(&db);

        assert!(next_in_rotation(&[], Some(items[0].id)).is_none());
        assert_eq!(next_in_rotation(&items, None).map(|i| i.id), Some(items[0].id));
        assert_eq!(next_in_rotation(&items, Some(items[2].id)).map(|i| i.id), Some(items[0].id));
        assert_eq!(next_in_rotation(&items, Some(-1)).map(|i| i.id), Some(items[0].id));
        assert_eq!(next_in_rotation(&items[..1], Some(items[0].id)).map(|i| i.id), Some(items[0].id));
    }
}
