//! Device mirroring.
//!
//! A mirroring device carries copies of the source's visible items in its own
//! default playlist. Copies are tagged with `mirrored_from_item_id`, so a sync
//! updates them in place, adds new ones and drops the ones whose source item
//! is gone. Items the target owner added directly are never touched.

use crate::error::{AppError, AppResult};
use crate::models::{Device, NewPlaylistItem, NewSchedule, PlaylistItem, Schedule};
use crate::services::schedule_matcher::{default_playlist, schedules_by_item};
use chrono::{DateTime, NaiveDateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SyncSummary {
    pub target_id: i32,
    pub source_id: i32,
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
    pub synced_at: Option<NaiveDateTime>,
}

fn load_device(conn: &mut SqliteConnection, device_id: i32) -> AppResult<Device> {
    use crate::schema::devices::dsl;

    dsl::devices
        .find(device_id)
        .select(Device::as_select())
        .first(conn)
        .optional()?
        .ok_or(AppError::NotFound("device"))
}

fn ensure_can_mirror(source: &Device) -> AppResult<()> {
    if !source.is_shareable || !source.is_claimed {
        return Err(AppError::validation(
            "source_friendly_id",
            format!("device '{}' is not shared", source.friendly_id),
        ));
    }
    Ok(())
}

/// Links `target_id` to the device known as `source_friendly_id` and copies
/// its visible items. Runs in one transaction.
pub fn mirror(
    conn: &mut SqliteConnection,
    target_id: i32,
    source_friendly_id: &str,
    now: DateTime<Utc>,
) -> AppResult<SyncSummary> {
    use crate::schema::devices::dsl;

    conn.transaction(|conn| {
        let target = load_device(conn, target_id)?;
        let source = dsl::devices
            .filter(dsl::friendly_id.eq(source_friendly_id))
            .select(Device::as_select())
            .first(conn)
            .optional()?
            .ok_or(AppError::NotFound("source device"))?;

        if source.id == target.id {
            return Err(AppError::validation("source_friendly_id", "a device cannot mirror itself"));
        }
        ensure_can_mirror(&source)?;

        // Switching sources: the old source's copies do not belong here.
        if target.mirror_source_id.is_some_and(|id| id != source.id) {
            clear_mirrored_items(conn, target.id)?;
        }

        sync(conn, &source, &target, now)
    })
}

/// Repeats the copy for an existing link. Fails while the source is not
/// shared; the previous copies are left as they are.
pub fn resync(conn: &mut SqliteConnection, target_id: i32, now: DateTime<Utc>) -> AppResult<SyncSummary> {
    conn.transaction(|conn| {
        let target = load_device(conn, target_id)?;
        let Some(source_id) = target.mirror_source_id else {
            return Err(AppError::Conflict(format!("device {} is not mirroring", target_id)));
        };
        let source = load_device(conn, source_id)?;
        ensure_can_mirror(&source)?;

        sync(conn, &source, &target, now)
    })
}

/// Drops the copies and the link. Returns the number of removed items.
pub fn unmirror(conn: &mut SqliteConnection, target_id: i32, now: DateTime<Utc>) -> AppResult<usize> {
    use crate::schema::devices::dsl;

    conn.transaction(|conn| {
        let target = load_device(conn, target_id)?;
        if !target.is_mirroring() {
            return Err(AppError::Conflict(format!("device {} is not mirroring", target_id)));
        }

        let removed = clear_mirrored_items(conn, target.id)?;
        diesel::update(dsl::devices.find(target.id))
            .set((
                dsl::mirror_source_id.eq(None::<i32>),
                dsl::mirror_synced_at.eq(None::<NaiveDateTime>),
                dsl::updated_at.eq(now.naive_utc()),
            ))
            .execute(conn)?;
        Ok(removed)
    })
}

/// Toggles shareability. Turning it off also clears the copies on every
/// device mirroring this one, in the same transaction. The links stay so the
/// owners can see where their content came from; a resync fails until the
/// source is shared again. Returns the ids of the affected mirrors.
pub fn set_shareable(
    conn: &mut SqliteConnection,
    device_id: i32,
    shareable: bool,
    now: DateTime<Utc>,
) -> AppResult<Vec<i32>> {
    use crate::schema::devices::dsl;

    conn.transaction(|conn| {
        let updated = diesel::update(dsl::devices.find(device_id))
            .set((dsl::is_shareable.eq(shareable), dsl::updated_at.eq(now.naive_utc())))
            .execute(conn)?;
        if updated == 0 {
            return Err(AppError::NotFound("device"));
        }

        if shareable {
            return Ok(Vec::new());
        }

        let mirrors: Vec<i32> = dsl::devices
            .filter(dsl::mirror_source_id.eq(device_id))
            .select(dsl::id)
            .load(conn)?;

        for mirror_id in &mirrors {
            let removed = clear_mirrored_items(conn, *mirror_id)?;
            tracing::info!(
                "Device {} is no longer shared; removed {} mirrored items from device {}",
                device_id,
                removed,
                mirror_id
            );
        }
        Ok(mirrors)
    })
}

/// Deletes every copied item (and, by cascade, its schedules) from the
/// device's default playlist.
pub fn clear_mirrored_items(conn: &mut SqliteConnection, device_id: i32) -> QueryResult<usize> {
    use crate::schema::playlist_items::dsl;

    let Some(playlist) = default_playlist(conn, device_id)? else {
        return Ok(0);
    };

    diesel::delete(
        dsl::playlist_items
            .filter(dsl::playlist_id.eq(playlist.id))
            .filter(dsl::mirrored_from_item_id.is_not_null()),
    )
    .execute(conn)
}

fn sync(conn: &mut SqliteConnection, source: &Device, target: &Device, now: DateTime<Utc>) -> AppResult<SyncSummary> {
    use crate::schema::devices::dsl as devices;
    use crate::schema::playlist_items::dsl as items;

    let Some(target_playlist) = default_playlist(conn, target.id)? else {
        return Err(AppError::Conflict(format!("device {} has no default playlist", target.id)));
    };

    let source_items: Vec<PlaylistItem> = match default_playlist(conn, source.id)? {
        Some(playlist) => items::playlist_items
            .filter(items::playlist_id.eq(playlist.id))
            .filter(items::is_visible.eq(true))
            .order((items::item_order.asc(), items::id.asc()))
            .select(PlaylistItem::as_select())
            .load(conn)?,
        None => Vec::new(),
    };

    let existing: Vec<PlaylistItem> = items::playlist_items
        .filter(items::playlist_id.eq(target_playlist.id))
        .filter(items::mirrored_from_item_id.is_not_null())
        .select(PlaylistItem::as_select())
        .load(conn)?;
    let mut copies: HashMap<i32, PlaylistItem> = existing
        .into_iter()
        .filter_map(|item| item.mirrored_from_item_id.map(|origin| (origin, item)))
        .collect();

    let source_ids: Vec<i32> = source_items.iter().map(|i| i.id).collect();
    let source_schedules = schedules_by_item(conn, &source_ids)?;
    let copy_ids: Vec<i32> = copies.values().map(|c| c.id).collect();
    let copy_schedules = schedules_by_item(conn, &copy_ids)?;
    let stamp = now.naive_utc();

    let mut summary = SyncSummary {
        target_id: target.id,
        source_id: source.id,
        synced_at: Some(stamp),
        ..Default::default()
    };

    for item in &source_items {
        let (copy_id, changed) = match copies.remove(&item.id) {
            Some(copy) if is_current(&copy, item) => (copy.id, false),
            Some(copy) => {
                diesel::update(items::playlist_items.find(copy.id))
                    .set((
                        items::plugin_instance_id.eq(item.plugin_instance_id),
                        items::item_order.eq(item.item_order),
                        items::is_visible.eq(true),
                        items::importance.eq(item.importance),
                        items::duration_override.eq(item.duration_override),
                        items::updated_at.eq(stamp),
                    ))
                    .execute(conn)?;
                (copy.id, true)
            }
            None => {
                let copy: PlaylistItem = diesel::insert_into(items::playlist_items)
                    .values(&NewPlaylistItem {
                        playlist_id: target_playlist.id,
                        plugin_instance_id: item.plugin_instance_id,
                        item_order: item.item_order,
                        is_visible: true,
                        importance: item.importance,
                        duration_override: item.duration_override,
                        mirrored_from_item_id: Some(item.id),
                    })
                    .returning(PlaylistItem::as_select())
                    .get_result(conn)?;
                summary.inserted += 1;
                let schedules = source_schedules.get(&item.id).map(Vec::as_slice).unwrap_or(&[]);
                replace_schedules(conn, copy.id, schedules)?;
                continue;
            }
        };

        let wanted = source_schedules.get(&item.id).map(Vec::as_slice).unwrap_or(&[]);
        let held = copy_schedules.get(&copy_id).map(Vec::as_slice).unwrap_or(&[]);
        let schedules_changed = !same_schedules(held, wanted);
        if schedules_changed {
            replace_schedules(conn, copy_id, wanted)?;
        }
        if changed || schedules_changed {
            summary.updated += 1;
        }
    }

    // Whatever is left was removed or hidden at the source.
    let stale: HashSet<i32> = copies.values().map(|c| c.id).collect();
    if !stale.is_empty() {
        summary.removed = diesel::delete(items::playlist_items.filter(items::id.eq_any(stale)))
            .execute(conn)?;
    }

    diesel::update(devices::devices.find(target.id))
        .set((
            devices::mirror_source_id.eq(Some(source.id)),
            devices::mirror_synced_at.eq(Some(stamp)),
            devices::updated_at.eq(stamp),
        ))
        .execute(conn)?;

    tracing::info!(
        "Synced device {} from {}: {} added, {} updated, {} removed",
        target.id,
        source.id,
        summary.inserted,
        summary.updated,
        summary.removed
    );
    Ok(summary)
}

fn is_current(copy: &PlaylistItem, origin: &PlaylistItem) -> bool {
    copy.plugin_instance_id == origin.plugin_instance_id
        && copy.item_order == origin.item_order
        && copy.is_visible
        && copy.importance == origin.importance
        && copy.duration_override == origin.duration_override
}

/// Compares schedule rules, ignoring ids and ownership. Both sides come in
/// id order, and copies are inserted in source order.
fn same_schedules(held: &[Schedule], wanted: &[Schedule]) -> bool {
    held.len() == wanted.len()
        && held.iter().zip(wanted).all(|(a, b)| {
            a.day_mask == b.day_mask
                && a.start_time == b.start_time
                && a.end_time == b.end_time
                && a.timezone == b.timezone
                && a.is_active == b.is_active
        })
}

fn replace_schedules(conn: &mut SqliteConnection, item_id: i32, schedules: &[Schedule]) -> QueryResult<()> {
    use crate::schema::schedules::dsl;

    diesel::delete(dsl::schedules.filter(dsl::playlist_item_id.eq(item_id))).execute(conn)?;
    if schedules.is_empty() {
        return Ok(());
    }

    let copies: Vec<NewSchedule> = schedules
        .iter()
        .map(|s| NewSchedule {
            playlist_item_id: item_id,
            day_mask: s.day_mask,
            start_time: s.start_time.clone(),
            end_time: s.end_time.clone(),
            timezone: s.timezone.clone(),
            is_active: s.is_active,
        })
        .collect();
    diesel::insert_into(dsl::schedules).values(&copies).execute(conn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{self, TestDb};
    use crate::models::{Playlist, PluginInstance};
    use crate::schema::{devices, playlist_items, schedules};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    struct Fixture {
        db: TestDb,
        source: Device,
        source_playlist: Playlist,
        target: Device,
        target_playlist: Playlist,
        instance: PluginInstance,
    }

    fn fixture() -> Fixture {
        let db = TestDb::new();
        let mut conn = db.conn();
        let alice = test_support::user(&mut conn, "alice", None);
        let bob = test_support::user(&mut conn, "bob", None);
        let def = test_support::definition(&mut conn, "quotes");
        let instance = test_support::instance(&mut conn, &alice, &def, "1h");
        let (source, source_playlist) = test_support::device(&mut conn, &alice, "src-1");
        let (target, target_playlist) = test_support::device(&mut conn, &bob, "dst-1");

        diesel::update(devices::table.find(source.id))
            .set(devices::is_shareable.eq(true))
            .execute(&mut conn)
            .unwrap();
        drop(conn);

        Fixture {
            db,
            source,
            source_playlist,
            target,
            target_playlist,
            instance,
        }
    }

    fn target_items(conn: &mut SqliteConnection, playlist: &Playlist) -> Vec<PlaylistItem> {
        playlist_items::table
            .filter(playlist_items::playlist_id.eq(playlist.id))
            .order(playlist_items::id.asc())
            .select(PlaylistItem::as_select())
            .load(conn)
            .unwrap()
    }

    fn all_schedules(conn: &mut SqliteConnection) -> Vec<(i32, i32, String, String)> {
        schedules::table
            .order(schedules::id.asc())
            .select((schedules::id, schedules::playlist_item_id, schedules::start_time, schedules::end_time))
            .load(conn)
            .unwrap()
    }

    fn mirrored_count(conn: &mut SqliteConnection, playlist: &Playlist) -> usize {
        target_items(conn, playlist)
            .iter()
            .filter(|i| i.mirrored_from_item_id.is_some())
            .count()
    }

    #[test]
    fn test_mirror_copies_visible_items_with_schedules() {
        let fx = fixture();
        let mut conn = fx.db.conn();
        let a = test_support::item(&mut conn, &fx.source_playlist, &fx.instance, 1, true);
        test_support::item(&mut conn, &fx.source_playlist, &fx.instance, 2, false);
        test_support::schedule(&mut conn, &a, 31, "09:00", "17:00", "UTC");

        let summary = mirror(&mut conn, fx.target.id, "src-1", now()).unwrap();
        assert_eq!(summary.inserted, 1);

        let copies = target_items(&mut conn, &fx.target_playlist);
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].mirrored_from_item_id, Some(a.id));
        assert_eq!(copies[0].plugin_instance_id, fx.instance.id);

        let copied_schedules: Vec<Schedule> = schedules::table
            .filter(schedules::playlist_item_id.eq(copies[0].id))
            .select(Schedule::as_select())
            .load(&mut conn)
            .unwrap();
        assert_eq!(copied_schedules.len(), 1);
        assert_eq!(copied_schedules[0].day_mask, 31);

        let target = load_device(&mut conn, fx.target.id).unwrap();
        assert_eq!(target.mirror_source_id, Some(fx.source.id));
        assert_eq!(target.mirror_synced_at, Some(now().naive_utc()));
    }

    #[test]
    fn test_resync_is_idempotent() {
        let fx = fixture();
        let mut conn = fx.db.conn();
        let first = test_support::item(&mut conn, &fx.source_playlist, &fx.instance, 1, true);
        test_support::item(&mut conn, &fx.source_playlist, &fx.instance, 2, true);
        test_support::schedule(&mut conn, &first, 31, "09:00", "17:00", "UTC");
        test_support::schedule(&mut conn, &first, 96, "10:00", "12:00", "Europe/Oslo");
        let own = test_support::item(&mut conn, &fx.target_playlist, &fx.instance, 9, true);

        mirror(&mut conn, fx.target.id, "src-1", now()).unwrap();
        let before = target_items(&mut conn, &fx.target_playlist);
        let schedules_before = all_schedules(&mut conn);

        let summary = resync(&mut conn, fx.target.id, now()).unwrap();
        assert_eq!((summary.inserted, summary.updated, summary.removed), (0, 0, 0));
        let after = target_items(&mut conn, &fx.target_playlist);

        assert_eq!(before, after);
        assert_eq!(schedules_before, all_schedules(&mut conn));
        assert_eq!(after.len(), 3);
        assert!(after.iter().any(|i| i.id == own.id));
    }

    #[test]
    fn test_resync_follows_source_changes() {
        let fx = fixture();
        let mut conn = fx.db.conn();
        let a = test_support::item(&mut conn, &fx.source_playlist, &fx.instance, 1, true);
        let b = test_support::item(&mut conn, &fx.source_playlist, &fx.instance, 2, true);
        mirror(&mut conn, fx.target.id, "src-1", now()).unwrap();

        diesel::delete(playlist_items::table.find(a.id)).execute(&mut conn).unwrap();
        diesel::update(playlist_items::table.find(b.id))
            .set(playlist_items::item_order.eq(5))
            .execute(&mut conn)
            .unwrap();

        let summary = resync(&mut conn, fx.target.id, now()).unwrap();
        assert_eq!((summary.inserted, summary.updated, summary.removed), (0, 1, 1));

        let copies = target_items(&mut conn, &fx.target_playlist);
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].mirrored_from_item_id, Some(b.id));
        assert_eq!(copies[0].item_order, 5);
    }

    #[test]
    fn test_resync_replaces_only_changed_schedules() {
        let fx = fixture();
        let mut conn = fx.db.conn();
        let a = test_support::item(&mut conn, &fx.source_playlist, &fx.instance, 1, true);
        let b = test_support::item(&mut conn, &fx.source_playlist, &fx.instance, 2, true);
        let rule = test_support::schedule(&mut conn, &a, 31, "09:00", "17:00", "UTC");
        test_support::schedule(&mut conn, &b, 127, "06:00", "08:00", "UTC");
        mirror(&mut conn, fx.target.id, "src-1", now()).unwrap();

        let copied_b: Vec<i32> = schedules::table
            .inner_join(playlist_items::table)
            .filter(playlist_items::mirrored_from_item_id.eq(b.id))
            .select(schedules::id)
            .load(&mut conn)
            .unwrap();

        diesel::update(schedules::table.find(rule.id))
            .set(schedules::end_time.eq("18:00"))
            .execute(&mut conn)
            .unwrap();

        let summary = resync(&mut conn, fx.target.id, now()).unwrap();
        assert_eq!((summary.inserted, summary.updated, summary.removed), (0, 1, 0));

        let copied_a: Vec<Schedule> = schedules::table
            .inner_join(playlist_items::table)
            .filter(playlist_items::mirrored_from_item_id.eq(a.id))
            .select(Schedule::as_select())
            .load(&mut conn)
            .unwrap();
        assert_eq!(copied_a.len(), 1);
        assert_eq!(copied_a[0].end_time, "18:00");

        let still_b: Vec<i32> = schedules::table
            .inner_join(playlist_items::table)
            .filter(playlist_items::mirrored_from_item_id.eq(b.id))
            .select(schedules::id)
            .load(&mut conn)
            .unwrap();
        assert_eq!(copied_b, still_b);
    }

    #[test]
    fn test_mirror_requires_shared_claimed_source() {
        let fx = fixture();
        let mut conn = fx.db.conn();

        let err = mirror(&mut conn, fx.source.id, "dst-1", now()).unwrap_err();
        assert!(matches!(err, AppError::Validation { field: "source_friendly_id", .. }));

        let err = mirror(&mut conn, fx.source.id, "src-1", now()).unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));

        let err = mirror(&mut conn, fx.target.id, "nope", now()).unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        diesel::update(devices::table.find(fx.source.id))
            .set(devices::is_claimed.eq(false))
            .execute(&mut conn)
            .unwrap();
        assert!(mirror(&mut conn, fx.target.id, "src-1", now()).is_err());
    }

    #[test]
    fn test_unshare_clears_mirrors_and_keeps_link() {
        let fx = fixture();
        let mut conn = fx.db.conn();
        test_support::item(&mut conn, &fx.source_playlist, &fx.instance, 1, true);
        let own = test_support::item(&mut conn, &fx.target_playlist, &fx.instance, 2, true);
        mirror(&mut conn, fx.target.id, "src-1", now()).unwrap();
        assert_eq!(mirrored_count(&mut conn, &fx.target_playlist), 1);

        let affected = set_shareable(&mut conn, fx.source.id, false, now()).unwrap();
        assert_eq!(affected, vec![fx.target.id]);
        assert_eq!(mirrored_count(&mut conn, &fx.target_playlist), 0);

        let remaining = target_items(&mut conn, &fx.target_playlist);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, own.id);

        let target = load_device(&mut conn, fx.target.id).unwrap();
        assert_eq!(target.mirror_source_id, Some(fx.source.id));

        let err = resync(&mut conn, fx.target.id, now()).unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));

        set_shareable(&mut conn, fx.source.id, true, now()).unwrap();
        let summary = resync(&mut conn, fx.target.id, now()).unwrap();
        assert_eq!(summary.inserted, 1);
    }

    #[test]
    fn test_unmirror_removes_copies_and_link() {
        let fx = fixture();
        let mut conn = fx.db.conn();
        test_support::item(&mut conn, &fx.source_playlist, &fx.instance, 1, true);
        mirror(&mut conn, fx.target.id, "src-1", now()).unwrap();

        assert_eq!(unmirror(&mut conn, fx.target.id, now()).unwrap(), 1);
        let target = load_device(&mut conn, fx.target.id).unwrap();
        assert!(!target.is_mirroring());
        assert!(target.mirror_synced_at.is_none());

        let err = unmirror(&mut conn, fx.target.id, now()).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        let err = resync(&mut conn, fx.target.id, now()).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }
}
