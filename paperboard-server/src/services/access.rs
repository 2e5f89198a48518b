//! Ownership checks shared by the handlers. A missing row is `NotFound`, a
//! row owned by someone else is `Forbidden`. Admins pass every check.

use crate::error::{AppError, AppResult};
use crate::models::{Device, Playlist, PlaylistItem, PluginInstance, Schedule, User};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

fn check(user: &User, owner_id: Option<i32>) -> AppResult<()> {
    if user.is_admin() || owner_id == Some(user.id) {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}

pub fn owned_device(conn: &mut SqliteConnection, user: &User, device_id: i32) -> AppResult<Device> {
    use crate::schema::devices::dsl;

    let device = dsl::devices
        .find(device_id)
        .select(Device::as_select())
        .first(conn)
        .optional()?
        .ok_or(AppError::NotFound("device"))?;
    check(user, device.owner_id)?;
    Ok(device)
}

pub fn owned_playlist(conn: &mut SqliteConnection, user: &User, playlist_id: i32) -> AppResult<Playlist> {
    use crate::schema::playlists::dsl;

    let playlist = dsl::playlists
        .find(playlist_id)
        .select(Playlist::as_select())
        .first(conn)
        .optional()?
        .ok_or(AppError::NotFound("playlist"))?;
    check(user, Some(playlist.user_id))?;
    Ok(playlist)
}

/// The item together with its playlist, which carries the owner and device.
pub fn owned_item(conn: &mut SqliteConnection, user: &User, item_id: i32) -> AppResult<(PlaylistItem, Playlist)> {
    use crate::schema::{playlist_items, playlists};

    let (item, playlist) = playlist_items::table
        .inner_join(playlists::table)
        .filter(playlist_items::id.eq(item_id))
        .select((PlaylistItem::as_select(), Playlist::as_select()))
        .first::<(PlaylistItem, Playlist)>(conn)
        .optional()?
        .ok_or(AppError::NotFound("playlist item"))?;
    check(user, Some(playlist.user_id))?;
    Ok((item, playlist))
}

pub fn owned_schedule(
    conn: &mut SqliteConnection,
    user: &User,
    item_id: i32,
    schedule_id: i32,
) -> AppResult<(Schedule, Playlist)> {
    use crate::schema::schedules::dsl;

    let (_, playlist) = owned_item(conn, user, item_id)?;
    let schedule = dsl::schedules
        .filter(dsl::id.eq(schedule_id))
        .filter(dsl::playlist_item_id.eq(item_id))
        .select(Schedule::as_select())
        .first(conn)
        .optional()?
        .ok_or(AppError::NotFound("schedule"))?;
    Ok((schedule, playlist))
}

pub fn owned_instance(conn: &mut SqliteConnection, user: &User, instance_id: i32) -> AppResult<PluginInstance> {
    use crate::schema::plugin_instances::dsl;

    let instance = dsl::plugin_instances
        .find(instance_id)
        .select(PluginInstance::as_select())
        .first(conn)
        .optional()?
        .ok_or(AppError::NotFound("plugin instance"))?;
    check(user, Some(instance.user_id))?;
    Ok(instance)
}

/// Default-playlist items showing the instance, with their device, for
/// change events.
pub fn items_showing(conn: &mut SqliteConnection, instance_id: i32) -> QueryResult<Vec<(i32, PlaylistItem)>> {
    use crate::schema::{playlist_items, playlists};

    playlists::table
        .inner_join(playlist_items::table)
        .filter(playlist_items::plugin_instance_id.eq(instance_id))
        .filter(playlists::is_default.eq(true))
        .order(playlist_items::id.asc())
        .select((playlists::device_id, PlaylistItem::as_select()))
        .load(conn)
}
