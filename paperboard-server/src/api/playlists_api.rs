use crate::error::{AppError, AppResult};
use crate::models::{NewPlaylistItem, NewSchedule, PlaylistItem, PlaylistItemChanges, Schedule, ScheduleChanges, User};
use crate::services::access::{owned_instance, owned_item, owned_playlist, owned_schedule};
use crate::services::notifications::DeviceEvent;
use crate::services::render_queue::spawn_render_request;
use crate::validation;
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde::Deserialize;
use std::collections::HashSet;

pub async fn list_items(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(playlist_id): Path<i32>,
) -> AppResult<Json<Vec<PlaylistItem>>> {
    use crate::schema::playlist_items::dsl;

    let mut conn = state.db.get()?;
    owned_playlist(&mut conn, &user, playlist_id)?;

    let items = dsl::playlist_items
        .filter(dsl::playlist_id.eq(playlist_id))
        .order((dsl::item_order.asc(), dsl::id.asc()))
        .select(PlaylistItem::as_select())
        .load(&mut conn)?;
    Ok(Json(items))
}

#[derive(Deserialize)]
pub struct CreateItemRequest {
    pub plugin_instance_id: i32,
    pub order: Option<i32>,
    #[serde(default = "default_true")]
    pub is_visible: bool,
    #[serde(default)]
    pub importance: bool,
    pub duration_override: Option<i32>,
}

fn default_true() -> bool {
    true
}

pub async fn create_item(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(playlist_id): Path<i32>,
    Json(req): Json<CreateItemRequest>,
) -> AppResult<(StatusCode, Json<PlaylistItem>)> {
    use crate::schema::playlist_items::dsl;

    let duration_override = validation::duration_override(req.duration_override)?;

    let mut conn = state.db.get()?;
    let playlist = owned_playlist(&mut conn, &user, playlist_id)?;

    // The instance must exist and belong to the caller.
    owned_instance(&mut conn, &user, req.plugin_instance_id).map_err(|e| match e {
        AppError::NotFound(_) | AppError::Forbidden => {
            AppError::validation("plugin_instance_id", "unknown plugin instance")
        }
        other => other,
    })?;

    let order = match req.order {
        Some(order) => order,
        None => {
            let max: Option<i32> = dsl::playlist_items
                .filter(dsl::playlist_id.eq(playlist_id))
                .select(diesel::dsl::max(dsl::item_order))
                .first(&mut conn)?;
            max.map_or(1, |m| m + 1)
        }
    };

    let item = diesel::insert_into(dsl::playlist_items)
        .values(&NewPlaylistItem {
            playlist_id,
            plugin_instance_id: req.plugin_instance_id,
            item_order: order,
            is_visible: req.is_visible,
            importance: req.importance,
            duration_override,
            mirrored_from_item_id: None,
        })
        .returning(PlaylistItem::as_select())
        .get_result(&mut conn)?;

    spawn_render_request(state.db.clone(), item.plugin_instance_id, "playlist item added");
    state
        .notifications
        .publish(DeviceEvent::item_added(playlist.device_id, item.clone(), Utc::now()));

    Ok((StatusCode::CREATED, Json(item)))
}

#[derive(Deserialize)]
pub struct UpdateItemRequest {
    pub is_visible: Option<bool>,
    pub importance: Option<bool>,
    /// Replaced on every update; omit to clear.
    pub duration_override: Option<i32>,
}

pub async fn update_item(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path((playlist_id, item_id)): Path<(i32, i32)>,
    Json(req): Json<UpdateItemRequest>,
) -> AppResult<Json<PlaylistItem>> {
    use crate::schema::playlist_items::dsl;

    let duration_override = validation::duration_override(req.duration_override)?;

    let mut conn = state.db.get()?;
    let (current, playlist) = owned_item(&mut conn, &user, item_id)?;
    if playlist.id != playlist_id {
        return Err(AppError::NotFound("playlist item"));
    }

    let now = Utc::now();
    let item = diesel::update(dsl::playlist_items.find(item_id))
        .set(&PlaylistItemChanges {
            is_visible: req.is_visible.unwrap_or(current.is_visible),
            importance: req.importance.unwrap_or(current.importance),
            duration_override,
            updated_at: now.naive_utc(),
        })
        .returning(PlaylistItem::as_select())
        .get_result(&mut conn)?;

    state
        .notifications
        .publish(DeviceEvent::item_updated(playlist.device_id, item.clone(), now));
    if item.is_visible && !current.is_visible {
        spawn_render_request(state.db.clone(), item.plugin_instance_id, "playlist item shown");
    }

    Ok(Json(item))
}

pub async fn delete_item(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path((playlist_id, item_id)): Path<(i32, i32)>,
) -> AppResult<StatusCode> {
    use crate::schema::playlist_items::dsl;

    let mut conn = state.db.get()?;
    let (_, playlist) = owned_item(&mut conn, &user, item_id)?;
    if playlist.id != playlist_id {
        return Err(AppError::NotFound("playlist item"));
    }

    diesel::delete(dsl::playlist_items.find(item_id)).execute(&mut conn)?;

    state
        .notifications
        .publish(DeviceEvent::item_removed(playlist.device_id, item_id, Utc::now()));
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct ReorderRequest {
    pub item_ids: Vec<i32>,
}

/// Rewrites `order` to follow `item_ids`, which must list every item of the
/// playlist exactly once.
pub async fn reorder_items(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(playlist_id): Path<i32>,
    Json(req): Json<ReorderRequest>,
) -> AppResult<Json<Vec<PlaylistItem>>> {
    use crate::schema::playlist_items::dsl;

    let mut conn = state.db.get()?;
    let playlist = owned_playlist(&mut conn, &user, playlist_id)?;
    let now = Utc::now();

    let items = conn.transaction::<_, AppError, _>(|conn| {
        let existing: HashSet<i32> = dsl::playlist_items
            .filter(dsl::playlist_id.eq(playlist_id))
            .select(dsl::id)
            .load::<i32>(conn)?
            .into_iter()
            .collect();
        let requested: HashSet<i32> = req.item_ids.iter().copied().collect();

        if requested.len() != req.item_ids.len() || requested != existing {
            return Err(AppError::validation(
                "item_ids",
                "must list every item of the playlist exactly once",
            ));
        }

        for (position, item_id) in req.item_ids.iter().enumerate() {
            diesel::update(dsl::playlist_items.find(*item_id))
                .set((
                    dsl::item_order.eq(position as i32 + 1),
                    dsl::updated_at.eq(now.naive_utc()),
                ))
                .execute(conn)?;
        }

        Ok(dsl::playlist_items
            .filter(dsl::playlist_id.eq(playlist_id))
            .order((dsl::item_order.asc(), dsl::id.asc()))
            .select(PlaylistItem::as_select())
            .load(conn)?)
    })?;

    if playlist.is_default {
        let item_ids = items.iter().map(|i| i.id).collect();
        state
            .notifications
            .publish(DeviceEvent::items_reordered(playlist.device_id, item_ids, now));
    }
    Ok(Json(items))
}

/// A schedule change redraws its item.
fn item_event(conn: &mut SqliteConnection, device_id: i32, item_id: i32, at: DateTime<Utc>) -> QueryResult<DeviceEvent> {
    use crate::schema::playlist_items::dsl;

    let item = dsl::playlist_items
        .find(item_id)
        .select(PlaylistItem::as_select())
        .first(conn)?;
    Ok(DeviceEvent::item_updated(device_id, item, at))
}

pub async fn list_schedules(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(item_id): Path<i32>,
) -> AppResult<Json<Vec<Schedule>>> {
    use crate::schema::schedules::dsl;

    let mut conn = state.db.get()?;
    owned_item(&mut conn, &user, item_id)?;

    let schedules = dsl::schedules
        .filter(dsl::playlist_item_id.eq(item_id))
        .order(dsl::id.asc())
        .select(Schedule::as_select())
        .load(&mut conn)?;
    Ok(Json(schedules))
}

#[derive(Deserialize)]
pub struct ScheduleRequest {
    #[serde(default = "all_days")]
    pub day_mask: i32,
    pub start_time: String,
    pub end_time: String,
    pub timezone: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn all_days() -> i32 {
    127
}

impl ScheduleRequest {
    fn validate(&self) -> AppResult<()> {
        validation::day_mask(self.day_mask)?;
        validation::time_of_day("start_time", &self.start_time)?;
        validation::time_of_day("end_time", &self.end_time)?;
        validation::timezone("timezone", &self.timezone)?;
        Ok(())
    }
}

pub async fn create_schedule(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(item_id): Path<i32>,
    Json(req): Json<ScheduleRequest>,
) -> AppResult<(StatusCode, Json<Schedule>)> {
    use crate::schema::schedules::dsl;

    req.validate()?;

    let mut conn = state.db.get()?;
    let (item, playlist) = owned_item(&mut conn, &user, item_id)?;

    let schedule = diesel::insert_into(dsl::schedules)
        .values(&NewSchedule {
            playlist_item_id: item.id,
            day_mask: req.day_mask,
            start_time: req.start_time,
            end_time: req.end_time,
            timezone: req.timezone,
            is_active: req.is_active,
        })
        .returning(Schedule::as_select())
        .get_result(&mut conn)?;

    state
        .notifications
        .publish(DeviceEvent::item_updated(playlist.device_id, item, Utc::now()));
    Ok((StatusCode::CREATED, Json(schedule)))
}

pub async fn update_schedule(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path((item_id, schedule_id)): Path<(i32, i32)>,
    Json(req): Json<ScheduleRequest>,
) -> AppResult<Json<Schedule>> {
    use crate::schema::schedules::dsl;

    req.validate()?;

    let mut conn = state.db.get()?;
    let (_, playlist) = owned_schedule(&mut conn, &user, item_id, schedule_id)?;
    let now = Utc::now();

    let schedule = diesel::update(dsl::schedules.find(schedule_id))
        .set(&ScheduleChanges {
            day_mask: req.day_mask,
            start_time: req.start_time,
            end_time: req.end_time,
            timezone: req.timezone,
            is_active: req.is_active,
            updated_at: now.naive_utc(),
        })
        .returning(Schedule::as_select())
        .get_result(&mut conn)?;

    state
        .notifications
        .publish_loaded(item_event(&mut conn, playlist.device_id, item_id, now));
    Ok(Json(schedule))
}

pub async fn delete_schedule(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path((item_id, schedule_id)): Path<(i32, i32)>,
) -> AppResult<StatusCode> {
    use crate::schema::schedules::dsl;

    let mut conn = state.db.get()?;
    let (_, playlist) = owned_schedule(&mut conn, &user, item_id, schedule_id)?;

    diesel::delete(dsl::schedules.find(schedule_id)).execute(&mut conn)?;

    state
        .notifications
        .publish_loaded(item_event(&mut conn, playlist.device_id, item_id, Utc::now()));
    Ok(StatusCode::NO_CONTENT)
}
