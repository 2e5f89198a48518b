use crate::auth::generate_api_key;
use crate::error::{AppError, AppResult};
use crate::models::{Device, DeviceSettings, NewDevice, NewPlaylist, PlaylistItem, User};
use crate::services::access::owned_device;
use crate::services::mirror::{self, SyncSummary};
use crate::services::display::{device_timezone, reorder_event, settings_event};
use crate::services::schedule_matcher::active_items;
use crate::services::sleep_window::{evaluate, firmware_window, FirmwareWindowState, SleepConfig, SleepState};
use crate::validation;
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

pub async fn list_devices(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> AppResult<Json<Vec<Device>>> {
    use crate::schema::devices::dsl;

    let mut conn = state.db.get()?;

    let mut query = dsl::devices.order(dsl::id.asc()).into_boxed();
    if !user.is_admin() {
        query = query.filter(dsl::owner_id.eq(user.id));
    }

    let devices = query.select(Device::as_select()).load(&mut conn)?;
    Ok(Json(devices))
}

#[derive(Deserialize)]
pub struct CreateDeviceRequest {
    pub name: String,
    pub friendly_id: Option<String>,
}

#[derive(Serialize)]
pub struct CreateDeviceResponse {
    pub device: Device,
    pub api_key: String,
}

fn random_friendly_id() -> String {
    use rand::Rng;

    const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

pub async fn create_device(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(req): Json<CreateDeviceRequest>,
) -> AppResult<(StatusCode, Json<CreateDeviceResponse>)> {
    use crate::schema::{devices, playlists};

    if req.name.trim().is_empty() {
        return Err(AppError::validation("name", "must not be empty"));
    }
    let friendly_id = match req.friendly_id {
        Some(id) if id.trim().is_empty() => {
            return Err(AppError::validation("friendly_id", "must not be empty"))
        }
        Some(id) => id.trim().to_string(),
        None => random_friendly_id(),
    };

    let mut conn = state.db.get()?;
    let api_key = generate_api_key();

    let device = conn.transaction::<_, AppError, _>(|conn| {
        let device = diesel::insert_into(devices::table)
            .values(&NewDevice {
                friendly_id,
                name: req.name.trim().to_string(),
                api_key: api_key.clone(),
                owner_id: Some(user.id),
                is_claimed: true,
            })
            .returning(Device::as_select())
            .get_result(conn)?;

        diesel::insert_into(playlists::table)
            .values(&NewPlaylist {
                device_id: device.id,
                user_id: user.id,
                name: "Default".to_string(),
                is_default: true,
            })
            .execute(conn)?;

        Ok(device)
    })?;

    tracing::info!("User {} registered device {} ({})", user.username, device.id, device.friendly_id);
    Ok((StatusCode::CREATED, Json(CreateDeviceResponse { device, api_key })))
}

pub async fn get_device(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(device_id): Path<i32>,
) -> AppResult<Json<Device>> {
    let mut conn = state.db.get()?;
    Ok(Json(owned_device(&mut conn, &user, device_id)?))
}

#[derive(Deserialize)]
pub struct UpdateDeviceRequest {
    pub name: Option<String>,
    #[serde(default)]
    pub sleep_enabled: bool,
    pub sleep_start_time: Option<String>,
    pub sleep_end_time: Option<String>,
    #[serde(default = "default_true")]
    pub sleep_show_screen: bool,
    pub firmware_update_start_time: Option<String>,
    pub firmware_update_end_time: Option<String>,
}

fn default_true() -> bool {
    true
}

pub async fn update_device(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(device_id): Path<i32>,
    Json(req): Json<UpdateDeviceRequest>,
) -> AppResult<Json<Device>> {
    use crate::schema::devices::dsl;

    validation::optional_window(
        "sleep_start_time",
        req.sleep_start_time.as_deref(),
        "sleep_end_time",
        req.sleep_end_time.as_deref(),
    )?;
    validation::optional_window(
        "firmware_update_start_time",
        req.firmware_update_start_time.as_deref(),
        "firmware_update_end_time",
        req.firmware_update_end_time.as_deref(),
    )?;
    if req.sleep_enabled && req.sleep_start_time.is_none() {
        return Err(AppError::validation("sleep_start_time", "required when sleep is enabled"));
    }

    let mut conn = state.db.get()?;
    let current = owned_device(&mut conn, &user, device_id)?;
    let now = Utc::now();

    let name = match req.name {
        Some(name) if name.trim().is_empty() => return Err(AppError::validation("name", "must not be empty")),
        Some(name) => name.trim().to_string(),
        None => current.name,
    };

    let device = diesel::update(dsl::devices.find(device_id))
        .set(&DeviceSettings {
            name,
            sleep_enabled: req.sleep_enabled,
            sleep_start_time: req.sleep_start_time,
            sleep_end_time: req.sleep_end_time,
            sleep_show_screen: req.sleep_show_screen,
            firmware_update_start_time: req.firmware_update_start_time,
            firmware_update_end_time: req.firmware_update_end_time,
            updated_at: now.naive_utc(),
        })
        .returning(Device::as_select())
        .get_result(&mut conn)?;

    state.notifications.publish_loaded(settings_event(&mut conn, &device, now));
    Ok(Json(device))
}

#[derive(Deserialize)]
pub struct ShareableRequest {
    pub is_shareable: bool,
}

#[derive(Serialize)]
pub struct ShareableResponse {
    pub device_id: i32,
    pub is_shareable: bool,
    /// Mirrors whose copied items were removed.
    pub cleared_mirrors: Vec<i32>,
}

pub async fn set_shareable(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(device_id): Path<i32>,
    Json(req): Json<ShareableRequest>,
) -> AppResult<Json<ShareableResponse>> {
    let mut conn = state.db.get()?;
    let device = owned_device(&mut conn, &user, device_id)?;

    let now = Utc::now();
    let cleared_mirrors = mirror::set_shareable(&mut conn, device_id, req.is_shareable, now)?;

    state.notifications.publish_loaded(settings_event(&mut conn, &device, now));
    for mirror_id in &cleared_mirrors {
        state.notifications.publish_loaded(reorder_event(&mut conn, *mirror_id, now));
    }

    Ok(Json(ShareableResponse {
        device_id,
        is_shareable: req.is_shareable,
        cleared_mirrors,
    }))
}

#[derive(Deserialize)]
pub struct ActiveItemsQuery {
    pub at: Option<String>,
}

#[derive(Serialize)]
pub struct ActiveItemsResponse {
    pub items: Vec<PlaylistItem>,
    pub current_item: Option<PlaylistItem>,
    pub visible_count: usize,
    pub active_count: usize,
    pub sleep: SleepState,
    pub firmware_window: FirmwareWindowState,
    pub at: DateTime<Utc>,
}

/// Diagnostics: what the device would show at `at` (default now).
pub async fn get_active_items(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(device_id): Path<i32>,
    Query(query): Query<ActiveItemsQuery>,
) -> AppResult<Json<ActiveItemsResponse>> {
    let at = match query.at.as_deref() {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| AppError::validation("at", format!("'{}' is not an RFC3339 timestamp", raw)))?,
        None => Utc::now(),
    };

    let mut conn = state.db.get()?;
    let device = owned_device(&mut conn, &user, device_id)?;

    let tz = device_timezone(&mut conn, &device)?;

    let active = active_items(&mut conn, device.id, at)?;

    Ok(Json(ActiveItemsResponse {
        items: active.items,
        current_item: active.current_item,
        visible_count: active.visible_count,
        active_count: active.active_count,
        sleep: evaluate(&SleepConfig::from(&device), tz, at),
        firmware_window: firmware_window(&device, tz, at),
        at,
    }))
}

#[derive(Deserialize)]
pub struct MirrorRequest {
    pub source_friendly_id: String,
}

pub async fn mirror_device(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(device_id): Path<i32>,
    Json(req): Json<MirrorRequest>,
) -> AppResult<Json<SyncSummary>> {
    let mut conn = state.db.get()?;
    owned_device(&mut conn, &user, device_id)?;

    let now = Utc::now();
    let summary = mirror::mirror(&mut conn, device_id, req.source_friendly_id.trim(), now)?;
    state.notifications.publish_loaded(reorder_event(&mut conn, device_id, now));
    Ok(Json(summary))
}

pub async fn resync_mirror(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(device_id): Path<i32>,
) -> AppResult<Json<SyncSummary>> {
    let mut conn = state.db.get()?;
    owned_device(&mut conn, &user, device_id)?;

    let now = Utc::now();
    let summary = mirror::resync(&mut conn, device_id, now)?;
    state.notifications.publish_loaded(reorder_event(&mut conn, device_id, now));
    Ok(Json(summary))
}

pub async fn unmirror_device(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(device_id): Path<i32>,
) -> AppResult<StatusCode> {
    let mut conn = state.db.get()?;
    owned_device(&mut conn, &user, device_id)?;

    let now = Utc::now();
    mirror::unmirror(&mut conn, device_id, now)?;
    state.notifications.publish_loaded(reorder_event(&mut conn, device_id, now));
    Ok(StatusCode::NO_CONTENT)
}
