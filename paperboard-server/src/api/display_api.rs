//! Endpoints polled by the devices themselves, authenticated with the
//! device api key in the `Access-Token` header.

use crate::auth::{authenticate_device, ACCESS_TOKEN_HEADER};
use crate::error::{AppError, AppResult};
use crate::models::{Device, RenderedContent};
use crate::services::display::{next_screen, NextScreen};
use crate::services::notifications::DeviceEvent;
use crate::services::render_queue::latest_artifact;
use crate::AppState;
use axum::{
    extract::State,
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

fn device_from_headers(state: &AppState, headers: &HeaderMap) -> AppResult<Device> {
    let api_key = headers
        .get(ACCESS_TOKEN_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or(AppError::Unauthorized)?;

    let mut conn = state.db.get()?;
    authenticate_device(&mut conn, api_key)
}

pub async fn get_display(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<NextScreen>> {
    let device = device_from_headers(&state, &headers)?;
    let now = Utc::now();

    let mut conn = state.db.get()?;
    let next = next_screen(&mut conn, &device, &state.config.display, now)?;

    if next.advanced {
        state
            .notifications
            .publish(DeviceEvent::index_changed(device.id, next.item_id(), now));
    }
    Ok(Json(next))
}

/// Image for the item the device is currently on.
pub async fn get_display_image(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    let device = device_from_headers(&state, &headers)?;

    let mut conn = state.db.get()?;
    let artifact = current_artifact(&mut conn, &device)?;
    Ok(([(header::CONTENT_TYPE, artifact.mime_type)], artifact.content).into_response())
}

/// The pointer can go stale between authentication and lookup when the item
/// is deleted; that reads as no current item.
fn current_artifact(conn: &mut SqliteConnection, device: &Device) -> AppResult<RenderedContent> {
    use crate::schema::playlist_items::dsl;

    let item_id = device.last_playlist_item_id.ok_or(AppError::NotFound("current item"))?;
    let instance_id: i32 = dsl::playlist_items
        .find(item_id)
        .select(dsl::plugin_instance_id)
        .first(conn)
        .optional()?
        .ok_or(AppError::NotFound("current item"))?;

    latest_artifact(conn, instance_id)?.ok_or(AppError::NotFound("rendered content"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{self, TestDb};
    use crate::schema::{devices, playlist_items};

    #[test]
    fn test_deleted_current_item_is_not_found() {
        let db = TestDb::new();
        let mut conn = db.conn();
        let owner = test_support::user(&mut conn, "owner", None);
        let def = test_support::definition(&mut conn, "clock");
        let inst = test_support::instance(&mut conn, &owner, &def, "15m");
        let (device, playlist) = test_support::device(&mut conn, &owner, "img-1");
        let item = test_support::item(&mut conn, &playlist, &inst, 1, true);

        diesel::update(devices::table.find(device.id))
            .set(devices::last_playlist_item_id.eq(Some(item.id)))
            .execute(&mut conn)
            .unwrap();
        let device: Device = devices::table
            .find(device.id)
            .select(Device::as_select())
            .first(&mut conn)
            .unwrap();

        // Nothing rendered yet.
        assert!(matches!(
            current_artifact(&mut conn, &device),
            Err(AppError::NotFound("rendered content"))
        ));

        // The device row was read before the delete.
        diesel::delete(playlist_items::table.find(item.id)).execute(&mut conn).unwrap();
        assert!(matches!(
            current_artifact(&mut conn, &device),
            Err(AppError::NotFound("current item"))
        ));

        let fresh = Device { last_playlist_item_id: None, ..device };
        assert!(matches!(current_artifact(&mut conn, &fresh), Err(AppError::NotFound("current item"))));
    }
}
