pub mod devices_api;
pub mod display_api;
pub mod playlists_api;
pub mod plugins_api;
pub mod system_api;

use crate::AppState;
use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};

pub fn routes(state: AppState) -> Router<AppState> {
    let protected_routes = Router::new()
        // Devices
        .route(
            "/devices",
            get(devices_api::list_devices).post(devices_api::create_device),
        )
        .route(
            "/devices/:id",
            get(devices_api::get_device).put(devices_api::update_device),
        )
        .route("/devices/:id/shareable", put(devices_api::set_shareable))
        .route("/devices/:id/active-items", get(devices_api::get_active_items))
        .route(
            "/devices/:id/mirror",
            post(devices_api::mirror_device).delete(devices_api::unmirror_device),
        )
        .route("/devices/:id/mirror/resync", post(devices_api::resync_mirror))
        // Playlist items
        .route(
            "/playlists/:id/items",
            get(playlists_api::list_items).post(playlists_api::create_item),
        )
        .route("/playlists/:id/items/order", put(playlists_api::reorder_items))
        .route(
            "/playlists/:id/items/:item_id",
            put(playlists_api::update_item).delete(playlists_api::delete_item),
        )
        // Schedules
        .route(
            "/items/:id/schedules",
            get(playlists_api::list_schedules).post(playlists_api::create_schedule),
        )
        .route(
            "/items/:id/schedules/:schedule_id",
            put(playlists_api::update_schedule).delete(playlists_api::delete_schedule),
        )
        // Plugins
        .route("/plugin-definitions", get(plugins_api::list_definitions))
        .route("/plugin-definitions/:id/schema", put(plugins_api::change_schema))
        .route(
            "/plugin-instances",
            get(plugins_api::list_instances).post(plugins_api::create_instance),
        )
        .route("/plugin-instances/:id/settings", put(plugins_api::update_settings))
        .route("/plugin-instances/:id/refresh", post(plugins_api::force_refresh))
        .route("/plugin-instances/:id/render", get(plugins_api::get_render))
        .route("/plugin-instances/:id/jobs", get(plugins_api::list_jobs))
        // Render worker
        .route("/system/render-worker", get(system_api::render_worker_health))
        .route("/system/render-worker/start", post(system_api::start_render_worker))
        .route("/system/render-worker/stop", post(system_api::stop_render_worker))
        .route_layer(middleware::from_fn_with_state(
            state,
            crate::auth::middleware::auth_middleware,
        ));

    Router::new()
        // Device endpoints (Access-Token)
        .route("/display", get(display_api::get_display))
        .route("/display/image", get(display_api::get_display_image))
        .merge(protected_routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::jwt::create_token;
    use crate::config::Config;
    use crate::db::test_support::{self, TestDb};
    use crate::models::{Device, Playlist, User};
    use crate::services::notifications::NotificationHub;
    use crate::services::render_worker::RenderWorker;
    use crate::services::renderer::PlaceholderRenderer;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct Harness {
        db: TestDb,
        app: Router,
        owner: User,
        device: Device,
        playlist: Playlist,
        token: String,
        notifications: Arc<NotificationHub>,
    }

    fn harness() -> Harness {
        let db = TestDb::new();
        let config: Config = toml::from_str(Config::default_template()).unwrap();

        let mut conn = db.conn();
        let owner = test_support::user(&mut conn, "owner", Some("UTC"));
        let (device, playlist) = test_support::device(&mut conn, &owner, "api-1");
        let token = create_token(owner.id, &owner.username, &owner.role, &config.jwt.secret, 1).unwrap();

        let notifications = Arc::new(NotificationHub::new(8));
        let state = AppState {
            db: db.pool.clone(),
            config: Arc::new(config.clone()),
            notifications: notifications.clone(),
            render_worker: Arc::new(RenderWorker::new(
                db.pool.clone(),
                Arc::new(PlaceholderRenderer),
                config.render.clone(),
            )),
            bulk_jobs: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        };
        let app = Router::new().nest("/api", routes(state.clone())).with_state(state);

        Harness {
            db,
            app,
            owner,
            device,
            playlist,
            token,
            notifications,
        }
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn authed(method: &str, uri: &str, token: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {}", token));
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    fn display(api_key: &str) -> Request<Body> {
        Request::builder()
            .uri("/api/display")
            .header("access-token", api_key)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_protected_routes_need_a_token() {
        let h = harness();

        let request = Request::builder().uri("/api/devices").body(Body::empty()).unwrap();
        let (status, _) = send(&h.app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = send(&h.app, authed("GET", "/api/devices", &h.token, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_device_polls_with_access_token() {
        let h = harness();

        let (status, _) = send(&h.app, display("wrong-key")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = send(&h.app, display(&h.device.api_key)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["screen"], "empty");

        let instance = {
            let mut conn = h.db.conn();
            let def = test_support::definition(&mut conn, "clock");
            test_support::instance(&mut conn, &h.owner, &def, "15m")
        };
        let uri = format!("/api/playlists/{}/items", h.playlist.id);
        let (status, item) = send(
            &h.app,
            authed("POST", &uri, &h.token, Some(serde_json::json!({ "plugin_instance_id": instance.id }))),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(&h.app, display(&h.device.api_key)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["screen"], "item");
        assert_eq!(body["item"]["id"], item["id"]);
    }

    #[tokio::test]
    async fn test_reorder_rejects_partial_lists() {
        let h = harness();
        let uri = format!("/api/playlists/{}/items/order", h.playlist.id);

        let (status, body) = send(
            &h.app,
            authed("PUT", &uri, &h.token, Some(serde_json::json!({ "item_ids": [999] }))),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["field"], "item_ids");
    }

    #[tokio::test]
    async fn test_events_carry_redraw_payloads() {
        let h = harness();
        let mut sub = h.notifications.subscribe(h.device.id);
        let instance = {
            let mut conn = h.db.conn();
            let def = test_support::definition(&mut conn, "clock");
            test_support::instance(&mut conn, &h.owner, &def, "15m")
        };

        let uri = format!("/api/playlists/{}/items", h.playlist.id);
        let mut ids = Vec::new();
        for _ in 0..2 {
            let body = serde_json::json!({ "plugin_instance_id": instance.id, "duration_override": 90 });
            let (status, item) = send(&h.app, authed("POST", &uri, &h.token, Some(body))).await;
            assert_eq!(status, StatusCode::CREATED);
            ids.push(item["id"].as_i64().unwrap() as i32);

            let event = serde_json::to_value(sub.events.recv().await.unwrap()).unwrap();
            assert_eq!(event["type"], "item_added");
            assert_eq!(event["item"], item);
        }

        let uri = format!("/api/playlists/{}/items/order", h.playlist.id);
        let reversed = vec![ids[1], ids[0]];
        let (status, _) = send(
            &h.app,
            authed("PUT", &uri, &h.token, Some(serde_json::json!({ "item_ids": reversed }))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let event = serde_json::to_value(sub.events.recv().await.unwrap()).unwrap();
        assert_eq!(event["type"], "items_reordered");
        assert_eq!(event["item_ids"], serde_json::json!(reversed));

        let uri = format!("/api/devices/{}", h.device.id);
        let body = serde_json::json!({
            "sleep_enabled": true,
            "sleep_start_time": "22:00",
            "sleep_end_time": "06:00",
            "sleep_show_screen": true
        });
        let (status, _) = send(&h.app, authed("PUT", &uri, &h.token, Some(body))).await;
        assert_eq!(status, StatusCode::OK);
        let event = serde_json::to_value(sub.events.recv().await.unwrap()).unwrap();
        assert_eq!(event["type"], "device_settings_updated");
        assert_eq!(event["settings"]["enabled"], true);
        assert_eq!(event["settings"]["start"], "22:00");
        assert_eq!(event["settings"]["show_screen"], true);
    }

    #[tokio::test]
    async fn test_other_users_devices_are_forbidden() {
        let h = harness();
        let stranger = {
            let mut conn = h.db.conn();
            test_support::user(&mut conn, "stranger", None)
        };
        let config: Config = toml::from_str(Config::default_template()).unwrap();
        let token = create_token(stranger.id, &stranger.username, &stranger.role, &config.jwt.secret, 1).unwrap();

        let uri = format!("/api/devices/{}", h.device.id);
        let (status, _) = send(&h.app, authed("GET", &uri, &token, None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = send(&h.app, authed("GET", "/api/devices", &token, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(Vec::len), Some(0));
    }
}
