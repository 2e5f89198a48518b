use crate::auth::middleware::require_admin;
use crate::error::{AppError, AppResult};
use crate::models::{NewPluginInstance, PluginDefinition, PluginInstance, RenderJob, User};
use crate::services::access::{items_showing, owned_instance};
use crate::services::notifications::DeviceEvent;
use crate::services::render_queue::{self, spawn_render_request};
use crate::validation;
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub async fn list_definitions(State(state): State<AppState>) -> AppResult<Json<Vec<PluginDefinition>>> {
    use crate::schema::plugin_definitions::dsl;

    let mut conn = state.db.get()?;
    let definitions = dsl::plugin_definitions
        .order(dsl::name.asc())
        .select(PluginDefinition::as_select())
        .load(&mut conn)?;
    Ok(Json(definitions))
}

pub async fn list_instances(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> AppResult<Json<Vec<PluginInstance>>> {
    use crate::schema::plugin_instances::dsl;

    let mut conn = state.db.get()?;
    let instances = dsl::plugin_instances
        .filter(dsl::user_id.eq(user.id))
        .order(dsl::id.asc())
        .select(PluginInstance::as_select())
        .load(&mut conn)?;
    Ok(Json(instances))
}

#[derive(Deserialize)]
pub struct CreateInstanceRequest {
    pub plugin_definition_id: i32,
    pub name: String,
    #[serde(default = "empty_settings")]
    pub settings: serde_json::Value,
    #[serde(default = "default_refresh")]
    pub refresh_interval: String,
}

fn empty_settings() -> serde_json::Value {
    serde_json::json!({})
}

fn default_refresh() -> String {
    "15m".to_string()
}

pub async fn create_instance(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(req): Json<CreateInstanceRequest>,
) -> AppResult<(StatusCode, Json<PluginInstance>)> {
    use crate::schema::{plugin_definitions, plugin_instances};

    if req.name.trim().is_empty() {
        return Err(AppError::validation("name", "must not be empty"));
    }
    let settings = validation::settings_json(&req.settings)?;
    validation::refresh_interval(&req.refresh_interval)?;

    let mut conn = state.db.get()?;
    let definition = plugin_definitions::table
        .find(req.plugin_definition_id)
        .select(PluginDefinition::as_select())
        .first(&mut conn)
        .optional()?
        .ok_or_else(|| AppError::validation("plugin_definition_id", "unknown plugin definition"))?;

    // Due immediately so the first sweep renders it.
    let instance = diesel::insert_into(plugin_instances::table)
        .values(&NewPluginInstance {
            user_id: user.id,
            plugin_definition_id: definition.id,
            name: req.name.trim().to_string(),
            settings,
            refresh_interval: req.refresh_interval.trim().to_string(),
            schema_version: definition.schema_version,
            next_render_at: Some(Utc::now().naive_utc()),
        })
        .returning(PluginInstance::as_select())
        .get_result(&mut conn)?;

    Ok((StatusCode::CREATED, Json(instance)))
}

#[derive(Deserialize)]
pub struct UpdateSettingsRequest {
    pub settings: serde_json::Value,
    pub refresh_interval: Option<String>,
}

/// Replaces the settings, drops the stale artifact and queues a render.
pub async fn update_settings(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(instance_id): Path<i32>,
    Json(req): Json<UpdateSettingsRequest>,
) -> AppResult<Json<PluginInstance>> {
    use crate::schema::{plugin_definitions, plugin_instances::dsl};

    let settings = validation::settings_json(&req.settings)?;
    if let Some(interval) = &req.refresh_interval {
        validation::refresh_interval(interval)?;
    }

    let mut conn = state.db.get()?;
    let current = owned_instance(&mut conn, &user, instance_id)?;
    let now = Utc::now();

    let instance = conn.transaction::<_, AppError, _>(|conn| {
        let schema_version: i32 = plugin_definitions::table
            .find(current.plugin_definition_id)
            .select(plugin_definitions::schema_version)
            .first(conn)?;

        let instance = diesel::update(dsl::plugin_instances.find(instance_id))
            .set((
                dsl::settings.eq(settings),
                dsl::refresh_interval.eq(req
                    .refresh_interval
                    .as_deref()
                    .map(str::trim)
                    .unwrap_or(current.refresh_interval.as_str())),
                dsl::schema_version.eq(schema_version),
                dsl::needs_config_update.eq(false),
                dsl::updated_at.eq(now.naive_utc()),
            ))
            .returning(PluginInstance::as_select())
            .get_result(conn)?;

        render_queue::clear_artifact(conn, instance_id)?;
        Ok(instance)
    })?;

    spawn_render_request(state.db.clone(), instance.id, "settings updated");

    let showing = items_showing(&mut conn, instance.id)?;
    state.notifications.publish_all(
        showing
            .into_iter()
            .map(|(device_id, item)| DeviceEvent::item_updated(device_id, item, now)),
    );

    Ok(Json(instance))
}

/// Forced refresh. Queued at the immediate priority; daily-family instances
/// keep their regular slot.
pub async fn force_refresh(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(instance_id): Path<i32>,
) -> AppResult<(StatusCode, Json<RenderJob>)> {
    let mut conn = state.db.get()?;
    owned_instance(&mut conn, &user, instance_id)?;

    let outcome = render_queue::request_render(&mut conn, instance_id, Utc::now())?;
    Ok((StatusCode::ACCEPTED, Json(outcome.job().clone())))
}

pub async fn get_render(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(instance_id): Path<i32>,
) -> AppResult<Response> {
    let mut conn = state.db.get()?;
    owned_instance(&mut conn, &user, instance_id)?;

    let artifact = render_queue::latest_artifact(&mut conn, instance_id)?
        .ok_or(AppError::NotFound("rendered content"))?;

    Ok(([(header::CONTENT_TYPE, artifact.mime_type)], artifact.content).into_response())
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(instance_id): Path<i32>,
) -> AppResult<Json<Vec<RenderJob>>> {
    let mut conn = state.db.get()?;
    owned_instance(&mut conn, &user, instance_id)?;

    Ok(Json(render_queue::recent_jobs(&mut conn, instance_id, 20)?))
}

#[derive(Deserialize)]
pub struct SchemaChangeRequest {
    pub schema_version: i32,
    pub settings_schema: Option<serde_json::Value>,
}

#[derive(Serialize)]
pub struct SchemaChangeResponse {
    pub definition: PluginDefinition,
    pub instances: usize,
}

/// Bumps a definition's schema, flags its instances and re-renders them in
/// the background. A newer bump for the same definition cancels the
/// previous re-render.
pub async fn change_schema(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(definition_id): Path<i32>,
    Json(req): Json<SchemaChangeRequest>,
) -> AppResult<(StatusCode, Json<SchemaChangeResponse>)> {
    use crate::schema::plugin_definitions::dsl;

    require_admin(&user)?;

    let mut conn = state.db.get()?;
    let current = dsl::plugin_definitions
        .find(definition_id)
        .select(PluginDefinition::as_select())
        .first(&mut conn)
        .optional()?
        .ok_or(AppError::NotFound("plugin definition"))?;

    if req.schema_version <= current.schema_version {
        return Err(AppError::validation(
            "schema_version",
            format!("must be greater than {}", current.schema_version),
        ));
    }

    let (definition, instances) = conn.transaction::<_, AppError, _>(|conn| {
        let definition = diesel::update(dsl::plugin_definitions.find(definition_id))
            .set((
                dsl::schema_version.eq(req.schema_version),
                dsl::settings_schema.eq(req.settings_schema.as_ref().map(|s| s.to_string())),
                dsl::updated_at.eq(Utc::now().naive_utc()),
            ))
            .returning(PluginDefinition::as_select())
            .get_result(conn)?;
        let instances = render_queue::instances_needing_update(conn, definition_id, req.schema_version)?;
        Ok((definition, instances))
    })?;

    let instance_ids: Vec<i32> = instances.iter().map(|i| i.id).collect();
    let count = instance_ids.len();

    let cancel = CancellationToken::new();
    {
        let mut bulk = state.bulk_jobs.lock().await;
        if let Some(previous) = bulk.insert(definition_id, cancel.clone()) {
            previous.cancel();
        }
    }

    let pool = state.db.clone();
    let bulk_jobs = state.bulk_jobs.clone();
    let deadline = Instant::now() + Duration::from_secs(state.config.render.bulk_deadline_secs);
    tokio::spawn(async move {
        let token = cancel.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            Ok::<_, anyhow::Error>(render_queue::bulk_enqueue(&mut conn, &instance_ids, &token, deadline))
        })
        .await;

        match result {
            Ok(Ok(report)) => tracing::info!(
                "Re-render for definition {}: {} of {} enqueued, {} failed{}",
                definition_id,
                report.enqueued,
                report.requested,
                report.failed,
                if report.cancelled { " (stopped early)" } else { "" }
            ),
            Ok(Err(e)) => tracing::error!("Re-render for definition {} failed: {}", definition_id, e),
            Err(e) => tracing::error!("Re-render task for definition {} panicked: {}", definition_id, e),
        }

        // A cancelled token means a newer bump owns the slot.
        if !cancel.is_cancelled() {
            bulk_jobs.lock().await.remove(&definition_id);
        }
    });

    tracing::info!(
        "Definition {} moved to schema {}; {} instances flagged",
        definition.name,
        definition.schema_version,
        count
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(SchemaChangeResponse {
            definition,
            instances: count,
        }),
    ))
}
