use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

// User models
#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::users)]
pub struct User {
    pub id: i32,
    pub username: String,
    pub role: String,
    pub timezone: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

#[derive(Debug, Insertable, Deserialize)]
#[diesel(table_name = crate::schema::users)]
pub struct NewUser {
    pub username: String,
    pub role: String,
    pub timezone: Option<String>,
}

// Device models
#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::devices)]
pub struct Device {
    pub id: i32,
    pub friendly_id: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub owner_id: Option<i32>,
    pub is_shareable: bool,
    pub is_claimed: bool,
    pub sleep_enabled: bool,
    pub sleep_start_time: Option<String>,
    pub sleep_end_time: Option<String>,
    pub sleep_show_screen: bool,
    pub firmware_update_start_time: Option<String>,
    pub firmware_update_end_time: Option<String>,
    pub mirror_source_id: Option<i32>,
    pub mirror_synced_at: Option<NaiveDateTime>,
    pub last_playlist_item_id: Option<i32>,
    pub last_seen_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Device {
    pub fn is_mirroring(&self) -> bool {
        self.mirror_source_id.is_some()
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::devices)]
pub struct NewDevice {
    pub friendly_id: String,
    pub name: String,
    pub api_key: String,
    pub owner_id: Option<i32>,
    pub is_claimed: bool,
}

/// Full replacement of the user-editable device settings.
#[derive(Debug, AsChangeset)]
#[diesel(table_name = crate::schema::devices, treat_none_as_null = true)]
pub struct DeviceSettings {
    pub name: String,
    pub sleep_enabled: bool,
    pub sleep_start_time: Option<String>,
    pub sleep_end_time: Option<String>,
    pub sleep_show_screen: bool,
    pub firmware_update_start_time: Option<String>,
    pub firmware_update_end_time: Option<String>,
    pub updated_at: NaiveDateTime,
}

// Playlist models
#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::playlists)]
pub struct Playlist {
    pub id: i32,
    pub device_id: i32,
    pub user_id: i32,
    pub name: String,
    pub is_default: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::playlists)]
pub struct NewPlaylist {
    pub device_id: i32,
    pub user_id: i32,
    pub name: String,
    pub is_default: bool,
}

// Playlist Item models
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::playlist_items)]
pub struct PlaylistItem {
    pub id: i32,
    pub playlist_id: i32,
    pub plugin_instance_id: i32,
    #[serde(rename = "order")]
    pub item_order: i32,
    pub is_visible: bool,
    pub importance: bool,
    pub duration_override: Option<i32>,
    pub mirrored_from_item_id: Option<i32>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::playlist_items)]
pub struct NewPlaylistItem {
    pub playlist_id: i32,
    pub plugin_instance_id: i32,
    pub item_order: i32,
    pub is_visible: bool,
    pub importance: bool,
    pub duration_override: Option<i32>,
    pub mirrored_from_item_id: Option<i32>,
}

#[derive(Debug, AsChangeset)]
#[diesel(table_name = crate::schema::playlist_items, treat_none_as_null = true)]
pub struct PlaylistItemChanges {
    pub is_visible: bool,
    pub importance: bool,
    pub duration_override: Option<i32>,
    pub updated_at: NaiveDateTime,
}

// Schedule models
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::schedules)]
pub struct Schedule {
    pub id: i32,
    pub playlist_item_id: i32,
    pub day_mask: i32,
    pub start_time: String,
    pub end_time: String,
    pub timezone: String,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::schedules)]
pub struct NewSchedule {
    pub playlist_item_id: i32,
    pub day_mask: i32,
    pub start_time: String,
    pub end_time: String,
    pub timezone: String,
    pub is_active: bool,
}

#[derive(Debug, AsChangeset)]
#[diesel(table_name = crate::schema::schedules)]
pub struct ScheduleChanges {
    pub day_mask: i32,
    pub start_time: String,
    pub end_time: String,
    pub timezone: String,
    pub is_active: bool,
    pub updated_at: NaiveDateTime,
}

// Plugin models
#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::plugin_definitions)]
pub struct PluginDefinition {
    pub id: i32,
    pub name: String,
    pub schema_version: i32,
    pub settings_schema: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::plugin_definitions)]
pub struct NewPluginDefinition {
    pub name: String,
    pub schema_version: i32,
    pub settings_schema: Option<String>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::plugin_instances)]
pub struct PluginInstance {
    pub id: i32,
    pub user_id: i32,
    pub plugin_definition_id: i32,
    pub name: String,
    pub settings: String,
    pub refresh_interval: String,
    pub needs_config_update: bool,
    pub schema_version: i32,
    pub last_rendered_at: Option<NaiveDateTime>,
    pub next_render_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::plugin_instances)]
pub struct NewPluginInstance {
    pub user_id: i32,
    pub plugin_definition_id: i32,
    pub name: String,
    pub settings: String,
    pub refresh_interval: String,
    pub schema_version: i32,
    pub next_render_at: Option<NaiveDateTime>,
}

// Render queue models
#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::render_queue)]
pub struct RenderJob {
    pub id: i32,
    pub plugin_instance_id: i32,
    pub priority: i32,
    pub scheduled_for: NaiveDateTime,
    pub status: String,
    pub independent_render: bool,
    pub attempts: i32,
    pub error_message: Option<String>,
    pub created_at: NaiveDateTime,
    pub started_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::render_queue)]
pub struct NewRenderJob {
    pub plugin_instance_id: i32,
    pub priority: i32,
    pub scheduled_for: NaiveDateTime,
    pub status: String,
    pub independent_render: bool,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::rendered_content)]
pub struct RenderedContent {
    pub id: i32,
    pub plugin_instance_id: i32,
    pub render_job_id: Option<i32>,
    pub content: Vec<u8>,
    pub mime_type: String,
    pub rendered_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::rendered_content)]
pub struct NewRenderedContent<'a> {
    pub plugin_instance_id: i32,
    pub render_job_id: Option<i32>,
    pub content: &'a [u8],
    pub mime_type: &'a str,
    pub rendered_at: NaiveDateTime,
}
