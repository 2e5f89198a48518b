use anyhow::Result;
use diesel::connection::SimpleConnection;
use diesel::r2d2::{self, ConnectionManager, CustomizeConnection};
use diesel::sqlite::SqliteConnection;
use std::time::Duration;

pub type DbPool = r2d2::Pool<ConnectionManager<SqliteConnection>>;
pub type DbConnection = r2d2::PooledConnection<ConnectionManager<SqliteConnection>>;

/// Applied to every pooled connection. Cascades and `ON DELETE SET NULL`
/// on the current-item pointer depend on `foreign_keys`.
#[derive(Debug, Clone, Copy)]
struct ConnectionOptions {
    busy_timeout: Duration,
}

impl CustomizeConnection<SqliteConnection, r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON; PRAGMA busy_timeout = {};",
            self.busy_timeout.as_millis()
        ))
        .map_err(r2d2::Error::QueryError)
    }
}

pub fn create_pool(database_url: &str) -> Result<DbPool> {
    let path = database_url
        .strip_prefix("sqlite://")
        .unwrap_or(database_url);
    let manager = ConnectionManager::<SqliteConnection>::new(path);
    let pool = r2d2::Pool::builder()
        .connection_customizer(Box::new(ConnectionOptions {
            busy_timeout: Duration::from_secs(5),
        }))
        .build(manager)?;
    Ok(pool)
}

pub fn run_migrations(conn: &mut DbConnection) -> Result<()> {
    use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

    const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

    conn.run_pending_migrations(MIGRATIONS)
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!("Migration error: {}", e))
}

#[cfg(test)]
pub mod test_support {
    //! Throwaway databases and fixtures shared by the service tests.

    use super::*;
    use crate::models::*;
    use crate::schema::{
        devices, playlist_items, playlists, plugin_definitions, plugin_instances, schedules, users,
    };
    use chrono::NaiveDateTime;
    use diesel::prelude::*;
    use tempfile::TempDir;

    pub struct TestDb {
        pub pool: DbPool,
        _dir: TempDir,
    }

    impl TestDb {
        pub fn new() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let url = dir.path().join("test.db");
            let pool = create_pool(url.to_str().expect("utf-8 path")).expect("pool");
            run_migrations(&mut pool.get().expect("connection")).expect("migrations");
            Self { pool, _dir: dir }
        }

        pub fn conn(&self) -> DbConnection {
            self.pool.get().expect("connection")
        }
    }

    pub fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").expect("timestamp literal")
    }

    pub fn user(conn: &mut SqliteConnection, username: &str, timezone: Option<&str>) -> User {
        diesel::insert_into(users::table)
            .values(&NewUser {
                username: username.to_string(),
                role: "user".to_string(),
                timezone: timezone.map(str::to_string),
            })
            .returning(User::as_select())
            .get_result(conn)
            .expect("insert user")
    }

    /// Claimed device with an empty default playlist.
    pub fn device(conn: &mut SqliteConnection, owner: &User, friendly_id: &str) -> (Device, Playlist) {
        let device = diesel::insert_into(devices::table)
            .values(&NewDevice {
                friendly_id: friendly_id.to_string(),
                name: format!("Display {}", friendly_id),
                api_key: format!("key-{}", friendly_id),
                owner_id: Some(owner.id),
                is_claimed: true,
            })
            .returning(Device::as_select())
            .get_result(conn)
            .expect("insert device");

        let playlist = diesel::insert_into(playlists::table)
            .values(&NewPlaylist {
                device_id: device.id,
                user_id: owner.id,
                name: "Default".to_string(),
                is_default: true,
            })
            .returning(Playlist::as_select())
            .get_result(conn)
            .expect("insert playlist");

        (device, playlist)
    }

    pub fn definition(conn: &mut SqliteConnection, name: &str) -> PluginDefinition {
        diesel::insert_into(plugin_definitions::table)
            .values(&NewPluginDefinition {
                name: name.to_string(),
                schema_version: 1,
                settings_schema: None,
            })
            .returning(PluginDefinition::as_select())
            .get_result(conn)
            .expect("insert definition")
    }

    pub fn instance(
        conn: &mut SqliteConnection,
        owner: &User,
        definition: &PluginDefinition,
        refresh_interval: &str,
    ) -> PluginInstance {
        diesel::insert_into(plugin_instances::table)
            .values(&NewPluginInstance {
                user_id: owner.id,
                plugin_definition_id: definition.id,
                name: format!("{} instance", definition.name),
                settings: "{}".to_string(),
                refresh_interval: refresh_interval.to_string(),
                schema_version: definition.schema_version,
                next_render_at: None,
            })
            .returning(PluginInstance::as_select())
            .get_result(conn)
            .expect("insert instance")
    }

    pub fn item(
        conn: &mut SqliteConnection,
        playlist: &Playlist,
        instance: &PluginInstance,
        order: i32,
        visible: bool,
    ) -> PlaylistItem {
        diesel::insert_into(playlist_items::table)
            .values(&NewPlaylistItem {
                playlist_id: playlist.id,
                plugin_instance_id: instance.id,
                item_order: order,
                is_visible: visible,
                importance: false,
                duration_override: None,
                mirrored_from_item_id: None,
            })
            .returning(PlaylistItem::as_select())
            .get_result(conn)
            .expect("insert item")
    }

    pub fn schedule(
        conn: &mut SqliteConnection,
        item: &PlaylistItem,
        day_mask: i32,
        start: &str,
        end: &str,
        timezone: &str,
    ) -> Schedule {
        diesel::insert_into(schedules::table)
            .values(&NewSchedule {
                playlist_item_id: item.id,
                day_mask,
                start_time: start.to_string(),
                end_time: end.to_string(),
                timezone: timezone.to_string(),
                is_active: true,
            })
            .returning(Schedule::as_select())
            .get_result(conn)
            .expect("insert schedule")
    }
}
