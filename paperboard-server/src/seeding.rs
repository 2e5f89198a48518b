use crate::db::DbPool;
use crate::models::{NewPluginDefinition, NewUser, PluginDefinition};
use anyhow::Result;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

struct DefaultDefinition {
    name: &'static str,
    settings_schema: &'static str,
}

const DEFAULT_DEFINITIONS: &[DefaultDefinition] = &[
    DefaultDefinition {
        name: "clock",
        settings_schema: r#"{"type":"object","properties":{"format":{"type":"string","enum":["12h","24h"]}}}"#,
    },
    DefaultDefinition {
        name: "weather",
        settings_schema: r#"{"type":"object","properties":{"location":{"type":"string"},"units":{"type":"string","enum":["metric","imperial"]}},"required":["location"]}"#,
    },
    DefaultDefinition {
        name: "calendar",
        settings_schema: r#"{"type":"object","properties":{"ics_url":{"type":"string"},"days":{"type":"integer","minimum":1}},"required":["ics_url"]}"#,
    },
    DefaultDefinition {
        name: "image",
        settings_schema: r#"{"type":"object","properties":{"url":{"type":"string"}},"required":["url"]}"#,
    },
];

pub fn seed_defaults(pool: &DbPool) -> Result<()> {
    let mut conn = pool.get()?;
    tracing::info!("Seeding default values...");

    seed_definitions(&mut conn)?;
    seed_users(&mut conn)?;

    Ok(())
}

/// Built-in definitions are inserted once. Existing rows keep their schema
/// version; bumps go through the schema-change endpoint.
fn seed_definitions(conn: &mut SqliteConnection) -> Result<()> {
    use crate::schema::plugin_definitions::dsl::*;

    for def in DEFAULT_DEFINITIONS {
        let existing: Option<PluginDefinition> = plugin_definitions
            .filter(name.eq(def.name))
            .select(PluginDefinition::as_select())
            .first(conn)
            .optional()?;

        if existing.is_none() {
            tracing::info!("Seeding plugin definition: {}", def.name);
            diesel::insert_into(plugin_definitions)
                .values(&NewPluginDefinition {
                    name: def.name.to_string(),
                    schema_version: 1,
                    settings_schema: Some(def.settings_schema.to_string()),
                })
                .execute(conn)?;
        }
    }
    Ok(())
}

fn seed_users(conn: &mut SqliteConnection) -> Result<()> {
    use crate::schema::users::dsl::*;

    let exists: i64 = users
        .filter(username.eq("admin"))
        .count()
        .get_result(conn)?;

    if exists == 0 {
        tracing::info!("Seeding user: admin");
        diesel::insert_into(users)
            .values(&NewUser {
                username: "admin".to_string(),
                role: "admin".to_string(),
                timezone: None,
            })
            .execute(conn)?;
    }

    Ok(())
}
