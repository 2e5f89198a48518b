use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub jwt: JwtConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub https: Option<HttpsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpsConfig {
    pub enabled: bool,
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub expiration_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Start the render worker together with the server.
    pub autostart: bool,
    pub poll_interval_secs: u64,
    /// External render service. Without it the worker draws placeholders.
    pub renderer_url: Option<String>,
    pub request_timeout_secs: u64,
    pub max_jobs_per_tick: usize,
    pub job_retention_hours: i64,
    /// Processing jobs older than this are considered abandoned.
    pub stale_after_secs: i64,
    pub bulk_deadline_secs: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            autostart: true,
            poll_interval_secs: 5,
            renderer_url: None,
            request_timeout_secs: 30,
            max_jobs_per_tick: 16,
            job_retention_hours: 72,
            stale_after_secs: 600,
            bulk_deadline_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Events buffered per subscriber before new ones are dropped.
    pub buffer_size: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { buffer_size: 32 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Refresh hint sent with an item that has no duration override.
    pub default_duration_secs: i32,
    /// Refresh hint sent with the sleep screen.
    pub sleep_refresh_secs: i32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            default_duration_secs: 900,
            sleep_refresh_secs: 1800,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.render.poll_interval_secs == 0 {
            bail!("render.poll_interval_secs must be greater than zero");
        }
        if self.render.max_jobs_per_tick == 0 {
            bail!("render.max_jobs_per_tick must be greater than zero");
        }
        if self.notifications.buffer_size == 0 {
            bail!("notifications.buffer_size must be greater than zero");
        }
        if self.display.default_duration_secs <= 0 || self.display.sleep_refresh_secs <= 0 {
            bail!("display refresh hints must be positive");
        }
        if let Some(url) = &self.render.renderer_url {
            url::Url::parse(url).map_err(|e| anyhow::anyhow!("render.renderer_url: {}", e))?;
        }
        Ok(())
    }

    pub fn default_template() -> &'static str {
        r#"[server]
host = "0.0.0.0"
port = 8080

[server.https]
enabled = false
cert_path = "certs/cert.pem"
key_path = "certs/key.pem"

[database]
# URL for the SQLite database. Ensure the directory exists.
url = "sqlite://paperboard.db"

[jwt]
# Must match the secret of the system that issues user tokens.
secret = "change-me-in-production"
expiration_hours = 24

[logging]
level = "info"

[render]
autostart = true
poll_interval_secs = 5
# External render service receiving {plugin_instance_id, definition, settings}.
# Leave unset to serve placeholder images.
# renderer_url = "http://localhost:3001/render"
request_timeout_secs = 30
max_jobs_per_tick = 16
job_retention_hours = 72
stale_after_secs = 600
bulk_deadline_secs = 300

[notifications]
buffer_size = 32

[display]
default_duration_secs = 900
sleep_refresh_secs = 1800
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_parses() {
        let config: Config = toml::from_str(Config::default_template()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.render.poll_interval_secs, 5);
        assert!(config.render.renderer_url.is_none());
        assert_eq!(config.notifications.buffer_size, 32);
    }

    #[test]
    fn test_optional_sections_default() {
        let config: Config = toml::from_str(
            r#"
[server]
host = "127.0.0.1"
port = 9000

[database]
url = "sqlite://test.db"

[jwt]
secret = "s"
expiration_hours = 1

[logging]
level = "debug"
"#,
        )
        .unwrap();

        assert!(config.render.autostart);
        assert_eq!(config.render.max_jobs_per_tick, 16);
        assert_eq!(config.display.default_duration_secs, 900);
        assert!(config.server.https.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config: Config = toml::from_str(Config::default_template()).unwrap();
        config.render.poll_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config: Config = toml::from_str(Config::default_template()).unwrap();
        config.render.renderer_url = Some("::nope".to_string());
        assert!(config.validate().is_err());
    }
}
