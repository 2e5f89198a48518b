mod api;
mod auth;
mod config;
mod db;
mod error;
mod models;
mod schema;
mod seeding;
mod services;
mod validation;
mod websocket;

use anyhow::Result;
use axum::{routing::get, Router};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::db::DbPool;
use crate::services::{notifications::NotificationHub, render_worker::RenderWorker, renderer};

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub config: Arc<Config>,
    pub notifications: Arc<NotificationHub>,
    pub render_worker: Arc<RenderWorker>,
    // Background re-renders per plugin definition, cancelled by a newer schema bump
    pub bulk_jobs: Arc<Mutex<HashMap<i32, CancellationToken>>>,
}

use clap::Parser;

#[derive(Parser)]
#[command(version, author = "PAPERBOARD AUTHORS", about = "Paperboard Server\nLicensed under AGPLv3\nCreated by PAPERBOARD AUTHORS", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Generate a default configuration template to stdout
    #[arg(long)]
    generate_config: bool,

    /// Print a session token for an existing user and exit
    #[arg(long, value_name = "USERNAME")]
    issue_token: Option<String>,
}

fn run_onboarding() -> Result<()> {
    use dialoguer::{theme::ColorfulTheme, Input};

    println!("Welcome to Paperboard Server!");
    println!("It looks like you don't have a configuration file yet.");
    println!("Let's get you set up.\n");

    let host: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Server Host")
        .default("0.0.0.0".to_string())
        .interact_text()?;

    let port: u16 = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Server Port")
        .default(8080)
        .interact_text()?;

    let db_url: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Database URL")
        .default("sqlite://paperboard.db".to_string())
        .interact_text()?;

    let renderer_url: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Render service URL (empty for placeholders)")
        .allow_empty(true)
        .interact_text()?;

    let jwt_secret = uuid::Uuid::new_v4().to_string();

    let mut config: Config = toml::from_str(Config::default_template())?;
    config.server.host = host;
    config.server.port = port;
    config.database.url = db_url;
    config.jwt.secret = jwt_secret;
    config.render.renderer_url = Some(renderer_url.trim().to_string()).filter(|u| !u.is_empty());
    config.validate()?;

    println!("\nGenerating configuration file: server-config.toml");
    std::fs::write("server-config.toml", toml::to_string_pretty(&config)?)?;
    println!("Configuration saved successfully!");
    println!("----------------------------------------\n");

    Ok(())
}

fn issue_token(config: &Config, pool: &DbPool, name: &str) -> Result<String> {
    use crate::models::User;
    use crate::schema::users::dsl::*;
    use diesel::prelude::*;

    let mut conn = pool.get()?;
    let user = users
        .filter(username.eq(name))
        .select(User::as_select())
        .first(&mut conn)
        .optional()?
        .ok_or_else(|| anyhow::anyhow!("No user named '{}'", name))?;

    auth::jwt::create_token(
        user.id,
        &user.username,
        &user.role,
        &config.jwt.secret,
        config.jwt.expiration_hours,
    )
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI args
    let cli = Cli::parse();

    if cli.generate_config {
        println!("{}", Config::default_template());
        return Ok(());
    }

    // Determine config path
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| "server-config.toml".to_string());

    // Only offer onboarding for the implicit path on an interactive terminal
    if std::fs::metadata(&config_path).is_err() && cli.config.is_none() && console::user_attended() {
        if let Err(e) = run_onboarding() {
            eprintln!("Onboarding failed: {}", e);
            std::process::exit(1);
        }
    }

    if std::fs::metadata(&config_path).is_err() {
        eprintln!("Error: Configuration file '{}' not found.", config_path);
        eprintln!("Run with --generate-config to see a template.");
        std::process::exit(1);
    }

    // Load configuration
    let config = Config::load(&config_path)?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("paperboard_server={},tower_http=debug", config.logging.level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Loaded configuration from {}", config_path);

    // Setup database
    let db_pool = db::create_pool(&config.database.url)?;
    db::run_migrations(&mut db_pool.get()?)?;
    seeding::seed_defaults(&db_pool)?;
    tracing::info!("Database initialized and seeded");

    if let Some(username) = &cli.issue_token {
        println!("{}", issue_token(&config, &db_pool, username)?);
        return Ok(());
    }

    let renderer = renderer::from_config(&config.render)?;
    let render_worker = Arc::new(RenderWorker::new(
        db_pool.clone(),
        renderer,
        config.render.clone(),
    ));

    // Create app state
    let state = AppState {
        db: db_pool,
        config: Arc::new(config.clone()),
        notifications: Arc::new(NotificationHub::new(config.notifications.buffer_size)),
        render_worker: render_worker.clone(),
        bulk_jobs: Arc::new(Mutex::new(HashMap::new())),
    };

    if config.render.autostart {
        render_worker.start().await;
    } else {
        tracing::info!("Render worker autostart disabled");
    }

    // Get address before moving state
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);

    // Build router
    let app = Router::new()
        // Pass state.clone() to allow middleware configuration
        .nest("/api", api::routes(state.clone()))
        // Device event subscriptions
        .route("/ws", get(websocket::ws_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // Start server
    let listener_address: std::net::SocketAddr = addr
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid host/port: {}", e))?;

    match &config.server.https {
        Some(https_config) if https_config.enabled => {
            use axum_server::tls_rustls::RustlsConfig;

            tracing::info!("Starting server in HTTPS mode on {}", addr);

            // Validate cert paths
            if !std::path::Path::new(&https_config.cert_path).exists() {
                anyhow::bail!("Certificate file not found: {}", https_config.cert_path);
            }
            if !std::path::Path::new(&https_config.key_path).exists() {
                anyhow::bail!("Key file not found: {}", https_config.key_path);
            }

            let tls_config =
                RustlsConfig::from_pem_file(&https_config.cert_path, &https_config.key_path)
                    .await?;

            let handle = axum_server::Handle::new();
            let shutdown = handle.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                shutdown.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
            });

            axum_server::bind_rustls(listener_address, tls_config)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
        _ => {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!("Server listening on {} (HTTP)", addr);

            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
    }

    render_worker.stop().await;
    tracing::info!("Server stopped");

    Ok(())
}
