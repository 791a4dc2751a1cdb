mod config;

use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use huddle_api::AppStateInner;
use huddle_db::Database;
use huddle_gateway::{Hub, SessionConfig};

use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    // Init database
    let db = Arc::new(Database::open(&config.db_path)?);

    // One hub for the whole process
    let hub = Hub::spawn(config.queue_capacity);
    let session = SessionConfig {
        heartbeat_interval: config.heartbeat_interval,
        ..SessionConfig::default()
    };
    let state = AppStateInner::new(db, hub, &config.jwt_secret, session);

    let app = huddle_api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!(
        "Huddle server listening on {} (queue capacity {}, heartbeat {:?})",
        config.addr, config.queue_capacity, config.heartbeat_interval
    );

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
