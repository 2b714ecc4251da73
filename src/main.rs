//! Entry point: load config, wire dependencies, and run the server.

use axum::http::{header, HeaderValue, Method};
use cartroom::auth::JwtSecret;
use cartroom::config::Config;
use cartroom::db::{self, PgRoomStore};
use cartroom::repositories::RedisRepository;
use cartroom::services::{ChannelService, MemoryRoomStore, RoomService, RoomStore};
use cartroom::{create_app, AppState};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("config: {}", e))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store: Arc<dyn RoomStore> = match &config.database_url {
        Some(url) => {
            let pool = db::create_pool(url).await?;
            db::run_migrations(&pool).await?;
            tracing::info!("room store: postgres");
            Arc::new(PgRoomStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, rooms are kept in memory and lost on restart");
            Arc::new(MemoryRoomStore::new())
        }
    };

    let channels = match &config.redis_url {
        Some(url) => {
            tracing::info!("room broadcasts relayed through redis");
            ChannelService::with_relay(Arc::new(RedisRepository::new(url)?))
        }
        None => ChannelService::local(),
    };

    let room_service = RoomService::new(store, channels, config.pricing, config.store_timeout);
    let state = AppState::new(room_service, JwtSecret::new(config.jwt_secret.clone()));

    let mut app = create_app(state);
    if let Some(origin) = &config.client_url {
        let cors = CorsLayer::new()
            .allow_origin(origin.parse::<HeaderValue>()?)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
            .allow_credentials(true);
        app = app.layer(cors);
    }

    tracing::info!(addr = %config.server_addr, "listening");
    let listener = tokio::net::TcpListener::bind(config.server_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
