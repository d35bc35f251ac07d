//! coursemedia server binary

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use coursemedia::api::{create_router, AppState};
use coursemedia::config::{AppConfig, LogFormat};
use coursemedia::media::MediaStorage;
use coursemedia::storage::create_storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("failed to load configuration")?;

    init_tracing(&config)?;

    let (media_config, storage_config) = config
        .media_runtime()
        .context("invalid storage configuration")?;

    let backend = create_storage(storage_config)
        .await
        .context("failed to initialise storage backend")?;

    tracing::info!(
        location = %media_config.location,
        preload_metadata = media_config.cache.enabled,
        buffer_size = media_config.file_buffer_size,
        "Media storage initialised"
    );

    let storage = Arc::new(MediaStorage::new(backend, media_config));
    let router = create_router(AppState::new(storage));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    tracing::info!(%addr, "Listening for HTTP traffic");

    axum::serve(listener, router).await?;

    Ok(())
}

fn init_tracing(config: &AppConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.logging.level.clone()))
        .unwrap_or_else(|_| EnvFilter::new("coursemedia=info,tower_http=info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.logging.format {
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    }

    Ok(())
}
