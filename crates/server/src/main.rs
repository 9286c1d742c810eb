mod bootstrap;
mod http;

use anyhow::Result;
use kopi_core::config::{AppConfig, LoadOptions, LogFormat};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_tracing(&config.logging.level, config.logging.format);

    let app = bootstrap::bootstrap(config).await?;

    let state = http::ApiState::from_application(&app);
    let router = http::router(state, &app.config.server.cors_origins);

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!(
        address = %address,
        catalog_size = app.catalog_size,
        "kopi-server started"
    );

    axum::serve(listener, router).with_graceful_shutdown(wait_for_shutdown()).await?;

    info!("kopi-server stopping");
    Ok(())
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
