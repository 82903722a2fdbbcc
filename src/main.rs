use stagerelay::server::build_router;
use stagerelay::*;

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Arc::new(Args::parse());

    let filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "stagerelay=debug,tower_http=info".into(),
    };

    let _ = std::fs::create_dir_all(&args.log_dir);
    let file_appender = tracing_appender::rolling::daily(&args.log_dir, "stagerelay.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let stdout_layer = if args.log_json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(tracing_error::ErrorLayer::default())
        .init();

    stagerelay::logging::setup_panic_hook();

    let client = match reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let state = Arc::new(AppState::new(client, args.clone()));
    if let Err(e) = state.provider.resolve(None) {
        tracing::warn!(
            "Provider not fully configured ({}); turns will fail with missing_config",
            e.inner
        );
    }

    let app = build_router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("stagerelay listening on {}", addr);
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
    }
}
