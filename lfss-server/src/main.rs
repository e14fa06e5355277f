mod admin;
mod auth;
mod dto;
mod error;
mod native;
mod query;
mod state;
mod webdav_http;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use lfss_core::types::FileReadPermission;
use lfss_core::{metadata, user, Config, Engine};
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use state::AppState;

/// Lightweight multi-tenant file storage — native HTTP/JSON API plus
/// an optional WebDAV surface, backed by a single-writer SQLite store.
#[derive(Parser)]
#[command(name = "lfss-server")]
#[command(about = "Lightweight file storage server")]
struct Cli {
    /// Listen address
    #[arg(short, long, env = "LFSS_BIND", default_value = "0.0.0.0:8080")]
    addr: String,

    /// Data directory (overrides LFSS_DATA)
    #[arg(long, env = "LFSS_DATA")]
    data: Option<String>,

    /// Enable the WebDAV surface (overrides LFSS_WEBDAV)
    #[arg(long, env = "LFSS_WEBDAV")]
    webdav: bool,

    /// Bootstrap an initial admin user `username:password` if it
    /// doesn't already exist.
    #[arg(long)]
    init_admin: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(data) = &cli.data {
        config.data_home = data.into();
        config.external_dir = config.data_home.join("large_blobs");
        config.thumb_db_path = config.data_home.join("thumbs.1.db");
    }
    if cli.webdav {
        config.webdav_enabled = true;
    }

    if !config.disable_logging {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .init();
    }

    let engine = Engine::open(config).await?;

    if let Some(spec) = &cli.init_admin {
        bootstrap_admin(&engine, spec).await?;
    }

    let addr: SocketAddr = cli.addr.parse()?;
    tracing::info!(%addr, "starting lfss-server");
    run_server(addr, engine).await
}

async fn bootstrap_admin(engine: &Arc<Engine>, spec: &str) -> anyhow::Result<()> {
    let (username, password) = spec
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("--init-admin expects username:password"))?;
    let credential = user::hash_credential(username, password);
    let username = username.to_string();

    let mut cursor = engine.pool().write_cursor().await;
    let existing = {
        let username = username.clone();
        cursor.with(move |conn| metadata::users::get_user_by_username(conn, &username)).await?
    };
    if existing.is_some() {
        tracing::info!(%username, "admin user already exists, skipping bootstrap");
        return Ok(());
    }
    cursor
        .with(move |conn| {
            metadata::users::create_user(conn, &username, &credential, true, u64::MAX, FileReadPermission::Private)
        })
        .await?;
    tracing::info!("bootstrapped admin user");
    Ok(())
}

fn build_router(engine: Arc<Engine>) -> axum::Router {
    let app_state = AppState { engine };
    let api = admin::router();

    axum::Router::new()
        .nest("/_api", api.clone())
        .nest("/.api", api)
        .fallback(native::dispatch)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)),
        )
        .with_state(app_state)
}

async fn run_server(addr: SocketAddr, engine: Arc<Engine>) -> anyhow::Result<()> {
    let shutdown_engine = engine.clone();
    let app = build_router(engine);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_engine))
        .await?;
    Ok(())
}

/// Waits for ctrl-c (or SIGTERM on unix), then drains the debounce
/// queues before the listener is dropped, per §5's "pending debounce
/// tasks must complete before connections close."
async fn shutdown_signal(engine: Arc<Engine>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received, draining debounce queues");
    engine.debounce().shutdown().await;
}
