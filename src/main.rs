use axum::routing::get;
use axum::Router;
use dotenvy::dotenv;
use log::{info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use waserver::config::AppConfig;
use waserver::scheduler::SchedulerService;
use waserver::shared::state::AppState;
use waserver::shared::utils::create_conn;
use waserver::{api, realtime, webhook};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info,hyper=warn,reqwest=warn");
    }
    env_logger::init();

    let config = AppConfig::load()?;
    let conn = create_conn(&config.database.url)?;
    info!("database pool ready ({})", config.database.max_connections);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    if config.dev_mode {
        warn!("DEV_MODE is on: webhook signature verification is relaxed");
    }

    let state = Arc::new(AppState::new(conn, config)?);

    let scheduler = SchedulerService::new(Arc::clone(&state));
    tokio::spawn(scheduler.spawn());

    let cors = build_cors(&state);
    let app = Router::new()
        .merge(webhook::router())
        .merge(api::router())
        .route("/ws", get(realtime::websocket_handler))
        .nest_service("/media", tower_http::services::ServeDir::new("./media"))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&state));

    info!("waserver {} listening on {}", env!("CARGO_PKG_VERSION"), addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("shutdown complete");
    Ok(())
}

fn build_cors(state: &Arc<AppState>) -> CorsLayer {
    let origins = &state.config.cors_origins;
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let parsed: Vec<axum::http::HeaderValue> =
        origins.iter().filter_map(|o| o.parse().ok()).collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

/// SIGINT or SIGTERM drains in-flight work via axum's graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("ctrl_c handler installs");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installs")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received, draining"),
        _ = terminate => info!("SIGTERM received, draining"),
    }
}
