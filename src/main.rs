use sse_notify::config::Config;
use sse_notify::events;
use sse_notify::handlers::{self, AppState};
use sse_notify::manager::EventManager;
use sse_notify::provider::NotificationProvider;
use sse_notify::registry::EventRegistry;
use sse_notify::{db, store};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env().expect("invalid configuration");

    let pool = db::init_pool(&config.database_url)
        .await
        .expect("failed to connect to Postgres");

    sqlx::migrate!("./db/migrations")
        .run(&pool)
        .await
        .expect("failed to run database migrations");

    tracing::info!("database migrations applied successfully");

    let registry = Arc::new(EventRegistry::new());
    events::register_builtin_types(&registry);
    registry.freeze();

    let event_store = Arc::new(store::PgEventStore::new(pool));
    let manager = EventManager::new(config.clone(), event_store, registry).await;
    manager.spawn_workers();

    let provider = Arc::new(NotificationProvider::new(manager.clone()));
    let state = AppState {
        provider,
        heartbeat_interval: config.heartbeat_interval,
    };

    let app = handlers::router(state).layer(
        CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any),
    );

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .expect("invalid HOST/PORT");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");

    tracing::info!(%addr, "sse-notify listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager.clone()))
        .await
        .expect("server failed to start");
}

async fn shutdown_signal(manager: Arc<EventManager>) {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl_c handler");
    tracing::info!("shutdown signal received");
    manager.shutdown().await;
}
