use canvas_sync::config::ServerConfig;
use canvas_sync::{db, routes, services, state};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env();

    let pool = match &config.database_url {
        Some(url) => Some(
            db::init_pool(url, config.db_max_connections)
                .await
                .expect("database init failed"),
        ),
        None => {
            tracing::warn!("DATABASE_URL not set; shapes will not survive a restart");
            None
        }
    };

    let port = config.port;
    let state = state::AppState::new(pool, config);

    // Spawn background persistence task.
    let _persistence = services::persistence::spawn_persistence_task(state.clone());

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "canvas relay listening");
    axum::serve(listener, app).await.expect("server failed");
}
