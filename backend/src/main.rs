use backend::{app, AppState};
use std::env;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let state = if let Ok(path) = env::var("PERSIST_PATH") {
        AppState::with_persistence(path).await
    } else {
        AppState::default()
    };
    let addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    tracing::info!(%addr, "starting secret santa gateway");
    axum::serve(
        tokio::net::TcpListener::bind(&addr).await.expect("bind"),
        app(state),
    )
    .await
    .expect("server error");
}
