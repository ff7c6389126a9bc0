pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/ping", get(handlers::handle_ping))
        .route("/status", get(handlers::handle_status))
        .route("/submit", post(handlers::handle_submit))
        .route("/requests", get(handlers::handle_requests))
        .route("/requests/{id}", get(handlers::handle_request))
        .route("/requests/{id}/cancel", post(handlers::handle_cancel))
        .route("/requests/{id}/shaping", post(handlers::handle_shaping))
        .route("/nodes", get(handlers::handle_nodes))
        .route("/nodes/add", post(handlers::handle_nodes_add))
        .route("/nodes/remove", post(handlers::handle_nodes_remove))
        .route("/daemon/shutdown", post(handlers::handle_shutdown))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(cors);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "API listening on 127.0.0.1");
    axum::serve(listener, app).await?;
    Ok(())
}
