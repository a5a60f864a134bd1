use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Request, header},
    middleware,
    middleware::Next,
    routing::{delete, get, post},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::handlers::{chat, health, sessions};

pub fn build_api_router(state: AppState) -> Router {
    Router::new()
        .route("/chat", post(chat::chat_endpoint))
        .route("/health", get(health::health_endpoint))
        .route(
            "/sessions",
            get(sessions::list_sessions_endpoint).post(sessions::create_session_endpoint),
        )
        .route(
            "/sessions/{session_id}",
            delete(sessions::delete_session_endpoint),
        )
        .route(
            "/sessions/{session_id}/messages",
            get(sessions::session_messages_endpoint),
        )
        .layer(middleware::from_fn(security_headers))
        // Browser demo frontends are served from other origins
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    response
}
