use axum::{Json, extract::State};
use serde_json::json;

use super::super::AppState;

pub async fn health_endpoint(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": state.service.name,
        "env": state.service.env,
        "parked_results": state.table.parked_len(),
        "pending_requests": state.table.pending_len(),
    }))
}
