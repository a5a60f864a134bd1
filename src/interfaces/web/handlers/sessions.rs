use axum::{
    Json,
    extract::{Path, State},
};
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use super::super::AppState;
use super::super::error::ApiError;
use crate::core::store::{SessionSummary, StoredMessage};

fn session_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::InvalidRequest(format!("Invalid session_id: {raw}")))
}

pub async fn list_sessions_endpoint(
    State(state): State<AppState>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    Ok(Json(state.store.list_sessions().await?))
}

pub async fn create_session_endpoint(
    State(state): State<AppState>,
) -> Result<Json<SessionSummary>, ApiError> {
    let session = state.store.create_session().await?;
    info!(session_id = %session.id, "Created chat session");
    Ok(Json(session))
}

pub async fn session_messages_endpoint(
    Path(raw): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vec<StoredMessage>>, ApiError> {
    let id = session_id(&raw)?;
    state
        .store
        .session_messages(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Session {id} not found")))
}

pub async fn delete_session_endpoint(
    Path(raw): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let id = session_id(&raw)?;
    let existed = state.store.delete_session(id).await?;
    info!(session_id = %id, existed, "Deleted chat session");
    Ok(Json(json!({ "deleted": id })))
}
