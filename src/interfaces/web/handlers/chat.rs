use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use super::super::AppState;
use super::super::error::ApiError;
use crate::core::messages::{UserInfo, WorkItem};
use crate::core::store::NewMessage;
use crate::core::transport::publish_item;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    prompt: String,
    session_id: Option<String>,
    user_id: Option<String>,
    user_name: Option<String>,
    user_email: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub reply: String,
    pub message_id: Uuid,
    pub session_id: Uuid,
    pub no_answer: bool,
}

/// Reply text that signals the model had nothing useful to say.
pub fn is_no_answer(reply: &str) -> bool {
    let lower = reply.to_lowercase();
    reply.trim().is_empty() || lower.contains("i'm not sure") || lower.contains("cannot help")
}

fn or_default(value: Option<String>, default: &str) -> String {
    value
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub async fn chat_endpoint(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Json(payload) = payload?;
    if payload.prompt.trim().is_empty() {
        return Err(ApiError::InvalidRequest("Prompt is required".to_string()));
    }

    let session_id = match payload.session_id.filter(|s| !s.trim().is_empty()) {
        Some(raw) => {
            let id = Uuid::parse_str(raw.trim())
                .map_err(|_| ApiError::InvalidRequest(format!("Invalid session_id: {raw}")))?;
            state.store.ensure_session(id).await?;
            id
        }
        None => state.store.create_session().await?.id,
    };

    let demo = &state.gateway.demo_user;
    let user = UserInfo {
        id: or_default(payload.user_id, &demo.id),
        name: or_default(payload.user_name, &demo.name),
        email: or_default(payload.user_email, &demo.email),
    };

    let conversation_history = if state.gateway.history_turns > 0 {
        match state
            .store
            .recent_exchanges(session_id, state.gateway.history_turns)
            .await
        {
            Ok(turns) => turns,
            Err(e) => {
                warn!(session_id = %session_id, "Could not load conversation history: {:#}", e);
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    let request_id = Uuid::new_v4();
    let item = WorkItem {
        request_id,
        session_id,
        prompt: payload.prompt,
        conversation_history,
        user,
    };

    // Register before publishing so a fast reply cannot slip past the waiter.
    let pending = state.table.register(request_id);
    publish_item(state.publisher.as_ref(), &state.request_queue, &item)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to queue chat request: {e}")))?;
    info!(
        user_id = %item.user.id,
        request_id = %request_id,
        session_id = %session_id,
        "Published chat request to queue, waiting for worker response"
    );

    let started = Instant::now();
    let result = pending.wait(state.gateway.wait_timeout).await?;
    let wait_time = started.elapsed().as_secs_f64();

    let no_answer = is_no_answer(&result.response);
    let stored = state
        .store
        .insert_message(NewMessage {
            session_id,
            user: item.user,
            prompt: item.prompt,
            reply: result.response,
            no_answer,
        })
        .await?;

    info!(
        user_id = %stored.user_id,
        request_id = %request_id,
        message_id = %stored.id,
        wait_time,
        "Handled chat request via async queue"
    );

    Ok(Json(ChatResponse {
        reply: stored.reply,
        message_id: stored.id,
        session_id,
        no_answer,
    }))
}
