//! `POST /squads/{id}/conversations`, `POST /conversations/{id}/messages`,
//! `GET /conversations/{id}/timeline`, plus `POST /squads/{id}/messages`
//! for squad-scoped broadcasts such as a standup, which has no conversation
//! to attach to.

use super::AppState;
use crate::error::{Error, Result};
use crate::model::{Message, MessageType};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use uuid::Uuid;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/squads/{id}/conversations", post(open_conversation))
        .route("/squads/{id}/messages", post(broadcast))
        .route("/conversations/{id}/messages", post(post_message))
        .route("/conversations/{id}/timeline", get(timeline))
}

#[derive(Debug, Deserialize)]
struct OpenConversationRequest {
    #[serde(rename = "askerAgentId")]
    asker_agent_id: Uuid,
    #[serde(rename = "questionType")]
    question_type: String,
    content: String,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
    #[serde(rename = "taskExecutionId", default)]
    task_execution_id: Option<Uuid>,
}

async fn open_conversation(
    State(state): State<AppState>,
    Path(squad_id): Path<Uuid>,
    Json(req): Json<OpenConversationRequest>,
) -> Result<impl IntoResponse> {
    let conversation = state
        .conversations
        .open(
            squad_id,
            req.asker_agent_id,
            &req.question_type,
            &req.content,
            req.metadata,
            req.task_execution_id,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

#[derive(Debug, Deserialize)]
struct BroadcastRequest {
    #[serde(rename = "senderAgentId")]
    sender_agent_id: Uuid,
    #[serde(rename = "type")]
    message_type: String,
    content: String,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

async fn broadcast(
    State(state): State<AppState>,
    Path(squad_id): Path<Uuid>,
    Json(req): Json<BroadcastRequest>,
) -> Result<impl IntoResponse> {
    let message_type = MessageType::parse(&req.message_type)
        .ok_or_else(|| Error::Invalid(format!("unknown message type {}", req.message_type)))?;
    let message = Message {
        id: Uuid::new_v4(),
        conversation_id: None,
        sender_agent_id: req.sender_agent_id,
        recipient_agent_id: None,
        message_type,
        content: req.content,
        metadata: req.metadata,
        created_at: Utc::now(),
    };
    let id = state.bus.publish(squad_id, message).await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "messageId": id }))))
}

#[derive(Debug, Deserialize)]
struct PostMessageRequest {
    #[serde(rename = "senderAgentId")]
    sender_agent_id: Uuid,
    #[serde(rename = "type")]
    message_type: String,
    content: String,
}

async fn post_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Json(req): Json<PostMessageRequest>,
) -> Result<impl IntoResponse> {
    match req.message_type.as_str() {
        "answer" => {
            state
                .conversations
                .answer(conversation_id, req.sender_agent_id, &req.content)
                .await?
        }
        "acknowledgment" => {
            state
                .conversations
                .acknowledge(conversation_id, req.sender_agent_id)
                .await?
        }
        "question" => {
            state
                .conversations
                .follow_up(conversation_id, req.sender_agent_id, &req.content)
                .await?
        }
        other => {
            return Err(Error::Invalid(format!(
                "unsupported message type '{other}' for /conversations/{{id}}/messages; \
                 expected answer, acknowledgment, or question"
            )))
        }
    }

    let latest_sequence = state.store.max_sequence(conversation_id).await?;
    let event = state
        .store
        .read_timeline(conversation_id, latest_sequence.max(1), 1)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::NotFound(format!("no events for conversation {conversation_id}")))?;
    Ok((StatusCode::CREATED, Json(event)))
}

#[derive(Debug, Deserialize)]
struct TimelineQuery {
    #[serde(rename = "fromSequence", default = "default_from_sequence")]
    from_sequence: i64,
    #[serde(default = "default_timeline_limit")]
    limit: i64,
}

fn default_from_sequence() -> i64 {
    1
}

fn default_timeline_limit() -> i64 {
    500
}

async fn timeline(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<TimelineQuery>,
) -> Result<impl IntoResponse> {
    // existence check so an unknown conversation id 404s rather than
    // silently returning an empty timeline.
    state.repo.get_conversation(conversation_id).await?;
    let events = state
        .store
        .read_timeline(conversation_id, query.from_sequence, query.limit)
        .await?;
    Ok(Json(events))
}
