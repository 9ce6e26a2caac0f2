pub mod ws;

use axum::{debug_handler, extract::{Path, State}, http::StatusCode, response::{IntoResponse, Response}, routing::{get, post}, Json, Router};
use serde::Deserialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{store, AppResult, AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/chat/conversations", post(create_conversation))
        .route("/chat/conversations/{conversation_id}", get(read_conversation))
        .route("/chat/conversations/{conversation_id}/messages", get(conversation_messages))
        .route("/chat/conversations/user/{user_id}", get(conversations_by_user))
        .route("/ws/chat/{conversation_id}", get(ws::chat_ws))
}

#[derive(Deserialize)]
struct NewConversation {
    user1_id: Uuid,
    user2_id: Uuid,
}

#[debug_handler]
async fn create_conversation(
    State(db_pool): State<SqlitePool>,
    Json(NewConversation { user1_id, user2_id }): Json<NewConversation>,
) -> AppResult<Response> {
    let conversation =
        store::create_conversation(&db_pool, &user1_id.to_string(), &user2_id.to_string()).await?;
    Ok((StatusCode::CREATED, Json(conversation)).into_response())
}

#[debug_handler]
async fn read_conversation(
    Path(conversation_id): Path<Uuid>,
    State(db_pool): State<SqlitePool>,
) -> AppResult<Response> {
    match store::get_conversation(&db_pool, &conversation_id.to_string()).await? {
        Some(conversation) => Ok(Json(conversation).into_response()),
        None => Ok((StatusCode::NOT_FOUND, "Conversation not found").into_response()),
    }
}

#[debug_handler]
async fn conversation_messages(
    Path(conversation_id): Path<Uuid>,
    State(db_pool): State<SqlitePool>,
) -> AppResult<Response> {
    let conversation_id = conversation_id.to_string();
    if store::get_conversation(&db_pool, &conversation_id).await?.is_none() {
        return Ok((StatusCode::NOT_FOUND, "Conversation not found").into_response());
    }
    Ok(Json(store::messages_by_conversation(&db_pool, &conversation_id).await?).into_response())
}

#[debug_handler]
async fn conversations_by_user(
    Path(user_id): Path<Uuid>,
    State(db_pool): State<SqlitePool>,
) -> AppResult<Response> {
    Ok(Json(store::conversations_by_user(&db_pool, &user_id.to_string()).await?).into_response())
}
