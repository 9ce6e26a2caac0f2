pub mod ws;

use axum::{debug_handler, extract::{Path, State}, http::StatusCode, response::{IntoResponse, Response}, routing::{get, post}, Json, Router};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{store, AppResult, AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/community", get(list_communities).post(create_community))
        .route("/community/{community_id}/details", get(community_details))
        .route("/community/{community_id}/join", post(join_community))
        .route("/community/{community_id}/discussion", get(community_discussion))
        .route("/ws/community/{community_id}", get(ws::community_ws))
}

#[derive(Deserialize)]
struct NewCommunity {
    name: String,
    description: Option<String>,
}

#[derive(Deserialize)]
struct JoinRequest {
    user_id: Uuid,
}

#[derive(Serialize)]
struct DiscussionMessage {
    #[serde(flatten)]
    message: store::CommunityMessage,
    replies: Vec<store::Reply>,
}

#[debug_handler]
async fn list_communities(State(db_pool): State<SqlitePool>) -> AppResult<Response> {
    Ok(Json(store::list_communities(&db_pool).await?).into_response())
}

#[debug_handler]
async fn create_community(
    State(db_pool): State<SqlitePool>,
    Json(NewCommunity { name, description }): Json<NewCommunity>,
) -> AppResult<Response> {
    let community = store::create_community(&db_pool, &name, description.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(community)).into_response())
}

#[debug_handler]
async fn community_details(
    Path(community_id): Path<Uuid>,
    State(db_pool): State<SqlitePool>,
) -> AppResult<Response> {
    match store::get_community(&db_pool, &community_id.to_string()).await? {
        Some(community) => Ok(Json(community).into_response()),
        None => Ok((StatusCode::NOT_FOUND, "Community not found").into_response()),
    }
}

#[debug_handler]
async fn join_community(
    Path(community_id): Path<Uuid>,
    State(db_pool): State<SqlitePool>,
    Json(JoinRequest { user_id }): Json<JoinRequest>,
) -> AppResult<Response> {
    let community_id = community_id.to_string();
    let user_id = user_id.to_string();
    if store::get_community(&db_pool, &community_id).await?.is_none() {
        return Ok((StatusCode::NOT_FOUND, "Community not found").into_response());
    }
    if store::get_user(&db_pool, &user_id).await?.is_none() {
        return Ok((StatusCode::NOT_FOUND, "User not found").into_response());
    }
    if store::is_member(&db_pool, &user_id, &community_id).await? {
        return Ok((StatusCode::BAD_REQUEST, "User is already a member of this community").into_response());
    }
    let membership = store::join_community(&db_pool, &community_id, &user_id).await?;
    Ok((StatusCode::CREATED, Json(membership)).into_response())
}

#[debug_handler]
async fn community_discussion(
    Path(community_id): Path<Uuid>,
    State(db_pool): State<SqlitePool>,
) -> AppResult<Response> {
    let community_id = community_id.to_string();
    if store::get_community(&db_pool, &community_id).await?.is_none() {
        return Ok((StatusCode::NOT_FOUND, "Community not found").into_response());
    }
    let mut discussion = Vec::new();
    for message in store::community_discussion(&db_pool, &community_id).await? {
        let replies = store::replies_by_message(&db_pool, &message.id).await?;
        discussion.push(DiscussionMessage { message, replies });
    }
    Ok(Json(discussion).into_response())
}
