use axum::{debug_handler, extract::{Path, State}, http::StatusCode, response::{IntoResponse, Response}, routing::get, Json, Router};
use serde::Deserialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{store, AppResult, AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/users", get(list_users).post(create_user))
        .route("/users/{user_id}", get(read_user))
}

#[derive(Deserialize)]
struct NewUser {
    email: String,
    name: String,
    profile_picture: Option<String>,
}

#[debug_handler]
async fn create_user(
    State(db_pool): State<SqlitePool>,
    Json(NewUser { email, name, profile_picture }): Json<NewUser>,
) -> AppResult<Response> {
    if store::get_user_by_email(&db_pool, &email).await?.is_some() {
        return Ok((StatusCode::BAD_REQUEST, "Email already registered").into_response());
    }
    let user = store::create_user(&db_pool, &email, &name, profile_picture.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(user)).into_response())
}

#[debug_handler]
async fn list_users(State(db_pool): State<SqlitePool>) -> AppResult<Response> {
    Ok(Json(store::list_users(&db_pool).await?).into_response())
}

#[debug_handler]
async fn read_user(
    Path(user_id): Path<Uuid>,
    State(db_pool): State<SqlitePool>,
) -> AppResult<Response> {
    match store::get_user(&db_pool, &user_id.to_string()).await? {
        Some(user) => Ok(Json(user).into_response()),
        None => Ok((StatusCode::NOT_FOUND, "User not found").into_response()),
    }
}
