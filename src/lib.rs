pub mod chat;
pub mod community;
pub mod registry;
pub mod store;
pub mod users;

use axum::{extract::FromRef, http::StatusCode, response::{IntoResponse, Response}};
use sqlx::SqlitePool;

use crate::registry::RoomRegistry;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub registry: RoomRegistry,
}

pub type AppResult<T> = Result<T, AppError>;
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{}\n\n{}", self.0, self.0.backtrace()),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // AppResult must be debuggable so fallible helpers can be unwrapped
    // in tests
    #[test]
    fn app_error_is_debuggable() {
        let err: AppResult<()> = Err(AppError(anyhow::anyhow!("boom")));
        assert!(format!("{err:?}").contains("boom"));
    }
}
