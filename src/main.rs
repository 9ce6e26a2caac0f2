use axum::{response::IntoResponse, routing::get, Json, Router};
use backchat::{chat, community, registry::RoomRegistry, store, users, AppState};
use sqlx::sqlite::SqlitePoolOptions;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "backchat=debug,tower_http=info".into()),
        )
        .init();

    let database_url =
        dotenv::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:backchat.db?mode=rwc".to_owned());
    let db_pool = SqlitePoolOptions::new()
        .max_connections(16)
        .connect(&database_url)
        .await
        .unwrap();
    store::init_db(&db_pool).await.unwrap();

    let app_state = AppState {
        db_pool,
        registry: RoomRegistry::new(),
    };

    let app = Router::new()
        .route("/", get(root))
        .merge(users::router())
        .merge(chat::router())
        .merge(community::router())
        .with_state(app_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = dotenv::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned());
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    info!(%addr, "listening");
    axum::serve(listener, app).await.unwrap();
}

async fn root() -> impl IntoResponse {
    Json(serde_json::json!({ "message": "backchat is up" }))
}
