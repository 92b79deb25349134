//! Read-only JSON API over the character store, plus the published addon archive.

use std::future::Future;
use std::sync::Arc;

use armory_storage::{ArchiveStore, CharacterStore};
use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "armory-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CharacterStore>,
    pub archives: ArchiveStore,
    /// File name of the published archive inside `archives`.
    pub archive_name: String,
}

impl AppState {
    pub fn new(
        store: Arc<dyn CharacterStore>,
        archives: ArchiveStore,
        archive_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            archives,
            archive_name: archive_name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Stats {
    pub characters: u64,
    pub accounts: u64,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/stats", get(stats_handler))
        .route("/api/characters/{name}", get(characters_handler))
        .route("/api/races", get(races_handler))
        .route("/api/classes", get(classes_handler))
        .route("/addon", get(addon_handler))
        .layer(middleware::map_response(allow_any_origin))
        .with_state(Arc::new(state))
}

/// Serves until `shutdown` resolves, then drains in-flight requests.
pub async fn serve<F>(state: AppState, port: u16, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "read api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Runs [`serve`] on its own task. A failure (for example the port already being taken)
/// is logged as soon as the task ends.
pub fn spawn_serve<F>(state: AppState, port: u16, shutdown: F) -> JoinHandle<anyhow::Result<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let result = serve(state, port, shutdown).await;
        if let Err(err) = &result {
            error!(port, error = %err, "read api stopped");
        }
        result
    })
}

async fn allow_any_origin(mut response: Response) -> Response {
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    let characters = match state.store.count_all().await {
        Ok(n) => n,
        Err(err) => return server_error(err),
    };
    match state.store.count_distinct_logins().await {
        Ok(accounts) => Json(Stats {
            characters,
            accounts,
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn characters_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    match state.store.characters_sharing_login(&name).await {
        Ok(Some(characters)) => Json(characters).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Character not found" })),
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

async fn races_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.count_by_race().await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn classes_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.count_by_class().await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn addon_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.archives.read_published(&state.archive_name).await {
        Ok(Some(bytes)) => {
            let disposition = format!("attachment; filename=\"{}\"", state.archive_name);
            (
                [
                    (header::CONTENT_TYPE, "application/zip".to_string()),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                bytes,
            )
                .into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Addon not generated yet" })),
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: impl std::fmt::Display) -> Response {
    warn!(error = %err, "read api request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}
