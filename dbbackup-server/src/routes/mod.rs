pub mod jobs;
pub mod packages;
pub mod resources;
pub mod restores;
pub mod system;

use crate::error::AppError;
use crate::services::storage::Download;
use crate::state::AppState;
use axum::body::Body;
use axum::http::header;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api/resources", resources::router())
        .nest("/api/jobs", jobs::router())
        .nest("/api/restores", restores::router(state.clone()))
        .nest("/api/packages", packages::router())
        .nest("/api/system", system::router())
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        crate::metrics::render(),
    )
}

/// Turn a storage download into an HTTP response.
pub(crate) async fn download_response(download: Download) -> Result<Response, AppError> {
    let (file, file_name) = match download {
        Download::Redirect(url) => return Ok(Redirect::temporary(&url).into_response()),
        Download::File { path, file_name } => {
            let file = tokio::fs::File::open(&path)
                .await
                .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to open {}: {}", path.display(), e)))?;
            (file, file_name)
        }
        Download::Temp { file: temp, file_name } => {
            let file = tokio::fs::File::open(&temp)
                .await
                .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to open download copy: {}", e)))?;
            // The open handle keeps the data readable after the path is removed
            drop(temp);
            (file, file_name)
        }
    };

    let body = Body::from_stream(ReaderStream::new(file));
    let disposition = format!("attachment; filename=\"{}\"", file_name.replace('"', ""));
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}
