use crate::db::with_conn;
use crate::error::AppError;
use crate::models::job::TriggerOrigin;
use crate::models::package::{self, Package, PackageConfig, PackageFormat};
use crate::models::settings;
use crate::routes::download_response;
use crate::services::backup_scheduler::validate_cron;
use crate::services::{packager, retention};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/",
            get(list_packages).post(trigger_package).delete(delete_all_packages),
        )
        .route("/configuration", get(get_configuration).put(update_configuration))
        .route("/reload", post(reload_schedule))
        .route("/{id}", get(get_package).delete(delete_package))
        .route("/{id}/download", get(download_package))
}

async fn find_package(state: &AppState, id: &str) -> Result<Package, AppError> {
    let pid = id.to_string();
    with_conn(&state.db, move |conn| package::find_by_id(conn, &pid))
        .await?
        .ok_or_else(|| AppError::NotFound("Package not found".into()))
}

async fn refresh_totals(state: &AppState) {
    if let Err(e) = retention::refresh_package_totals(state).await {
        tracing::warn!(error = %e, "Failed to refresh package metrics");
    }
}

async fn list_packages(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Package>>, AppError> {
    let packages = with_conn(&state.db, |conn| package::find_all(conn)).await?;
    Ok(Json(packages))
}

async fn get_package(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Package>, AppError> {
    Ok(Json(find_package(&state, &id).await?))
}

#[derive(Deserialize)]
pub struct TriggerQuery {
    pub compression: Option<PackageFormat>,
}

/// Build a package in the background using the stored format unless one is given.
async fn trigger_package(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TriggerQuery>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let format = match query.compression {
        Some(format) => format,
        None => with_conn(&state.db, |conn| settings::package_config(conn)).await?.compression,
    };

    let task_state = state.clone();
    state.workers.spawn(async move {
        // Outcome is logged and recorded in metrics by the packager
        let _ = packager::create_package(&task_state, format, TriggerOrigin::Manual).await;
    });
    tracing::info!(compression = %format, "Package creation queued");
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "queued", "compression": format }))))
}

async fn download_package(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let pkg = find_package(&state, &id).await?;
    let download = state.storage.download(&pkg.storage_path).await?;
    download_response(download).await
}

async fn delete_package(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let pkg = find_package(&state, &id).await?;
    state.storage.delete(&pkg.storage_path).await?;
    with_conn(&state.db, move |conn| package::delete(conn, &id)).await?;
    tracing::info!(package_id = %pkg.id, "Package deleted");
    refresh_totals(&state).await;
    Ok(StatusCode::NO_CONTENT)
}

/// Stops at the first storage failure. Packages removed before it stay removed.
async fn delete_all_packages(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let packages = with_conn(&state.db, |conn| package::find_all(conn)).await?;
    let mut deleted = 0usize;
    for pkg in packages {
        if let Err(e) = state.storage.delete(&pkg.storage_path).await {
            refresh_totals(&state).await;
            return Err(e.into());
        }
        let id = pkg.id.clone();
        with_conn(&state.db, move |conn| package::delete(conn, &id)).await?;
        deleted += 1;
    }
    tracing::info!(deleted, "All packages deleted");
    refresh_totals(&state).await;
    Ok(Json(json!({ "deleted": deleted })))
}

async fn get_configuration(State(state): State<Arc<AppState>>) -> Result<Json<PackageConfig>, AppError> {
    let config = with_conn(&state.db, |conn| settings::package_config(conn)).await?;
    Ok(Json(config))
}

async fn update_configuration(
    State(state): State<Arc<AppState>>,
    Json(mut body): Json<PackageConfig>,
) -> Result<Json<PackageConfig>, AppError> {
    body.schedule = body
        .schedule
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    if let Some(expr) = body.schedule.as_deref() {
        validate_cron(expr)
            .map_err(|reason| AppError::BadRequest(format!("Invalid schedule '{expr}': {reason}")))?;
    }

    let saved = body.clone();
    with_conn(&state.db, move |conn| settings::set_package_config(conn, &saved)).await?;
    state.scheduler.reload_package_schedule().await?;
    tracing::info!(schedule = ?body.schedule, compression = %body.compression, "Package configuration updated");
    Ok(Json(body))
}

async fn reload_schedule(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let cron = state.scheduler.reload_package_schedule().await?;
    Ok(Json(json!({ "schedule": cron })))
}

#[cfg(all(test, unix))]
mod tests {
    use crate::db::with_conn;
    use crate::models::job::TriggerOrigin;
    use crate::models::package;
    use crate::routes::create_router;
    use crate::routes::test_helpers::{empty, json, send};
    use crate::test_support::TestEnv;
    use axum::http::StatusCode;
    use serde_json::json;

    async fn stored_package(env: &TestEnv, path: &str) -> package::Package {
        env.put_artifact(path, b"bundle");
        let path = path.to_string();
        with_conn(&env.state.db, move |conn| {
            package::create(conn, &path, 6, "abc", TriggerOrigin::Manual)
        })
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_configuration_roundtrip_registers_timer() {
        let env = TestEnv::new(false).await;
        let app = create_router(env.state.clone());

        let (status, config) = send(&app, empty("GET", "/api/packages/configuration")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(config["compression"], "zip");

        let body = json!({"schedule": "0 4 * * *", "compression": "tar.gz", "max_count": 3});
        let (status, saved) = send(&app, json("PUT", "/api/packages/configuration", body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(saved["compression"], "tar.gz");
        assert_eq!(env.state.scheduler.package_cron().as_deref(), Some("0 0 4 * * *"));

        let body = json!({"schedule": "whenever"});
        let (status, _) = send(&app, json("PUT", "/api/packages/configuration", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(env.state.scheduler.package_cron().as_deref(), Some("0 0 4 * * *"));

        let (status, _) = send(&app, json("PUT", "/api/packages/configuration", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(env.state.scheduler.package_cron().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_download_and_delete_package() {
        let env = TestEnv::new(false).await;
        let pkg = stored_package(&env, "packages/packaged_resources_a.zip").await;
        let app = create_router(env.state.clone());

        let (status, body) = send(&app, empty("GET", &format!("/api/packages/{}/download", pkg.id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "bundle");

        let (status, _) = send(&app, empty("DELETE", &format!("/api/packages/{}", pkg.id))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!env.storage_root().join(&pkg.storage_path).exists());
        let (status, _) = send(&app, empty("GET", &format!("/api/packages/{}", pkg.id))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_all_halts_on_storage_failure() {
        let env = TestEnv::new(false).await;
        stored_package(&env, "packages/packaged_resources_a.zip").await;
        // A directory cannot be removed as a file
        std::fs::create_dir_all(env.storage_root().join("packages/stuck.zip/inner")).unwrap();
        with_conn(&env.state.db, |conn| {
            package::create(conn, "packages/stuck.zip", 1, "c", TriggerOrigin::Scheduled)
        })
        .await
        .unwrap();
        let app = create_router(env.state.clone());

        let (status, err) = send(&app, empty("DELETE", "/api/packages")).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(err["error"].is_string());
        let remaining = with_conn(&env.state.db, |conn| package::find_all(conn)).await.unwrap();
        assert!(remaining.iter().any(|p| p.storage_path == "packages/stuck.zip"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_trigger_builds_in_background() {
        let env = TestEnv::new(false).await;
        env.tool("pg_dump", "printf 'x'");
        let app = create_router(env.state.clone());
        let resource = json!({
            "name": "Orders", "engine": "postgres", "host": "db", "username": "u",
            "password": "p", "database_name": "orders", "include_in_package": true
        });
        let (status, _) = send(&app, json("POST", "/api/resources", resource)).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, queued) = send(&app, empty("POST", "/api/packages?compression=tar.gz")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(queued["compression"], "tar.gz");
        env.state.workers.drain().await;

        let (_, list) = send(&app, empty("GET", "/api/packages")).await;
        let list = list.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert!(list[0]["storage_path"].as_str().unwrap().ends_with(".tar.gz"));
    }
}
