use crate::db::with_conn;
use crate::error::AppError;
use crate::models::job;
use crate::models::resource::{self, CreateResourceRequest, Provenance, Resource, UpdateResourceRequest};
use crate::services::backup_scheduler::validate_cron;
use crate::services::config_sync::{self, DeclaredEntry};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_resources).post(create_resource))
        .route(
            "/{id}",
            get(get_resource).patch(update_resource).delete(delete_resource),
        )
        .route("/{id}/reset", post(reset_resource))
}

fn check_schedule(schedule: Option<&str>) -> Result<(), AppError> {
    match schedule.map(str::trim).filter(|s| !s.is_empty()) {
        Some(expr) => validate_cron(expr)
            .map(|_| ())
            .map_err(|reason| AppError::BadRequest(format!("Invalid schedule '{expr}': {reason}"))),
        None => Ok(()),
    }
}

fn require(field: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::BadRequest(format!("{field} is required")));
    }
    Ok(())
}

async fn visible(state: &AppState, id: &str) -> Result<Resource, AppError> {
    let rid = id.to_string();
    with_conn(&state.db, move |conn| resource::find_by_id(conn, &rid))
        .await?
        .filter(|r| !r.is_deleted())
        .ok_or_else(|| AppError::NotFound("Resource not found".into()))
}

async fn reschedule(state: &AppState) {
    if let Err(e) = state.scheduler.refresh().await {
        tracing::error!(error = %e, "Failed to reconcile timers");
    }
}

async fn list_resources(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Resource>>, AppError> {
    let resources = with_conn(&state.db, |conn| resource::find_all(conn)).await?;
    Ok(Json(resources))
}

async fn get_resource(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Resource>, AppError> {
    Ok(Json(visible(&state, &id).await?))
}

async fn create_resource(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateResourceRequest>,
) -> Result<(StatusCode, Json<Resource>), AppError> {
    require("name", &body.name)?;
    require("host", &body.host)?;
    require("database_name", &body.database_name)?;
    check_schedule(body.schedule.as_deref())?;

    let created = with_conn(&state.db, move |conn| resource::create(conn, &body, None)).await?;
    tracing::info!(resource_id = %created.id, name = %created.name, "Resource created");
    reschedule(&state).await;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_resource(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UpdateResourceRequest>,
) -> Result<Json<Resource>, AppError> {
    if let Some(Some(schedule)) = &body.schedule {
        check_schedule(Some(schedule))?;
    }
    for (field, value) in [("name", &body.name), ("host", &body.host), ("database_name", &body.database_name)] {
        if let Some(v) = value {
            require(field, v)?;
        }
    }
    visible(&state, &id).await?;

    let rid = id.clone();
    let updated = with_conn(&state.db, move |conn| resource::update(conn, &rid, &body))
        .await?
        .ok_or_else(|| AppError::NotFound("Resource not found".into()))?;
    tracing::info!(resource_id = %id, "Resource updated");
    reschedule(&state).await;
    Ok(Json(updated))
}

#[derive(Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub purge: bool,
}

/// Declared resources are soft-deleted so the next reload leaves them alone;
/// API-managed ones are removed. `purge` also deletes every artifact first.
async fn delete_resource(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<StatusCode, AppError> {
    let existing = visible(&state, &id).await?;

    if query.purge {
        let rid = id.clone();
        let jobs = with_conn(&state.db, move |conn| job::find_by_resource(conn, &rid)).await?;
        for j in jobs {
            if let Some(path) = j.storage_path.as_deref().filter(|_| j.owns_artifact()) {
                state.storage.delete(path).await?;
            }
            let jid = j.id.clone();
            with_conn(&state.db, move |conn| job::delete(conn, &jid)).await?;
        }
    }

    let rid = id.clone();
    let declared = matches!(existing.provenance, Provenance::Declared { .. });
    with_conn(&state.db, move |conn| {
        if declared {
            resource::soft_delete(conn, &rid)
        } else {
            resource::delete(conn, &rid)
        }
    })
    .await?;
    if !declared {
        state.locks.forget(&id);
    }

    tracing::info!(resource_id = %id, soft = declared, purge = query.purge, "Resource deleted");
    reschedule(&state).await;
    Ok(StatusCode::NO_CONTENT)
}

/// Restore a declared resource to its definition in the current document.
async fn reset_resource(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Resource>, AppError> {
    let rid = id.clone();
    let existing = with_conn(&state.db, move |conn| resource::find_by_id(conn, &rid))
        .await?
        .ok_or_else(|| AppError::NotFound("Resource not found".into()))?;
    let Some(config_id) = existing.config_id().map(str::to_string) else {
        return Err(AppError::BadRequest(
            "Only resources declared in the config document can be reset".into(),
        ));
    };

    let definition = match config_sync::declared_entry(&state, &config_id).await? {
        Some(DeclaredEntry::Definition(spec)) => spec,
        Some(DeclaredEntry::MissingCredentials) => {
            return Err(AppError::BadRequest(format!(
                "Credentials for '{config_id}' cannot be resolved from the config document"
            )))
        }
        None => {
            let rid = id.clone();
            with_conn(&state.db, move |conn| resource::delete(conn, &rid)).await?;
            state.locks.forget(&id);
            reschedule(&state).await;
            tracing::info!(resource_id = %id, config_id = %config_id, "Resource no longer declared, removed");
            return Err(AppError::NotFound(format!(
                "'{config_id}' is no longer declared in the config document"
            )));
        }
    };

    let rid = id.clone();
    let reset = with_conn(&state.db, move |conn| resource::replace_definition(conn, &rid, &definition))
        .await?
        .ok_or_else(|| AppError::NotFound("Resource not found".into()))?;
    tracing::info!(resource_id = %id, config_id = %config_id, "Resource reset to declared definition");
    reschedule(&state).await;
    Ok(Json(reset))
}

#[cfg(test)]
mod tests {
    use crate::routes::create_router;
    use crate::routes::test_helpers::{empty, json, send};
    use crate::test_support::TestEnv;
    use axum::http::StatusCode;
    use serde_json::json;

    fn body(name: &str) -> serde_json::Value {
        json!({
            "name": name,
            "engine": "postgres",
            "host": "db",
            "username": "backup",
            "password": "secret",
            "database_name": "app",
            "schedule": "0 2 * * *"
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_list_and_schedule() {
        let env = TestEnv::new(false).await;
        let app = create_router(env.state.clone());

        let (status, created) = send(&app, json("POST", "/api/resources", body("Main"))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["port"], 5432);
        assert!(created.get("password").is_none());
        let id = created["id"].as_str().unwrap().to_string();
        assert!(env.state.scheduler.has_timer(&id));

        let (status, list) = send(&app, empty("GET", "/api/resources")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, _) = send(&app, json("PATCH", &format!("/api/resources/{id}"), json!({"schedule": null}))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!env.state.scheduler.has_timer(&id));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_schedule_rejected() {
        let env = TestEnv::new(false).await;
        let app = create_router(env.state.clone());
        let mut bad = body("Main");
        bad["schedule"] = json!("every night");
        let (status, err) = send(&app, json("POST", "/api/resources", bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(err["error"].as_str().unwrap().contains("Invalid schedule"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_declared_resource_soft_delete_and_reset() {
        let env = TestEnv::new(false).await;
        env.write_config(
            "resources:\n  - {id: orders, engine: postgres, host: db, database_name: orders, username: u, password: p, schedule: '0 1 * * *'}\n",
        );
        crate::services::config_sync::sync_from_file(&env.state).await.unwrap();
        env.state.scheduler.refresh().await.unwrap();
        let app = create_router(env.state.clone());

        let (_, list) = send(&app, empty("GET", "/api/resources")).await;
        let id = list[0]["id"].as_str().unwrap().to_string();

        let (status, _) = send(&app, empty("DELETE", &format!("/api/resources/{id}"))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, empty("GET", &format!("/api/resources/{id}"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(!env.state.scheduler.has_timer(&id));

        let (status, reset) = send(&app, empty("POST", &format!("/api/resources/{id}/reset"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reset["provenance"]["deleted"], false);
        assert!(env.state.scheduler.has_timer(&id));

        env.write_config("resources: []\n");
        let (status, _) = send(&app, empty("POST", &format!("/api/resources/{id}/reset"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (_, list) = send(&app, empty("GET", "/api/resources")).await;
        assert!(list.as_array().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reset_api_managed_is_bad_request() {
        let env = TestEnv::new(false).await;
        let app = create_router(env.state.clone());
        let (_, created) = send(&app, json("POST", "/api/resources", body("Adhoc"))).await;
        let id = created["id"].as_str().unwrap();

        let (status, _) = send(&app, empty("POST", &format!("/api/resources/{id}/reset"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, empty("DELETE", &format!("/api/resources/{id}"))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, empty("GET", &format!("/api/resources/{id}"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
