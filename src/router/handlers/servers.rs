//! `/server/{id}` and its power/data/console/stat sub-resources.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::Value;

use super::super::AppState;
use super::ApiError;
use crate::auth::{scope, Claims};
use crate::server::{PowerAction, Program, ProgramDefinition};

fn require_scope(claims: &Claims, scope: &str) -> Result<(), ApiError> {
    if claims.has_scope(scope) {
        Ok(())
    } else {
        Err(ApiError::forbidden(format!("missing scope {scope}")))
    }
}

fn lookup(state: &AppState, id: &str) -> Result<Arc<Program>, ApiError> {
    state
        .manager
        .get(id)
        .ok_or_else(|| ApiError::not_found(format!("server '{id}' not found")))
}

/// `PUT /{id}`: create program from JSON body.
pub async fn create_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::Extension(claims): axum::Extension<Claims>,
    Json(mut definition): Json<ProgramDefinition>,
) -> Result<Json<Value>, ApiError> {
    require_scope(&claims, scope::EDIT_ADMIN)?;
    definition.identifier = id.clone();
    let program = state.manager.create(definition)?;
    program.save()?;
    if program.definition().execution.auto_start {
        state.manager.enqueue_start(Arc::clone(&program));
    }
    Ok(Json(serde_json::json!({ "id": id })))
}

/// `GET /{id}`: full definition (admin).
pub async fn get_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::Extension(claims): axum::Extension<Claims>,
) -> Result<Json<ProgramDefinition>, ApiError> {
    require_scope(&claims, scope::EDIT_ADMIN)?;
    let program = lookup(&state, &id)?;
    Ok(Json(program.definition()))
}

/// `POST /{id}`: replace definition (admin).
pub async fn replace_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::Extension(claims): axum::Extension<Claims>,
    Json(mut definition): Json<ProgramDefinition>,
) -> Result<StatusCode, ApiError> {
    require_scope(&claims, scope::EDIT_ADMIN)?;
    let program = lookup(&state, &id)?;
    definition.identifier = id;
    program.replace_definition(definition);
    program.save()?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /{id}`: remove program.
pub async fn delete_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::Extension(claims): axum::Extension<Claims>,
) -> Result<StatusCode, ApiError> {
    require_scope(&claims, scope::EDIT_ADMIN)?;
    state.manager.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /{id}/data`: variables only.
pub async fn get_data(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::Extension(_claims): axum::Extension<Claims>,
) -> Result<Json<Value>, ApiError> {
    let program = lookup(&state, &id)?;
    Ok(Json(serde_json::to_value(program.definition().variables).unwrap_or(Value::Null)))
}

/// `POST /{id}/data`: update variables; non-admin edits respect `userEditable`.
pub async fn post_data(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::Extension(claims): axum::Extension<Claims>,
    Json(updates): Json<HashMap<String, Value>>,
) -> Result<StatusCode, ApiError> {
    let program = lookup(&state, &id)?;
    let admin_override = claims.has_scope(scope::EDIT_ADMIN);
    program.edit(updates, admin_override)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct WaitQuery {
    #[serde(default)]
    pub wait: Option<String>,
}

/// `POST /{id}/start?wait`: start; `wait` blocks until the child is running.
pub async fn start_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
    axum::Extension(claims): axum::Extension<Claims>,
) -> Result<StatusCode, ApiError> {
    require_scope(&claims, scope::START)?;
    let program = lookup(&state, &id)?;
    program.handle_power_action(PowerAction::Start).await?;

    if query.wait.is_some() {
        wait_until_running(&program, Duration::from_secs(30)).await?;
        return Ok(StatusCode::NO_CONTENT);
    }
    Ok(StatusCode::ACCEPTED)
}

/// `POST /{id}/stop?wait`: stop; `wait` blocks until the child has exited.
pub async fn stop_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
    axum::Extension(claims): axum::Extension<Claims>,
) -> Result<StatusCode, ApiError> {
    require_scope(&claims, scope::STOP)?;
    let program = lookup(&state, &id)?;
    program.handle_power_action(PowerAction::Stop).await?;

    if query.wait.is_some() {
        program
            .wait_for_main_process(Some(Duration::from_secs(600)))
            .await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /{id}/kill`: SIGKILL.
pub async fn kill_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::Extension(claims): axum::Extension<Claims>,
) -> Result<StatusCode, ApiError> {
    require_scope(&claims, scope::STOP)?;
    let program = lookup(&state, &id)?;
    program.handle_power_action(PowerAction::Kill).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /{id}/install`: runs the install pipeline asynchronously.
pub async fn install_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::Extension(claims): axum::Extension<Claims>,
) -> Result<StatusCode, ApiError> {
    require_scope(&claims, scope::INSTALL)?;
    let program = lookup(&state, &id)?;
    tokio::spawn(async move {
        if let Err(e) = program.install().await {
            tracing::warn!("install pipeline failed for {}: {}", program.id(), e);
        }
    });
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
pub struct ConsoleCommand {
    pub command: String,
}

/// `POST /{id}/console`: write one command to the child's stdin.
pub async fn post_console(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::Extension(claims): axum::Extension<Claims>,
    Json(body): Json<ConsoleCommand>,
) -> Result<StatusCode, ApiError> {
    require_scope(&claims, scope::CONSOLE_SEND)?;
    let program = lookup(&state, &id)?;
    program.execute(&body.command).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub time: u64,
}

/// `GET /{id}/logs?time=<epoch>`: lines since epoch.
pub async fn get_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
    axum::Extension(claims): axum::Extension<Claims>,
) -> Result<Json<Value>, ApiError> {
    require_scope(&claims, scope::STAT)?;
    let program = lookup(&state, &id)?;
    let snapshot = program.environment().get_console_from(query.time);
    Ok(Json(serde_json::json!({ "epoch": snapshot.epoch, "logs": snapshot.lines })))
}

/// `GET /{id}/stats`: point-in-time resource sample.
pub async fn get_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::Extension(claims): axum::Extension<Claims>,
) -> Result<Json<Value>, ApiError> {
    require_scope(&claims, scope::STAT)?;
    let program = lookup(&state, &id)?;
    let sample = program.environment().get_stats().await?;
    Ok(Json(serde_json::json!({
        "cpu_absolute": sample.cpu_percent,
        "memory_bytes": sample.memory_rss_bytes,
    })))
}

/// `GET /{id}/status`: running flag.
pub async fn get_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::Extension(claims): axum::Extension<Claims>,
) -> Result<Json<Value>, ApiError> {
    require_scope(&claims, scope::STAT)?;
    let program = lookup(&state, &id)?;
    let running = program.environment().is_running().await?;
    Ok(Json(serde_json::json!({ "running": running })))
}

async fn wait_until_running(program: &Arc<Program>, timeout: Duration) -> Result<(), ApiError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if program.environment().is_running().await.unwrap_or(false) {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ApiError::internal("timed out waiting for program to start"));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
