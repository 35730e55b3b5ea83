//! `/server/{id}/file/{path}` — download/listing, upload/mkdir, recursive delete.

use axum::{
    body::to_bytes,
    extract::{Multipart, Path, Query, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;

use super::super::AppState;
use super::ApiError;
use crate::auth::{scope, Claims};

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    #[serde(default)]
    pub folder: bool,
}

fn require_scope(claims: &Claims, scope: &str) -> Result<(), ApiError> {
    if claims.has_scope(scope) {
        Ok(())
    } else {
        Err(ApiError::forbidden(format!("missing scope {scope}")))
    }
}

/// `GET /{id}/file/{path}`: file download, or a directory listing as JSON.
pub async fn get_file(
    State(state): State<AppState>,
    Path((id, path)): Path<(String, String)>,
    axum::Extension(claims): axum::Extension<Claims>,
) -> Result<Response, ApiError> {
    require_scope(&claims, scope::FILES)?;
    let program = state
        .manager
        .get(&id)
        .ok_or_else(|| ApiError::not_found(format!("server '{id}' not found")))?;

    let info = program.filesystem().stat(&path).await?;
    if info.is_directory {
        let listing = program.filesystem().list_directory(&path).await?;
        Ok(Json(listing).into_response())
    } else {
        let data = program.filesystem().read_file(&path).await?;
        Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, info.mime_type.clone())],
            data,
        )
            .into_response())
    }
}

/// `PUT /{id}/file/{path}?folder`: create a directory, or write a file from
/// a raw request body or a single-field multipart upload.
pub async fn put_file(
    State(state): State<AppState>,
    Path((id, path)): Path<(String, String)>,
    Query(query): Query<FileQuery>,
    axum::Extension(claims): axum::Extension<Claims>,
    request: Request,
) -> Result<StatusCode, ApiError> {
    require_scope(&claims, scope::FILES_PUT)?;
    let program = state
        .manager
        .get(&id)
        .ok_or_else(|| ApiError::not_found(format!("server '{id}' not found")))?;

    if query.folder {
        program.filesystem().create_directory(&path).await?;
        return Ok(StatusCode::NO_CONTENT);
    }

    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("multipart/form-data"))
        .unwrap_or(false);

    let data = if is_multipart {
        let mut multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|e| ApiError::bad_request(e.to_string()))?;
        let field = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::bad_request(e.to_string()))?
            .ok_or_else(|| ApiError::bad_request("multipart body has no fields"))?;
        field.bytes().await.map_err(|e| ApiError::bad_request(e.to_string()))?
    } else {
        let body = request.into_body();
        to_bytes(body, usize::MAX)
            .await
            .map_err(|e| ApiError::bad_request(e.to_string()))?
    };

    program.filesystem().disk_usage().has_space_for(data.len() as u64)?;
    program.filesystem().write_file(&path, &data).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /{id}/file/{path}`: remove recursively.
pub async fn delete_file(
    State(state): State<AppState>,
    Path((id, path)): Path<(String, String)>,
    axum::Extension(claims): axum::Extension<Claims>,
) -> Result<StatusCode, ApiError> {
    require_scope(&claims, scope::FILES_DELETE)?;
    let program = state
        .manager
        .get(&id)
        .ok_or_else(|| ApiError::not_found(format!("server '{id}' not found")))?;
    program.filesystem().delete(&path).await?;
    Ok(StatusCode::NO_CONTENT)
}
