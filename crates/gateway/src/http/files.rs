//! File endpoints: download, delete, multipart upload.
//!
//! The host registers these with a filesystem root (the virtual SD card
//! directory, or a single log file). Every mutation broadcasts
//! `notify_filelist_changed` with the refreshed list.

use crate::domain::error::ApiError;
use crate::domain::registry::EndpointEntry;
use crate::events;
use crate::http::{error_body, result_body};
use crate::router::{self, InvokeContext};
use crate::service::GatewayState;
use axum::body::Body;
use axum::extract::{FromRequest, Multipart, Request};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// `GET` on a file endpoint: stream the file as an attachment.
pub async fn serve(entry: &EndpointEntry, subpath: Option<&str>) -> Response {
    let (path, basename) = match target_path(entry, subpath) {
        Ok(target) => target,
        Err(e) => return error_body(&e),
    };
    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(_) => return error_body(&ApiError::NotFound(basename)),
    };
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type(&basename))
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename={basename}"),
        )
        .body(Body::from(data))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// `DELETE` on a file endpoint.
pub async fn delete(
    state: &Arc<GatewayState>,
    entry: &EndpointEntry,
    subpath: Option<&str>,
) -> Response {
    let (path, basename) = match target_path(entry, subpath) {
        Ok(target) => target,
        Err(e) => return error_body(&e),
    };
    if tokio::fs::remove_file(&path).await.is_err() {
        return error_body(&ApiError::NotFound(basename));
    }
    info!(file = %basename, "file removed");
    let state = Arc::clone(state);
    let filename = basename.clone();
    tokio::spawn(async move {
        events::broadcast_filelist_changed(&state, filename, "removed").await;
    });
    result_body(json!(basename))
}

/// `POST` multipart upload. Field `file` carries the payload; an optional
/// `print` field equal to `"true"` starts the print once the file is
/// stored.
pub async fn upload(
    state: &Arc<GatewayState>,
    entry: &EndpointEntry,
    req: Request,
) -> Response {
    let Some(root) = entry.root.clone() else {
        return error_body(&ApiError::Internal("upload endpoint has no root".to_string()));
    };

    let mut multipart = match Multipart::from_request(req, &()).await {
        Ok(multipart) => multipart,
        Err(e) => return error_body(&ApiError::BadRequest(e.to_string())),
    };

    let mut filename: Option<String> = None;
    let mut data: Option<axum::body::Bytes> = None;
    let mut start_print = false;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return error_body(&ApiError::BadRequest(e.to_string())),
        };
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "file" => {
                let name = field.file_name().unwrap_or_default().to_string();
                match field.bytes().await {
                    Ok(bytes) => {
                        filename = Some(sanitize_filename(&name));
                        data = Some(bytes);
                    }
                    Err(e) => return error_body(&ApiError::BadRequest(e.to_string())),
                }
            }
            "print" => {
                if let Ok(value) = field.text().await {
                    start_print = value.eq_ignore_ascii_case("true");
                }
            }
            _ => {}
        }
    }

    let (Some(filename), Some(data)) = (filename, data) else {
        return error_body(&ApiError::BadRequest(
            "upload requires a 'file' field".to_string(),
        ));
    };
    if filename.is_empty() {
        return error_body(&ApiError::BadRequest("upload has no filename".to_string()));
    }

    if let Err(e) = tokio::fs::write(root.join(&filename), &data).await {
        warn!(error = %e, file = %filename, "unable to save upload");
        return error_body(&ApiError::Internal("unable to save file".to_string()));
    }
    info!(file = %filename, bytes = data.len(), "file uploaded");

    {
        let state = Arc::clone(state);
        let filename = filename.clone();
        tokio::spawn(async move {
            events::broadcast_filelist_changed(&state, filename, "added").await;
        });
    }

    if start_print {
        let result = router::invoke(
            state,
            "POST",
            "/printer/print/start",
            json!({ "filename": filename }),
            InvokeContext::Http,
        )
        .await;
        if let Err(e) = result {
            return error_body(&e);
        }
    }

    result_body(json!({ "filename": filename }))
}

/// Resolve the target path. Entries registered against a single file (log
/// downloads) take no subpath; directory roots require one.
fn target_path(
    entry: &EndpointEntry,
    subpath: Option<&str>,
) -> Result<(PathBuf, String), ApiError> {
    let root = entry
        .root
        .as_ref()
        .ok_or_else(|| ApiError::Internal("file endpoint has no root".to_string()))?;
    match subpath {
        None => {
            let basename = root
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "file".to_string());
            Ok((root.clone(), basename))
        }
        Some(sub) => {
            let sub = sub.trim_start_matches('/');
            if sub.is_empty() || !is_safe_subpath(sub) {
                return Err(ApiError::BadRequest("invalid file path".to_string()));
            }
            let basename = Path::new(sub)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| sub.to_string());
            Ok((root.join(sub), basename))
        }
    }
}

fn is_safe_subpath(sub: &str) -> bool {
    !sub.contains('\\') && Path::new(sub).components().all(|c| {
        matches!(c, std::path::Component::Normal(_))
    })
}

/// Collapse whitespace to underscores and strip any directory part.
fn sanitize_filename(name: &str) -> String {
    let flattened = name.trim().split_whitespace().collect::<Vec<_>>().join("_");
    Path::new(&flattened)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn content_type(filename: &str) -> &'static str {
    match Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
    {
        "log" | "gcode" | "txt" | "cfg" => "text/plain",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}
