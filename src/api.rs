//! Acciones HTTP de ficheros: subida temporal, vista previa y borrado de
//! subidas temporales.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use axum::{
    extract::{ConnectInfo, DefaultBodyLimit, Json, Multipart, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use url::form_urlencoded;

use crate::{app_state::AppState, errors::ElasticError, models::TEMP_MARKER};

type ApiError = (StatusCode, Json<Value>);

// --- Payloads y Respuestas de la API ---

#[derive(Deserialize)]
pub struct UploadParams {
    key: String,
    #[serde(default = "unknown_form")]
    id: String,
}

#[derive(Deserialize)]
pub struct DeletePayload {
    name: String,
    key: String,
    #[serde(default = "unknown_form")]
    id: String,
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileStatus {
    file_name: String,
    status: bool,
    file_size: u64,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct PreviewInfo {
    status: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

fn unknown_form() -> String {
    "unk".to_string()
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    let body_limit = app_state.config.max_upload_bytes;
    Router::new()
        .route("/api/upload", post(upload_handler))
        .route("/api/preview", get(preview_handler))
        .route("/api/delete-file", post(delete_file_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(app_state)
}

// --- Handlers ---

#[axum::debug_handler]
async fn upload_handler(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    mut multipart: Multipart,
) -> Result<Json<Vec<FileStatus>>, ApiError> {
    let mut stored = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("Formulario multipart no válido: {}", e)})),
        )
    })? {
        let Some(name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field.bytes().await.map_err(|e| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("No se pudo leer '{}': {}", name, e)})),
            )
        })?;

        let staged = state
            .uploads
            .store(&params.key, &params.id, &name, &bytes)
            .map_err(storage_error)?;
        info!("Subida temporal '{}' ({} bytes)", staged.name, staged.size);
        stored.push(FileStatus {
            file_name: staged.name,
            status: true,
            file_size: staged.size,
        });
    }

    if stored.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "La petición no contiene ningún fichero."})),
        ));
    }
    Ok(Json(stored))
}

#[axum::debug_handler]
async fn preview_handler(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let Some(file_name) = query.get("fileName").cloned() else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Falta el parámetro fileName."})),
        ));
    };
    let key = query.get("key").cloned().unwrap_or_default();
    let id = query.get("id").cloned().unwrap_or_else(unknown_form);
    let temporary = file_name.starts_with(TEMP_MARKER);

    let path = if temporary {
        state.uploads.resolve(&key, &id, &file_name).map_err(storage_error)?
    } else {
        let alias = expand_placeholders(query.get("targetPathAlias").map(String::as_str).unwrap_or(""), &query);
        let base = safe_join(&state.config.web_root, &alias)?;
        safe_join(&base, &file_name)?
    };

    match query.get("mode").map(String::as_str) {
        Some("raw") => raw_preview(&path).await,
        _ => {
            let width = query.get("width").cloned().unwrap_or_else(|| state.config.preview_width.to_string());
            let height = query.get("height").cloned().unwrap_or_else(|| state.config.preview_height.to_string());
            let info = preview_info(&state, &path, &file_name, temporary, &key, &id, (width.as_str(), height.as_str()));
            Ok(Json(info).into_response())
        }
    }
}

#[axum::debug_handler]
async fn delete_file_handler(
    State(state): State<AppState>,
    Json(payload): Json<DeletePayload>,
) -> Result<Json<FileStatus>, ApiError> {
    if !payload.name.starts_with(TEMP_MARKER) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Sólo se pueden borrar subidas temporales."})),
        ));
    }
    let file_size = state
        .uploads
        .find(&payload.key, &payload.id, &payload.name)
        .map_err(storage_error)?
        .map(|f| f.size)
        .unwrap_or(0);
    let status = state
        .uploads
        .remove(&payload.key, &payload.id, &payload.name)
        .map_err(storage_error)?;
    if !status {
        warn!("Borrado de '{}': el fichero temporal no existe", payload.name);
    }
    Ok(Json(FileStatus {
        file_name: payload.name,
        status,
        file_size,
    }))
}

// --- Handler de Apagado y Utilidades ---

#[axum::debug_handler]
/// Sólo se atiende desde la propia máquina.
async fn shutdown_handler(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Result<StatusCode, ApiError> {
    match peer {
        Some(ConnectInfo(addr)) if addr.ip().is_loopback() => {}
        other => {
            warn!("Apagado rechazado para {:?}", other.map(|ConnectInfo(addr)| addr));
            return Err((
                StatusCode::FORBIDDEN,
                Json(json!({"error": "El apagado sólo se acepta desde la propia máquina."})),
            ));
        }
    }
    info!("Petición de apagado recibida.");
    let sender = state
        .shutdown_sender
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .take();
    if let Some(sender) = sender {
        let _ = sender.send(());
    }
    Ok(StatusCode::OK)
}

async fn raw_preview(path: &Path) -> Result<Response, ApiError> {
    let bytes = tokio::fs::read(path).await.map_err(|_| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "El fichero no existe."})),
        )
    })?;
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    Ok((
        [
            (header::CONTENT_TYPE, mime.to_string()),
            (header::CONTENT_DISPOSITION, format!("inline; filename=\"{}\"", name)),
        ],
        bytes,
    )
        .into_response())
}

fn preview_info(
    state: &AppState,
    path: &Path,
    file_name: &str,
    temporary: bool,
    key: &str,
    id: &str,
    (width, height): (&str, &str),
) -> PreviewInfo {
    if !path.is_file() {
        return PreviewInfo {
            status: false,
            image: None,
            url: None,
            path: None,
            name: None,
        };
    }

    let image = matches!(
        mime_guess::from_path(path).first().map(|m| m.essence_str().to_string()).as_deref(),
        Some("image/gif" | "image/jpeg" | "image/png")
    );

    let mut url = form_urlencoded::Serializer::new(String::new());
    url.append_pair("mode", "raw").append_pair("fileName", file_name);
    let relative = if temporary {
        url.append_pair("key", key).append_pair("id", id);
        None
    } else {
        path.strip_prefix(&state.config.web_root)
            .ok()
            .map(|p| format!("/{}", p.to_string_lossy().replace('\\', "/")))
    };
    url.append_pair("width", width).append_pair("height", height);

    PreviewInfo {
        status: true,
        image: Some(image),
        url: Some(format!("/api/preview?{}", url.finish())),
        path: relative,
        name: Some(file_name.strip_prefix(TEMP_MARKER).unwrap_or(file_name).to_string()),
    }
}

/// Sustituye cada `{marcador}` por el parámetro de consulta del mismo nombre.
fn expand_placeholders(template: &str, query: &HashMap<String, String>) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\{([^}]+)\}").expect("regex válida"));
    re.replace_all(template, |caps: &Captures| query.get(&caps[1]).cloned().unwrap_or_default())
        .into_owned()
}

/// Une una ruta relativa sin permitir salir de `base`.
fn safe_join(base: &Path, relative: &str) -> Result<PathBuf, ApiError> {
    let relative = Path::new(relative.trim_start_matches('/'));
    if relative.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Ruta no permitida."})),
        ));
    }
    Ok(base.join(relative))
}

fn storage_error(err: ElasticError) -> ApiError {
    match err {
        ElasticError::InvalidName(name) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("Nombre no válido: {}", name)})),
        ),
        other => {
            error!("Error en la zona temporal: {}", other);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": other.to_string()})),
            )
        }
    }
}
