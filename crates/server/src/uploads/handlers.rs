use super::StoredUpload;
use crate::config::AppState;
use crate::ctx::Ctx;
use crate::error::{Error, Result};
use axum::{
    extract::{Multipart, Path, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use tracing::{error, info};

/// POST /uploads
pub async fn upload(
    State(state): State<AppState>,
    ctx: Ctx,
    mut multipart: Multipart,
) -> Result<Json<StoredUpload>> {
    info!("POST /uploads - {}", ctx.user_id());

    let mut data: Option<Bytes> = None;
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        error!("Failed to read multipart field: {}", e);
        Error::BadRequest("Malformed upload".to_string())
    })? {
        if field.name() == Some("file") {
            data = Some(field.bytes().await.map_err(|e| {
                error!("Failed to read file data: {}", e);
                Error::BadRequest(format!(
                    "Upload failed or exceeded {} bytes",
                    state.uploads.max_bytes()
                ))
            })?);
        }
    }

    let data = data.ok_or_else(|| Error::BadRequest("Missing 'file' field".to_string()))?;
    let stored = state.uploads.put(&data).await?;
    Ok(Json(stored))
}

/// GET /uploads/{name}
pub async fn get_upload(
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> Result<Response> {
    let (data, format) = state.uploads.get(&name).await?;
    Ok((
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static(format.content_type()),
            ),
            (
                header::CACHE_CONTROL,
                HeaderValue::from_static("public, max-age=31536000, immutable"),
            ),
        ],
        data,
    )
        .into_response())
}
