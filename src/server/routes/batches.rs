//! Batch endpoints
//!
//! Super batches travel the OpenAI file/batch surface: a multipart JSONL
//! upload creates one, `/v1/batches` sends it, polling refreshes it, and the
//! file-content route streams the aggregated outputs back as JSONL.

use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use tracing::info;

use crate::batch::validate;
use crate::core::error::{GatewayError, Result};
use crate::server::AppState;

/// `POST /v1/batches` body.
#[derive(Debug, Deserialize)]
pub struct CreateBatchRequest {
    pub input_file_id: String,
}

/// Accept a `purpose=batch` JSONL upload, validate and partition it, and
/// commit the super batch. Returns the OpenAI `File` shape whose id is the
/// super batch id.
pub async fn upload_file(
    state: web::Data<AppState>,
    mut multipart: Multipart,
) -> Result<HttpResponse> {
    let mut purpose = String::new();
    let mut filename = String::new();
    let mut file = Vec::new();

    while let Ok(Some(mut field)) = multipart.try_next().await {
        let name = field.content_disposition().get_name().unwrap_or_default().to_string();
        match name.as_str() {
            "purpose" => {
                let mut value = Vec::new();
                while let Some(chunk) = field.next().await {
                    value.extend_from_slice(&chunk.map_err(|e| {
                        GatewayError::InvalidRequest(format!("multipart: {e}"))
                    })?);
                }
                purpose = String::from_utf8_lossy(&value).into_owned();
            }
            "file" => {
                filename = field
                    .content_disposition()
                    .get_filename()
                    .unwrap_or("batch.jsonl")
                    .to_string();
                while let Some(chunk) = field.next().await {
                    file.extend_from_slice(&chunk.map_err(|e| {
                        GatewayError::InvalidRequest(format!("multipart: {e}"))
                    })?);
                }
            }
            _ => {}
        }
    }

    if purpose != "batch" {
        return Err(GatewayError::NotImplemented);
    }
    if file.is_empty() {
        return Err(GatewayError::InvalidRequest("missing file part".into()));
    }

    let size = file.len() as u64;
    let batch = validate::parse_and_validate(&state.registry, &file).await?;
    let record = state.orchestrator.upload(batch, &filename, size).await?;
    info!(batch = %record.id, bytes = size, "super batch uploaded");
    Ok(HttpResponse::Ok().json(record))
}

/// Send a previously uploaded super batch and return its descriptor.
pub async fn create_batch(
    state: web::Data<AppState>,
    req: web::Json<CreateBatchRequest>,
) -> Result<HttpResponse> {
    let record = state.orchestrator.send(&req.input_file_id).await?;
    Ok(HttpResponse::Ok().json(record))
}

/// Refresh and return a super batch descriptor.
pub async fn get_batch(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let record = state.orchestrator.refresh(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(record))
}

/// Cancel a super batch.
pub async fn cancel_batch(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let record = state.orchestrator.cancel(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(record))
}

/// Batch listing is not part of the surface.
pub async fn list_batches() -> Result<HttpResponse> {
    Err(GatewayError::NotImplemented)
}

/// Stream the aggregated JSONL outputs of a super batch.
pub async fn file_content(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let stream = state.orchestrator.receive(path.into_inner());
    Ok(HttpResponse::Ok()
        .content_type("application/jsonl")
        .streaming(stream))
}
