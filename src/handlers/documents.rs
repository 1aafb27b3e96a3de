use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Extension, Json,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::content::parser::web::URI_CONTENT_TYPE;
use crate::database::{DocumentRow, DocumentStatus};
use crate::ingest::IngestRequest;
use crate::models::document::{
    DownloadUrlQuery, DownloadUrlResponse, ListDocumentsQuery, UpdateDocumentRequest,
};
use crate::models::pagination::Paginated;
use crate::state::AppState;
use crate::utils::error::ApiError;

/// POST /documents (multipart). Accepts either a `file` part or a `url`
/// field; always answers 202 with the pending document. Processing failures
/// are recorded on the document, never on this call.
pub async fn upload_document(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<DocumentRow>), ApiError> {
    let mut collection_id: Option<Uuid> = None;
    let mut filename: Option<String> = None;
    let mut declared_content_type: Option<String> = None;
    let mut data: Option<Vec<u8>> = None;
    let mut url: Option<String> = None;
    let mut title: Option<String> = None;
    let mut metadata: Value = json!({});

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("failed to read field: {}", e)))?
    {
        match field.name().unwrap_or("") {
            "collection_id" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::invalid_field("collection_id", e.to_string()))?;
                collection_id = Some(
                    text.parse()
                        .map_err(|_| ApiError::invalid_field("collection_id", "must be a UUID"))?,
                );
            }
            "file" => {
                filename = field.file_name().map(String::from);
                declared_content_type = field.content_type().map(String::from);
                data = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| ApiError::Validation(format!("failed to read file: {}", e)))?
                        .to_vec(),
                );
            }
            "url" => {
                url = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::invalid_field("url", e.to_string()))?
                        .trim()
                        .to_string(),
                );
            }
            "title" => {
                title = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::invalid_field("title", e.to_string()))?,
                );
            }
            "metadata" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::invalid_field("metadata", e.to_string()))?;
                metadata = serde_json::from_str(&text)
                    .map_err(|_| ApiError::invalid_field("metadata", "must be a JSON object"))?;
            }
            _ => {}
        }
    }

    let collection_id = collection_id
        .ok_or_else(|| ApiError::invalid_field("collection_id", "is required"))?;

    // URL payloads route through the web-transcript parser
    let request = match (data, url) {
        (Some(data), _) => IngestRequest {
            user_id: user.user_id,
            collection_id,
            filename: filename
                .ok_or_else(|| ApiError::invalid_field("file", "filename is required"))?,
            declared_content_type,
            data,
            title,
            metadata,
            source_url: None,
        },
        (None, Some(url)) if !url.is_empty() => IngestRequest {
            user_id: user.user_id,
            collection_id,
            filename: "source.uri".to_string(),
            declared_content_type: Some(URI_CONTENT_TYPE.to_string()),
            data: url.clone().into_bytes(),
            title,
            metadata,
            source_url: Some(url),
        },
        _ => {
            return Err(ApiError::invalid_field(
                "file",
                "either a file or a url is required",
            ))
        }
    };

    let document = state.coordinator.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(document)))
}

pub async fn list_documents(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Query(query): Query<ListDocumentsQuery>,
) -> Result<Json<Paginated<DocumentRow>>, ApiError> {
    if let Some(status) = &query.status {
        if DocumentStatus::parse(status).is_none() {
            return Err(ApiError::invalid_field("status", "unknown status"));
        }
    }
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let offset = query.offset.unwrap_or(0).max(0);

    let (documents, total) = state
        .repository
        .list_documents(
            user.user_id,
            query.collection_id,
            query.status.as_deref(),
            limit,
            offset,
        )
        .await?;
    Ok(Json(Paginated::new(documents, total, limit, offset)))
}

pub async fn get_document(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Path(document_id): Path<Uuid>,
) -> Result<Json<DocumentRow>, ApiError> {
    let document = state
        .repository
        .get_document(user.user_id, document_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("document not found".to_string()))?;
    Ok(Json(document))
}

pub async fn update_document(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Path(document_id): Path<Uuid>,
    Json(request): Json<UpdateDocumentRequest>,
) -> Result<Json<DocumentRow>, ApiError> {
    let document = state
        .repository
        .update_document_meta(
            user.user_id,
            document_id,
            request.title.as_deref(),
            request.metadata,
        )
        .await?
        .ok_or_else(|| ApiError::NotFound("document not found".to_string()))?;
    Ok(Json(document))
}

pub async fn delete_document(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Path(document_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let deleted = state
        .coordinator
        .delete_document(user.user_id, document_id)
        .await?;
    if !deleted {
        return Err(ApiError::NotFound("document not found".to_string()));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn document_status(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Path(document_id): Path<Uuid>,
) -> Result<Json<crate::models::document::DocumentStatusResponse>, ApiError> {
    let status = state
        .coordinator
        .get_status(user.user_id, document_id)
        .await?;
    Ok(Json(status))
}

/// GET /documents/{id}/url: a presigned, expiring download link.
pub async fn document_url(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Path(document_id): Path<Uuid>,
    Query(query): Query<DownloadUrlQuery>,
) -> Result<Json<DownloadUrlResponse>, ApiError> {
    let document = state
        .repository
        .get_document(user.user_id, document_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("document not found".to_string()))?;

    let expires_in = query
        .expires_in
        .unwrap_or(state.settings.storage.default_url_expiry_seconds)
        .clamp(1, 7 * 24 * 3600);
    let url = state.blob_store.presign(document_id, expires_in)?;

    Ok(Json(DownloadUrlResponse {
        url,
        expires_in,
        filename: document.filename.unwrap_or_default(),
        content_type: document.content_type,
    }))
}

#[derive(Debug, serde::Deserialize)]
pub struct DownloadQuery {
    pub expires: i64,
    pub signature: String,
}

/// GET /documents/{id}/download serves the blob when the presigned pair
/// checks out. No API key needed; the signature is the credential.
pub async fn download_document(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<Uuid>,
    Query(query): Query<DownloadQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if !state
        .blob_store
        .verify_presigned(document_id, query.expires, &query.signature)
    {
        return Err(ApiError::Forbidden("invalid or expired link".to_string()));
    }

    // Signature grants access, so look the document up without a user scope
    let document = sqlx::query_as::<_, DocumentRow>(
        r#"SELECT document_id, collection_id, user_id, title, filename, content_type,
                  size_bytes, content_hash, unique_identifier_hash, status, metadata,
                  processing_info, summary, created_at, updated_at, processed_at
           FROM documents WHERE document_id = $1"#,
    )
    .bind(document_id)
    .fetch_optional(state.db_pool.get_pool())
    .await?
    .ok_or_else(|| ApiError::NotFound("document not found".to_string()))?;

    let filename = document.filename.clone().unwrap_or_default();
    let stored_name = crate::index::blob::BlobStore::stored_name_for(
        &filename,
        &document.content_hash,
    );
    let bytes = state
        .blob_store
        .get(document.user_id, document_id, &stored_name)
        .await?;

    info!(%document_id, "presigned download served");
    Ok((
        [
            (header::CONTENT_TYPE, document.content_type),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        bytes,
    ))
}
