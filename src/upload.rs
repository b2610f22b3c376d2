//! 分片上传处理器：接收分片、合并、放弃与进度查询。

use axum::extract::multipart::Field;
use axum::extract::{Extension, Json, Multipart, Query};
use axum::response::Json as JsonResponse;
use axum_extra::extract::WithRejection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::chunks::{ChunkStore, StagedFile};
use crate::error::ApiError;
use crate::session::{ChunkReceipt, ChunkRequest, SessionRegistry};
use crate::storage::Storage;

/// 上传限制；0 表示不限制。
#[derive(Debug)]
pub struct UploadConfig {
    pub max_file_size: u64,
    pub chunk_max_size: u64,
    pub max_chunks: u64,
    pub temp_ttl: Duration,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadIdBody {
    upload_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadIdQuery {
    upload_id: String,
}

#[derive(Serialize)]
pub(crate) struct MergeResponse {
    success: bool,
    path: String,
}

#[derive(Serialize)]
pub(crate) struct AbortResponse {
    success: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadStatusResponse {
    upload_id: String,
    file_name: String,
    relative_path: String,
    received: Vec<u64>,
    total: u64,
}

/// 单个 `/api/upload-chunk` 请求的表单字段。
#[derive(Default)]
struct ChunkForm {
    chunk: Option<StagedFile>,
    chunk_index: Option<String>,
    total_chunks: Option<String>,
    file_name: Option<String>,
    relative_path: Option<String>,
    upload_id: Option<String>,
}

impl ChunkForm {
    async fn read(
        &mut self,
        multipart: &mut Multipart,
        store: &ChunkStore,
        chunk_limit: u64,
    ) -> Result<(), ApiError> {
        while let Some(mut field) = multipart.next_field().await? {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            match name.as_str() {
                "chunk" => {
                    let staged = stage_field(store, &mut field, chunk_limit).await?;
                    if let Some(previous) = self.chunk.replace(staged) {
                        previous.discard().await;
                    }
                }
                "chunkIndex" => self.chunk_index = Some(field.text().await?),
                "totalChunks" => self.total_chunks = Some(field.text().await?),
                "fileName" => self.file_name = Some(field.text().await?),
                "relativePath" => self.relative_path = Some(field.text().await?),
                "uploadId" => self.upload_id = Some(field.text().await?),
                _ => {}
            }
        }
        Ok(())
    }

    fn request(&self, max_chunks: u64) -> Result<ChunkRequest, ApiError> {
        let chunk_index = parse_integer(self.chunk_index.as_deref(), "chunkIndex")?;
        let total_chunks = parse_integer(self.total_chunks.as_deref(), "totalChunks")?;
        if max_chunks > 0 && total_chunks > 0 && total_chunks as u64 > max_chunks {
            return Err(ApiError::BadRequest(format!(
                "totalChunks exceeds the limit of {max_chunks}"
            )));
        }
        let file_name = self
            .file_name
            .clone()
            .ok_or_else(|| ApiError::BadRequest("fileName is required".into()))?;
        Ok(ChunkRequest {
            upload_id: self
                .upload_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string),
            chunk_index,
            total_chunks,
            file_name,
            relative_path: self.relative_path.clone().unwrap_or_default(),
        })
    }

    async fn discard(self) {
        if let Some(chunk) = self.chunk {
            chunk.discard().await;
        }
    }
}

fn parse_integer(value: Option<&str>, field: &str) -> Result<i64, ApiError> {
    value
        .map(str::trim)
        .and_then(|value| value.parse::<i64>().ok())
        .ok_or_else(|| ApiError::BadRequest(format!("{field} must be an integer")))
}

/// 将 multipart 字段流式写入暂存区，超出 `limit` 时返回 413。
pub(crate) async fn stage_field(
    store: &ChunkStore,
    field: &mut Field<'_>,
    limit: u64,
) -> Result<StagedFile, ApiError> {
    let mut staging = store.begin_stage(limit).await?;
    loop {
        let bytes = match field.chunk().await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break,
            Err(err) => {
                staging.abort().await;
                return Err(err.into());
            }
        };
        if let Err(err) = staging.write(&bytes).await {
            staging.abort().await;
            return Err(err.into());
        }
    }
    Ok(staging.finish().await?)
}

/// 上传单个分片。
pub async fn upload_chunk(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(registry): Extension<Arc<SessionRegistry>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    WithRejection(mut multipart, _): WithRejection<Multipart, ApiError>,
) -> Result<JsonResponse<ChunkReceipt>, ApiError> {
    let mut form = ChunkForm::default();
    if let Err(err) = form
        .read(&mut multipart, registry.store(), upload.chunk_max_size)
        .await
    {
        form.discard().await;
        return Err(err);
    }
    let request = match form.request(upload.max_chunks) {
        Ok(request) => request,
        Err(err) => {
            form.discard().await;
            return Err(err);
        }
    };
    let Some(staged) = form.chunk else {
        return Err(ApiError::BadRequest("No chunk uploaded".into()));
    };
    let receipt = registry.ingest(&storage, request, staged).await?;
    Ok(JsonResponse(receipt))
}

/// 合并全部分片为最终文件。
pub async fn merge_chunks(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(registry): Extension<Arc<SessionRegistry>>,
    WithRejection(Json(payload), _): WithRejection<Json<UploadIdBody>, ApiError>,
) -> Result<JsonResponse<MergeResponse>, ApiError> {
    let path = registry.merge(&storage, &payload.upload_id).await?;
    Ok(JsonResponse(MergeResponse {
        success: true,
        path,
    }))
}

/// 放弃上传会话。
pub async fn abort_upload(
    Extension(registry): Extension<Arc<SessionRegistry>>,
    WithRejection(Json(payload), _): WithRejection<Json<UploadIdBody>, ApiError>,
) -> Result<JsonResponse<AbortResponse>, ApiError> {
    registry.abort(&payload.upload_id).await?;
    Ok(JsonResponse(AbortResponse { success: true }))
}

/// 返回会话已持有的分片序号，用于断点续传。
pub async fn upload_status(
    WithRejection(Query(query), _): WithRejection<Query<UploadIdQuery>, ApiError>,
    Extension(registry): Extension<Arc<SessionRegistry>>,
) -> Result<JsonResponse<UploadStatusResponse>, ApiError> {
    let meta = registry.status(&query.upload_id).await?;
    info!(
        upload_id = meta.upload_id,
        received = meta.received(),
        total = meta.total_chunks,
        "upload status"
    );
    Ok(JsonResponse(UploadStatusResponse {
        received: meta.chunks.keys().copied().collect(),
        total: meta.total_chunks,
        upload_id: meta.upload_id,
        file_name: meta.file_name,
        relative_path: meta.relative_path,
    }))
}
