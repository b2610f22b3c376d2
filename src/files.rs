//! 文件列表、上传、下载与目录操作处理器。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Json, Multipart, Path, Query};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use axum_extra::extract::WithRejection;
use chrono::Utc;
use httpdate::fmt_http_date;
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::archive::{ArchiveSource, plan_sources, stream_archive};
use crate::chunks::StagedFile;
use crate::error::ApiError;
use crate::etag::{etag_from_metadata, if_range_matches};
use crate::names::decode_upload_name;
use crate::session::SessionRegistry;
use crate::storage::{FileEntry, Storage};
use crate::upload::{UploadConfig, stage_field};

#[derive(Deserialize)]
pub(crate) struct ListQuery {
    #[serde(default)]
    path: String,
}

#[derive(Serialize)]
pub(crate) struct ListResponse {
    files: Vec<FileEntry>,
}

#[derive(Serialize)]
pub(crate) struct UploadedFile {
    name: String,
    path: String,
}

#[derive(Serialize)]
pub(crate) struct UploadResponse {
    success: bool,
    files: Vec<UploadedFile>,
}

#[derive(Deserialize)]
pub(crate) struct DownloadMultipleBody {
    #[serde(default)]
    files: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateFolderBody {
    #[serde(default)]
    folder_name: String,
    #[serde(default)]
    relative_path: String,
}

#[derive(Serialize)]
pub(crate) struct CreateFolderResponse {
    success: bool,
    path: String,
}

#[derive(Deserialize)]
pub(crate) struct DeleteBody {
    #[serde(default)]
    paths: Vec<String>,
}

#[derive(Serialize)]
pub(crate) struct DeleteResponse {
    success: bool,
    deleted: Vec<String>,
}

/// 列出目录内容。
pub async fn list_files(
    WithRejection(Query(query), _): WithRejection<Query<ListQuery>, ApiError>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<JsonResponse<ListResponse>, ApiError> {
    let files = storage.list_dir(&query.path).await?;
    debug!(path = query.path, count = files.len(), "list files");
    Ok(JsonResponse(ListResponse { files }))
}

/// 整文件上传：暂存全部 `files` 字段，然后逐个移动到目标目录。
pub async fn upload_files(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(registry): Extension<Arc<SessionRegistry>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    WithRejection(mut multipart, _): WithRejection<Multipart, ApiError>,
) -> Result<JsonResponse<UploadResponse>, ApiError> {
    let mut staged: Vec<(String, StagedFile)> = Vec::new();
    let mut relative_path = String::new();
    let received: Result<(), ApiError> = async {
        while let Some(mut field) = multipart.next_field().await? {
            let Some(field_name) = field.name().map(str::to_string) else {
                continue;
            };
            match field_name.as_str() {
                "files" => {
                    let name = decode_upload_name(field.file_name().unwrap_or_default());
                    let file =
                        stage_field(registry.store(), &mut field, upload.max_file_size).await?;
                    staged.push((name, file));
                }
                "relativePath" => relative_path = field.text().await?,
                _ => {}
            }
        }
        Ok(())
    }
    .await;
    if let Err(err) = received {
        discard_all(staged).await;
        return Err(err);
    }
    if staged.is_empty() {
        return Err(ApiError::BadRequest("No files uploaded".into()));
    }

    let mut files = Vec::with_capacity(staged.len());
    let mut pending = staged.into_iter();
    while let Some((name, file)) = pending.next() {
        match storage.place_file(&relative_path, &name, file.path()).await {
            Ok(path) => {
                info!(path, size = file.size(), "file uploaded");
                files.push(UploadedFile { name, path });
            }
            Err(err) => {
                file.discard().await;
                discard_all(pending.collect()).await;
                return Err(err.into());
            }
        }
    }
    Ok(JsonResponse(UploadResponse {
        success: true,
        files,
    }))
}

async fn discard_all(staged: Vec<(String, StagedFile)>) {
    for (_, file) in staged {
        file.discard().await;
    }
}

/// 下载文件（支持 Range）或把目录打包为 zip 流。
pub async fn download_entry(
    WithRejection(Path(path), _): WithRejection<Path<String>, ApiError>,
    request_headers: HeaderMap,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    let target = storage.resolve(&path).await?;
    let metadata = match fs::metadata(&target).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::NotFound("File not found".into()));
        }
        Err(err) => return Err(err.into()),
    };

    if metadata.is_dir() {
        let sources = plan_sources(&storage, std::slice::from_ref(&path)).await?;
        let name = sources
            .first()
            .map(|source| source.name().to_string())
            .unwrap_or_else(|| "files".to_string());
        info!(path, "download folder as zip");
        return zip_response(&format!("{name}.zip"), sources);
    }

    let file_size = metadata.len();
    let modified = metadata.modified().ok();
    let etag = etag_from_metadata(&metadata);
    let file_name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mime = mime_guess::from_path(&target).first_or_octet_stream();

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::CONTENT_TYPE, header_value(mime.essence_str())?);
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    response_headers.insert(header::ETAG, header_value(&etag)?);
    if let Some(modified) = modified {
        response_headers.insert(header::LAST_MODIFIED, header_value(&fmt_http_date(modified))?);
    }
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        header_value(&content_disposition(&file_name))?,
    );

    let range = if if_range_matches(&request_headers, &etag, modified) {
        parse_range(request_headers.get(header::RANGE), file_size)?
    } else {
        None
    };

    let mut file = File::open(&target).await?;
    let (status, length) = match range {
        Some(range) => {
            debug!(path, start = range.start, end = range.end, "serving byte range");
            file.seek(SeekFrom::Start(range.start)).await?;
            response_headers.insert(
                header::CONTENT_RANGE,
                header_value(&range.content_range(file_size))?,
            );
            (StatusCode::PARTIAL_CONTENT, range.len())
        }
        None => {
            info!(path, size = file_size, "serving whole file");
            (StatusCode::OK, file_size)
        }
    };
    response_headers.insert(header::CONTENT_LENGTH, header_value(&length.to_string())?);
    let body = AxumBody::from_stream(ReaderStream::new(file.take(length)));
    Ok((status, response_headers, body).into_response())
}

/// 多选下载：打包为 `files-<毫秒时间戳>.zip`。
pub async fn download_multiple(
    Extension(storage): Extension<Arc<Storage>>,
    WithRejection(Json(payload), _): WithRejection<Json<DownloadMultipleBody>, ApiError>,
) -> Result<Response, ApiError> {
    if payload.files.is_empty() {
        return Err(ApiError::BadRequest("No files specified".into()));
    }
    let sources = plan_sources(&storage, &payload.files).await?;
    info!(
        requested = payload.files.len(),
        included = sources.len(),
        "download multiple as zip"
    );
    zip_response(
        &format!("files-{}.zip", Utc::now().timestamp_millis()),
        sources,
    )
}

fn zip_response(
    file_name: &str,
    sources: Vec<ArchiveSource>,
) -> Result<Response, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/zip"));
    headers.insert(
        header::CONTENT_DISPOSITION,
        header_value(&content_disposition(file_name))?,
    );
    Ok((
        StatusCode::OK,
        headers,
        AxumBody::from_stream(stream_archive(sources)),
    )
        .into_response())
}

/// 新建目录。
pub async fn create_folder(
    Extension(storage): Extension<Arc<Storage>>,
    WithRejection(Json(payload), _): WithRejection<Json<CreateFolderBody>, ApiError>,
) -> Result<JsonResponse<CreateFolderResponse>, ApiError> {
    let path = storage
        .create_folder(&payload.relative_path, &payload.folder_name)
        .await?;
    info!(path, "create folder");
    Ok(JsonResponse(CreateFolderResponse {
        success: true,
        path,
    }))
}

/// 批量删除；单项失败只记录日志，响应中仅包含成功删除的路径。
pub async fn delete_entries(
    Extension(storage): Extension<Arc<Storage>>,
    WithRejection(Json(payload), _): WithRejection<Json<DeleteBody>, ApiError>,
) -> Result<JsonResponse<DeleteResponse>, ApiError> {
    if payload.paths.is_empty() {
        return Err(ApiError::BadRequest("No paths specified".into()));
    }
    let deleted = storage.delete_paths(&payload.paths).await;
    info!(
        requested = payload.paths.len(),
        deleted = deleted.len(),
        "delete entries"
    );
    Ok(JsonResponse(DeleteResponse {
        success: true,
        deleted,
    }))
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value)
        .map_err(|_| ApiError::Internal("Failed to build response header".into()))
}

/// `attachment`：ASCII 兜底文件名加 RFC 5987 `filename*`。
fn content_disposition(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|ch| match ch {
            '"' | '\\' => '_',
            ch if ch.is_ascii() && !ch.is_ascii_control() => ch,
            _ => '_',
        })
        .collect();
    format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
        urlencoding::encode(file_name)
    )
}

/// `Range` 头选中的闭区间字节范围。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ByteRange {
    start: u64,
    end: u64,
}

impl ByteRange {
    fn len(self) -> u64 {
        self.end - self.start + 1
    }

    fn content_range(self, size: u64) -> String {
        format!("bytes {}-{}/{size}", self.start, self.end)
    }
}

/// 解析单段 `bytes=` Range；不支持多段。
fn parse_range(value: Option<&HeaderValue>, size: u64) -> Result<Option<ByteRange>, ApiError> {
    let malformed = || ApiError::BadRequest("invalid Range header".into());
    let Some(value) = value else {
        return Ok(None);
    };
    let spec = value
        .to_str()
        .ok()
        .and_then(|value| value.trim().strip_prefix("bytes="))
        .ok_or_else(malformed)?;
    if spec.contains(',') {
        return Err(ApiError::BadRequest("multiple ranges not supported".into()));
    }
    let (first, last) = spec.split_once('-').ok_or_else(malformed)?;
    let (first, last) = (first.trim(), last.trim());
    let number = |text: &str| text.parse::<u64>().map_err(|_| malformed());
    let unsatisfiable = || ApiError::RangeNotSatisfiable(size);

    let Some(last_byte) = size.checked_sub(1) else {
        return Err(unsatisfiable());
    };
    let range = match (first.is_empty(), last.is_empty()) {
        (true, true) => return Err(malformed()),
        (true, false) => match number(last)? {
            0 => return Err(unsatisfiable()),
            suffix => ByteRange {
                start: size.saturating_sub(suffix),
                end: last_byte,
            },
        },
        (false, true) => ByteRange {
            start: number(first)?,
            end: last_byte,
        },
        (false, false) => ByteRange {
            start: number(first)?,
            end: number(last)?.min(last_byte),
        },
    };
    if range.start > range.end {
        return Err(unsatisfiable());
    }
    Ok(Some(range))
}
