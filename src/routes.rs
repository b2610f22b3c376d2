//! 路由装配：API 端点、中间件与静态前端。

use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::Request;
use axum::routing::{delete, get, post};
use axum::{Router, middleware};
use std::path::Path;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::http::{add_security_headers, build_cors_layer, client_ip};
use crate::session::SessionRegistry;
use crate::storage::Storage;
use crate::upload::UploadConfig;
use crate::{files, upload};

/// 构建应用路由。未匹配的路径交给 `public_dir` 中的静态前端。
pub fn build_router(
    storage: Arc<Storage>,
    registry: Arc<SessionRegistry>,
    upload_config: Arc<UploadConfig>,
    public_dir: &Path,
    cors_origins: Option<&str>,
) -> Router {
    let mut app = Router::new()
        .route("/api/files", get(files::list_files))
        .route(
            "/api/upload",
            post(files::upload_files).layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/api/upload-chunk",
            post(upload::upload_chunk).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/merge-chunks", post(upload::merge_chunks))
        .route("/api/abort-upload", post(upload::abort_upload))
        .route("/api/upload-status", get(upload::upload_status))
        .route("/api/download/{*path}", get(files::download_entry))
        .route("/api/download-multiple", post(files::download_multiple))
        .route("/api/create-folder", post(files::create_folder))
        .route("/api/delete", delete(files::delete_entries))
        .fallback_service(ServeDir::new(public_dir))
        .layer(middleware::from_fn(add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let client_ip = client_ip(request)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage))
        .layer(Extension(registry))
        .layer(Extension(upload_config));

    if let Some(cors_layer) = build_cors_layer(cors_origins) {
        app = app.layer(cors_layer);
    }
    app
}
