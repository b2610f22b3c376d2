//! 分片上传会话登记：记录已到达的分片并持久化会话元数据。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, ErrorKind};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::atomic::write_atomic;
use crate::chunks::{ChunkStore, StagedFile};
use crate::locking::{KeyGuard, LockManager};
use crate::names::{generate_upload_id, is_valid_upload_id, validate_name};
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Invalid chunk index {index} for {total} chunks")]
    InvalidChunkIndex { index: i64, total: i64 },
    #[error("totalChunks must be a positive integer")]
    InvalidTotalChunks,
    #[error("Upload declares {declared} chunks but the session expects {recorded}")]
    SessionTotalMismatch { recorded: u64, declared: u64 },
    #[error("Not all chunks uploaded")]
    IncompleteUpload { received: u64, expected: u64 },
    #[error("Upload session {0} not found")]
    SessionNotFound(String),
    #[error("Invalid upload id")]
    InvalidUploadId,
    #[error("Upload session {0} is busy")]
    SessionBusy(String),
    #[error("File name contains invalid characters")]
    InvalidFileName,
    #[error("Corrupt session metadata: {0}")]
    CorruptSession(#[from] serde_json::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// 单个分片上传的持久记录，保存为 `session.json`。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub upload_id: String,
    pub file_name: String,
    pub relative_path: String,
    pub total_chunks: u64,
    /// 已收到的分片序号到字节数的映射。
    pub chunks: BTreeMap<u64, u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionMeta {
    pub fn received(&self) -> u64 {
        self.chunks.len() as u64
    }

    pub fn is_complete(&self) -> bool {
        self.received() == self.total_chunks
    }
}

/// 客户端声明的单个分片。
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub upload_id: Option<String>,
    pub chunk_index: i64,
    pub total_chunks: i64,
    pub file_name: String,
    pub relative_path: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceipt {
    pub upload_id: String,
    pub received: u64,
    pub total: u64,
}

pub struct SessionRegistry {
    store: ChunkStore,
    locks: LockManager,
    lock_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(store: ChunkStore, lock_timeout: Duration) -> Self {
        Self {
            store,
            locks: LockManager::new(),
            lock_timeout,
        }
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    /// 把 `staged` 保存为第 `chunk_index` 个分片并登记到会话。
    ///
    /// 成功时暂存文件被移走，任何失败都会丢弃它。
    pub async fn ingest(
        &self,
        storage: &Storage,
        request: ChunkRequest,
        staged: StagedFile,
    ) -> Result<ChunkReceipt, UploadError> {
        let (guard, meta, index) = match self.open_session(storage, request).await {
            Ok(opened) => opened,
            Err(err) => {
                staged.discard().await;
                return Err(err);
            }
        };
        let result = self.record_chunk(meta, index, staged).await;
        drop(guard);
        result
    }

    /// 校验请求并获取会话锁。返回已记录的会话；首个分片时返回尚未保存的新会话。
    async fn open_session(
        &self,
        storage: &Storage,
        request: ChunkRequest,
    ) -> Result<(KeyGuard, SessionMeta, u64), UploadError> {
        if request.total_chunks <= 0 {
            return Err(UploadError::InvalidTotalChunks);
        }
        if request.chunk_index < 0 || request.chunk_index >= request.total_chunks {
            return Err(UploadError::InvalidChunkIndex {
                index: request.chunk_index,
                total: request.total_chunks,
            });
        }
        validate_name(&request.file_name).map_err(|_| UploadError::InvalidFileName)?;
        storage
            .resolve(&format!("{}/{}", request.relative_path, request.file_name))
            .await?;

        let total = request.total_chunks as u64;
        let index = request.chunk_index as u64;
        let (guard, upload_id, existing) = match request.upload_id {
            Some(upload_id) => {
                if !is_valid_upload_id(&upload_id) {
                    return Err(UploadError::InvalidUploadId);
                }
                let guard = self.lock(&upload_id).await?;
                let existing = self.read_meta(&upload_id).await?;
                (guard, upload_id, existing)
            }
            None => {
                let (guard, upload_id) = self.claim_new_id(&request.file_name).await?;
                (guard, upload_id, None)
            }
        };

        let meta = match existing {
            Some(meta) if meta.total_chunks != total => {
                return Err(UploadError::SessionTotalMismatch {
                    recorded: meta.total_chunks,
                    declared: total,
                });
            }
            Some(meta) => meta,
            None => {
                info!(
                    upload_id,
                    file_name = request.file_name,
                    total_chunks = total,
                    "upload session created"
                );
                let now = Utc::now();
                SessionMeta {
                    upload_id,
                    file_name: request.file_name,
                    relative_path: request.relative_path,
                    total_chunks: total,
                    chunks: BTreeMap::new(),
                    created_at: now,
                    updated_at: now,
                }
            }
        };
        Ok((guard, meta, index))
    }

    /// 在会话锁内放置分片并原子更新元数据。
    async fn record_chunk(
        &self,
        mut meta: SessionMeta,
        index: u64,
        staged: StagedFile,
    ) -> Result<ChunkReceipt, UploadError> {
        let bytes = self.store.put_chunk(&meta.upload_id, index, staged).await?;
        meta.chunks.insert(index, bytes);
        meta.updated_at = Utc::now();
        self.write_meta(&meta).await?;

        debug!(
            upload_id = meta.upload_id,
            chunk_index = index,
            bytes,
            received = meta.received(),
            total = meta.total_chunks,
            "chunk stored"
        );
        Ok(ChunkReceipt {
            received: meta.received(),
            total: meta.total_chunks,
            upload_id: meta.upload_id,
        })
    }

    /// 选用 `<fileName>-<毫秒>`，已存在同名会话时追加 `-1`、`-2` 等后缀。
    /// 返回时持有所选 ID 的锁。
    async fn claim_new_id(
        &self,
        file_name: &str,
    ) -> Result<(KeyGuard, String), UploadError> {
        let base = generate_upload_id(file_name, Utc::now());
        let mut attempt = 0u32;
        loop {
            let candidate = if attempt == 0 {
                base.clone()
            } else {
                format!("{base}-{attempt}")
            };
            let guard = self.lock(&candidate).await?;
            match fs::symlink_metadata(self.store.session_dir(&candidate)).await {
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok((guard, candidate)),
                Err(err) => return Err(err.into()),
                Ok(_) => attempt += 1,
            }
        }
    }

    /// 返回会话当前状态。
    pub async fn status(&self, upload_id: &str) -> Result<SessionMeta, UploadError> {
        if !is_valid_upload_id(upload_id) {
            return Err(UploadError::InvalidUploadId);
        }
        let _guard = self.lock(upload_id).await?;
        self.read_meta(upload_id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(upload_id.to_string()))
    }

    /// 显式放弃会话并删除其临时目录。
    pub async fn abort(&self, upload_id: &str) -> Result<(), UploadError> {
        if !is_valid_upload_id(upload_id) {
            return Err(UploadError::InvalidUploadId);
        }
        let guard = self.lock(upload_id).await?;
        match self.store.remove_session(upload_id).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(UploadError::SessionNotFound(upload_id.to_string()));
            }
            Err(err) => return Err(err.into()),
        }
        drop(guard);
        info!(upload_id, "upload session aborted");
        Ok(())
    }

    /// 删除空闲至少 `ttl` 的会话。锁被占用（分片或合并进行中）的会话留到下次清理。
    pub async fn sweep_stale(&self, ttl: Duration) -> io::Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        for upload_id in self.store.session_ids().await? {
            let Some(guard) = self.locks.try_lock(&upload_id) else {
                debug!(upload_id, "skip busy upload session");
                continue;
            };
            let last_activity = match self.read_meta(&upload_id).await {
                Ok(Some(meta)) => SystemTime::from(meta.updated_at),
                _ => match fs::metadata(self.store.session_dir(&upload_id))
                    .await
                    .and_then(|meta| meta.modified())
                {
                    Ok(modified) => modified,
                    Err(_) => continue,
                },
            };
            if now.duration_since(last_activity).unwrap_or_default() < ttl {
                continue;
            }
            match self.store.remove_session(&upload_id).await {
                Ok(()) => {
                    info!(upload_id, "removed abandoned upload session");
                    removed += 1;
                }
                Err(err) => warn!(upload_id, error = %err, "failed to remove upload session"),
            }
            drop(guard);
        }
        self.store.sweep_incoming(ttl).await?;
        Ok(removed)
    }

    pub(crate) async fn lock(&self, upload_id: &str) -> Result<KeyGuard, UploadError> {
        self.locks
            .lock_with_timeout(upload_id, self.lock_timeout)
            .await
            .ok_or_else(|| UploadError::SessionBusy(upload_id.to_string()))
    }

    pub(crate) async fn read_meta(&self, upload_id: &str) -> Result<Option<SessionMeta>, UploadError> {
        match fs::read(self.store.meta_path(upload_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_meta(&self, meta: &SessionMeta) -> Result<(), UploadError> {
        let contents = serde_json::to_vec(meta)?;
        write_atomic(&self.store.meta_path(&meta.upload_id), &contents).await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chunks::stage_bytes;
    use std::sync::Arc;
    use tempfile::tempdir;

    pub(crate) struct Fixture {
        pub _temp: tempfile::TempDir,
        pub storage: Storage,
        pub registry: SessionRegistry,
    }

    pub(crate) async fn fixture() -> Fixture {
        let temp = tempdir().expect("tempdir");
        let storage = Storage::open(temp.path().join("storage"))
            .await
            .expect("open storage");
        let store = ChunkStore::new(temp.path().join("temp"));
        store.ensure_root().await.expect("temp root");
        Fixture {
            _temp: temp,
            storage,
            registry: SessionRegistry::new(store, Duration::from_secs(5)),
        }
    }

    pub(crate) fn request(upload_id: Option<&str>, index: i64, total: i64) -> ChunkRequest {
        ChunkRequest {
            upload_id: upload_id.map(str::to_string),
            chunk_index: index,
            total_chunks: total,
            file_name: "movie.bin".to_string(),
            relative_path: "videos".to_string(),
        }
    }

    pub(crate) async fn ingest_bytes(
        fx: &Fixture,
        request: ChunkRequest,
        bytes: &[u8],
    ) -> Result<ChunkReceipt, UploadError> {
        let staged = stage_bytes(fx.registry.store(), bytes).await;
        fx.registry.ingest(&fx.storage, request, staged).await
    }

    #[tokio::test]
    async fn first_chunk_generates_id_from_file_name() {
        let fx = fixture().await;
        let receipt = ingest_bytes(&fx, request(None, 0, 3), b"abc")
            .await
            .expect("ingest");

        assert!(receipt.upload_id.starts_with("movie.bin-"));
        assert_eq!(receipt.received, 1);
        assert_eq!(receipt.total, 3);
        let meta = fx.registry.status(&receipt.upload_id).await.expect("status");
        assert_eq!(meta.file_name, "movie.bin");
        assert_eq!(meta.relative_path, "videos");
        assert_eq!(meta.chunks.get(&0), Some(&3));
    }

    #[tokio::test]
    async fn generated_ids_do_not_collide() {
        let fx = fixture().await;
        let first = ingest_bytes(&fx, request(None, 0, 2), b"a").await.expect("first");
        let second = ingest_bytes(&fx, request(None, 0, 2), b"b").await.expect("second");
        assert_ne!(first.upload_id, second.upload_id);
        assert_eq!(second.received, 1);
    }

    #[tokio::test]
    async fn replayed_chunk_is_counted_once() {
        let fx = fixture().await;
        for _ in 0..3 {
            let receipt = ingest_bytes(&fx, request(Some("up-1"), 1, 4), b"xyz")
                .await
                .expect("ingest");
            assert_eq!(receipt.received, 1);
        }
        let receipt = ingest_bytes(&fx, request(Some("up-1"), 0, 4), b"xyz")
            .await
            .expect("ingest");
        assert_eq!(receipt.received, 2);
    }

    #[tokio::test]
    async fn rejects_out_of_range_indices() {
        let fx = fixture().await;
        let result = ingest_bytes(&fx, request(Some("up"), 3, 3), b"x").await;
        assert!(matches!(
            result,
            Err(UploadError::InvalidChunkIndex { index: 3, total: 3 })
        ));
        let result = ingest_bytes(&fx, request(Some("up"), -1, 3), b"x").await;
        assert!(matches!(result, Err(UploadError::InvalidChunkIndex { .. })));
        let result = ingest_bytes(&fx, request(Some("up"), 0, 0), b"x").await;
        assert!(matches!(result, Err(UploadError::InvalidTotalChunks)));
        assert!(fx.registry.store().session_ids().await.expect("ids").is_empty());
    }

    #[tokio::test]
    async fn rejects_total_mismatch() {
        let fx = fixture().await;
        ingest_bytes(&fx, request(Some("up"), 0, 3), b"x")
            .await
            .expect("first");
        let result = ingest_bytes(&fx, request(Some("up"), 1, 4), b"x").await;
        assert!(matches!(
            result,
            Err(UploadError::SessionTotalMismatch {
                recorded: 3,
                declared: 4
            })
        ));
        assert_eq!(fx.registry.status("up").await.expect("status").received(), 1);
    }

    #[tokio::test]
    async fn rejects_escaping_target_without_touching_disk() {
        let fx = fixture().await;
        let mut req = request(Some("up"), 0, 1);
        req.relative_path = "../../outside".to_string();
        let result = ingest_bytes(&fx, req, b"x").await;
        assert!(matches!(
            result,
            Err(UploadError::Storage(StorageError::AccessDenied))
        ));
        assert!(fx.registry.store().session_ids().await.expect("ids").is_empty());
        let incoming = std::fs::read_dir(
            fx.registry
                .store()
                .root_path()
                .join(crate::config::INCOMING_DIR),
        )
        .expect("incoming")
        .count();
        assert_eq!(incoming, 0, "staged chunk should be discarded");
    }

    #[tokio::test]
    async fn rejects_invalid_ids_and_names() {
        let fx = fixture().await;
        let result = ingest_bytes(&fx, request(Some("../x"), 0, 1), b"x").await;
        assert!(matches!(result, Err(UploadError::InvalidUploadId)));
        let mut req = request(None, 0, 1);
        req.file_name = "a/b".to_string();
        let result = ingest_bytes(&fx, req, b"x").await;
        assert!(matches!(result, Err(UploadError::InvalidFileName)));
    }

    #[tokio::test]
    async fn concurrent_chunks_for_one_session_are_all_recorded() {
        let fx = Arc::new(fixture().await);
        let total = 16;
        let mut tasks = Vec::new();
        for index in 0..total {
            let fx = fx.clone();
            tasks.push(tokio::spawn(async move {
                ingest_bytes(&fx, request(Some("parallel"), index, total), &[index as u8])
                    .await
                    .map(|_| ())
                    .map_err(|err| err.to_string())
            }));
        }
        for task in tasks {
            task.await.expect("join").expect("ingest");
        }
        let meta = fx.registry.status("parallel").await.expect("status");
        assert_eq!(meta.received(), total as u64);
        assert!(meta.is_complete());
    }

    #[tokio::test]
    async fn session_survives_registry_restart() {
        let fx = fixture().await;
        ingest_bytes(&fx, request(Some("resume"), 0, 2), b"a")
            .await
            .expect("ingest");
        let restarted = SessionRegistry::new(fx.registry.store().clone(), Duration::from_secs(5));
        let meta = restarted.status("resume").await.expect("status");
        assert_eq!(meta.received(), 1);
        assert_eq!(meta.total_chunks, 2);
    }

    #[tokio::test]
    async fn abort_removes_session() {
        let fx = fixture().await;
        ingest_bytes(&fx, request(Some("gone"), 0, 2), b"a")
            .await
            .expect("ingest");
        fx.registry.abort("gone").await.expect("abort");
        assert!(matches!(
            fx.registry.status("gone").await,
            Err(UploadError::SessionNotFound(_))
        ));
        assert!(matches!(
            fx.registry.abort("gone").await,
            Err(UploadError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn sweep_skips_fresh_and_busy_sessions() {
        let fx = fixture().await;
        ingest_bytes(&fx, request(Some("fresh"), 0, 2), b"a")
            .await
            .expect("ingest fresh");
        ingest_bytes(&fx, request(Some("busy"), 0, 2), b"a")
            .await
            .expect("ingest busy");

        assert_eq!(
            fx.registry
                .sweep_stale(Duration::from_secs(3600))
                .await
                .expect("sweep"),
            0
        );

        let held = fx.registry.lock("busy").await.expect("lock busy");
        let removed = fx.registry.sweep_stale(Duration::ZERO).await.expect("sweep");
        assert_eq!(removed, 1);
        drop(held);
        let ids = fx.registry.store().session_ids().await.expect("ids");
        assert_eq!(ids, vec!["busy".to_string()]);
    }

    #[tokio::test]
    async fn unknown_ids_leave_no_lock_entries() {
        let fx = fixture().await;
        for i in 0..1000 {
            let result = fx.registry.status(&format!("nope-{i}")).await;
            assert!(matches!(result, Err(UploadError::SessionNotFound(_))));
        }
        let aborted = fx.registry.abort("nope-x").await;
        assert!(matches!(aborted, Err(UploadError::SessionNotFound(_))));
        assert_eq!(fx.registry.locks.tracked(), 0);

        ingest_bytes(&fx, request(Some("real"), 0, 2), b"a")
            .await
            .expect("ingest");
        assert_eq!(fx.registry.locks.tracked(), 0);
    }
}
