//! 上传临时区：暂存上传数据、按会话存放分片。
//!
//! 临时区目录结构：
//!
//! ```text
//! .incoming/<uuid>.part        正在接收的数据
//! <upload id>/chunk-<index>    已保存的分片
//! <upload id>/session.json     会话元数据
//! ```

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{INCOMING_DIR, SESSION_META_FILE};

/// 暂存超过字节上限。
#[derive(Debug)]
pub enum StageError {
    TooLarge(u64),
    Io(io::Error),
}

impl From<io::Error> for StageError {
    fn from(err: io::Error) -> Self {
        StageError::Io(err)
    }
}

#[derive(Clone, Debug)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(self.root.join(INCOMING_DIR)).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join(upload_id)
    }

    pub fn meta_path(&self, upload_id: &str) -> PathBuf {
        self.session_dir(upload_id).join(SESSION_META_FILE)
    }

    pub fn chunk_path(&self, upload_id: &str, index: u64) -> PathBuf {
        self.session_dir(upload_id).join(format!("chunk-{index}"))
    }

    /// 在 `.incoming` 下开始暂存一个上传部分。`limit` 为 0 表示不限制。
    pub async fn begin_stage(&self, limit: u64) -> io::Result<Staging> {
        let incoming = self.root.join(INCOMING_DIR);
        fs::create_dir_all(&incoming).await?;
        let path = incoming.join(format!("{}.part", Uuid::new_v4()));
        let file = File::create(&path).await?;
        Ok(Staging {
            path,
            file,
            written: 0,
            limit,
        })
    }

    /// 将暂存文件移动为会话的第 `index` 个分片；同一序号重复上传时覆盖。
    pub async fn put_chunk(
        &self,
        upload_id: &str,
        index: u64,
        staged: StagedFile,
    ) -> io::Result<u64> {
        fs::create_dir_all(self.session_dir(upload_id)).await?;
        let target = self.chunk_path(upload_id, index);
        if let Err(err) = fs::rename(&staged.path, &target).await {
            staged.discard().await;
            return Err(err);
        }
        Ok(staged.len)
    }

    pub async fn remove_session(&self, upload_id: &str) -> io::Result<()> {
        fs::remove_dir_all(self.session_dir(upload_id)).await
    }

    /// 列出临时区中所有会话目录名。
    pub async fn session_ids(&self) -> io::Result<Vec<String>> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut ids = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == INCOMING_DIR || !entry.file_type().await?.is_dir() {
                continue;
            }
            ids.push(name);
        }
        Ok(ids)
    }

    /// 删除超过 `ttl` 未修改的暂存文件，返回删除数量。
    pub async fn sweep_incoming(&self, ttl: Duration) -> io::Result<usize> {
        let incoming = self.root.join(INCOMING_DIR);
        let mut dir = match fs::read_dir(&incoming).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };
        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = dir.next_entry().await? {
            let Ok(modified) = entry.metadata().await.and_then(|meta| meta.modified()) else {
                continue;
            };
            if now.duration_since(modified).unwrap_or_default() < ttl {
                continue;
            }
            let path = entry.path();
            match fs::remove_file(&path).await {
                Ok(()) => {
                    info!(path = ?path, "removed stale staging file");
                    removed += 1;
                }
                Err(err) => warn!(path = ?path, error = %err, "failed to remove staging file"),
            }
        }
        Ok(removed)
    }
}

/// 正在写入的暂存文件。
pub struct Staging {
    path: PathBuf,
    file: File,
    written: u64,
    limit: u64,
}

impl Staging {
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), StageError> {
        self.written += bytes.len() as u64;
        if self.limit > 0 && self.written > self.limit {
            return Err(StageError::TooLarge(self.limit));
        }
        self.file.write_all(bytes).await?;
        Ok(())
    }

    pub async fn finish(mut self) -> io::Result<StagedFile> {
        if let Err(err) = self.file.flush().await {
            self.abort().await;
            return Err(err);
        }
        drop(self.file);
        Ok(StagedFile {
            path: self.path,
            len: self.written,
        })
    }

    pub async fn abort(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.path).await;
    }
}

/// 已完整接收、等待移动到目标位置的上传数据。
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    len: u64,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.len
    }

    pub async fn discard(self) {
        let _ = fs::remove_file(&self.path).await;
    }
}

#[cfg(test)]
pub(crate) async fn stage_bytes(store: &ChunkStore, bytes: &[u8]) -> StagedFile {
    let mut staging = store.begin_stage(0).await.expect("begin stage");
    if staging.write(bytes).await.is_err() {
        panic!("stage write failed");
    }
    staging.finish().await.expect("finish stage")
}
