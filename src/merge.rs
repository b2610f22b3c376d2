//! 分片合并：按序号顺序拼接分片并原子写入目标文件。

use tokio::fs::{self, File};
use tracing::{info, warn};

use crate::atomic::AtomicFile;
use crate::names::is_valid_upload_id;
use crate::session::{SessionRegistry, UploadError};
use crate::storage::Storage;

impl SessionRegistry {
    /// 按序把分片 `0..total` 拼接到 `relativePath/fileName` 并删除会话，
    /// 返回合并文件的存储相对路径。
    ///
    /// 全程持有会话锁，分片登记与清理不会交错执行。
    /// 失败时目标文件保持不变，会话保留以便重试。
    pub async fn merge(
        &self,
        storage: &Storage,
        upload_id: &str,
    ) -> Result<String, UploadError> {
        if !is_valid_upload_id(upload_id) {
            return Err(UploadError::InvalidUploadId);
        }
        let guard = self.lock(upload_id).await?;
        let meta = self
            .read_meta(upload_id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(upload_id.to_string()))?;

        let complete = meta.is_complete()
            && (0..meta.total_chunks).all(|index| meta.chunks.contains_key(&index));
        if !complete {
            return Err(UploadError::IncompleteUpload {
                received: meta.received(),
                expected: meta.total_chunks,
            });
        }

        let target_dir = storage.resolve(&meta.relative_path).await?;
        fs::create_dir_all(&target_dir).await?;
        let target = storage
            .resolve(&format!("{}/{}", meta.relative_path, meta.file_name))
            .await?;

        let mut atomic = AtomicFile::new(&target).await?;
        let written = async {
            let mut total: u64 = 0;
            for index in 0..meta.total_chunks {
                let mut chunk = File::open(self.store().chunk_path(upload_id, index)).await?;
                total += tokio::io::copy(&mut chunk, atomic.file_mut()).await?;
            }
            Ok::<u64, std::io::Error>(total)
        }
        .await;
        let written = match written {
            Ok(written) => written,
            Err(err) => {
                warn!(upload_id, error = %err, "merge failed, session kept");
                atomic.cleanup().await;
                return Err(err.into());
            }
        };
        atomic.finalize().await?;

        if let Err(err) = self.store().remove_session(upload_id).await {
            warn!(upload_id, error = %err, "failed to remove merged session");
        }
        drop(guard);

        let path = storage.relative_path(&target)?;
        info!(
            upload_id,
            path,
            bytes = written,
            chunks = meta.total_chunks,
            "upload merged"
        );
        Ok(path)
    }
}
