//! 临时写入与原子替换的辅助方法。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// 与 `target` 同目录的临时文件，[`AtomicFile::finalize`] 时通过重命名替换目标。
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: File,
}

impl AtomicFile {
    /// 在目标路径同目录创建临时文件。
    pub async fn new(target: &Path) -> io::Result<Self> {
        let parent = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid target path"))?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "file".into());
        let temp_path = parent.join(format!(".{base}.tmp.{}", Uuid::new_v4()));
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file,
        })
    }

    /// 返回临时文件的可写句柄。
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// 放弃并清理临时文件。
    pub async fn cleanup(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// 同步并原子替换目标文件。
    pub async fn finalize(mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);

        if let Err(err) = fs::rename(&self.temp_path, &self.target).await {
            #[cfg(windows)]
            {
                if fs::remove_file(&self.target).await.is_ok() {
                    return fs::rename(&self.temp_path, &self.target).await;
                }
            }
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err);
        }

        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }

        Ok(())
    }
}

/// 经 [`AtomicFile`] 把 `contents` 写入 `target`。
pub async fn write_atomic(target: &Path, contents: &[u8]) -> io::Result<()> {
    let mut atomic = AtomicFile::new(target).await?;
    if let Err(err) = atomic.file_mut().write_all(contents).await {
        atomic.cleanup().await;
        return Err(err);
    }
    atomic.finalize().await
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn write_atomic_replaces_existing_file() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("meta.json");
        std::fs::write(&target, b"old").expect("write old");

        write_atomic(&target, b"new contents").await.expect("write");

        assert_eq!(std::fs::read(&target).expect("read"), b"new contents");
        let leftovers = std::fs::read_dir(temp.path()).expect("read dir").count();
        assert_eq!(leftovers, 1, "temp file should be renamed away");
    }

    #[tokio::test]
    async fn cleanup_leaves_target_untouched() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("data.bin");
        std::fs::write(&target, b"original").expect("write original");

        let mut atomic = AtomicFile::new(&target).await.expect("atomic");
        atomic.file_mut().write_all(b"partial").await.expect("write");
        atomic.cleanup().await;

        assert_eq!(std::fs::read(&target).expect("read"), b"original");
        assert_eq!(std::fs::read_dir(temp.path()).expect("read dir").count(), 1);
    }
}
