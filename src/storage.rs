//! 存储根目录、路径守卫（PathGuard）与基础文件操作。

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::io::{self, ErrorKind};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::atomic::AtomicFile;
use crate::names::{NameIssue, validate_name};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Access denied")]
    AccessDenied,
    #[error("{0}")]
    InvalidName(&'static str),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    AlreadyExists(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// 存储根目录，所有用户路径都相对它解析。
#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// 创建（必要时）并规范化存储根目录。
    pub async fn open(root: impl AsRef<Path>) -> io::Result<Self> {
        fs::create_dir_all(root.as_ref()).await?;
        let root = fs::canonicalize(root.as_ref()).await?;
        Ok(Self { root })
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 在根目录下解析 `relative`，对已存在部分跟随符号链接，
    /// 规范化后位于根目录之外的一律拒绝。
    pub async fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let normalized = normalize_relative(relative)?;
        self.resolve_normalized(&normalized).await
    }

    /// 与 [`Storage::resolve`] 相同，但不跟随最后一段，根目录内的符号链接指向链接本身。
    pub async fn resolve_entry(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let normalized = normalize_relative(relative)?;
        let (Some(parent), Some(name)) = (normalized.parent(), normalized.file_name()) else {
            return Err(StorageError::AccessDenied);
        };
        let mut resolved = self.resolve_normalized(parent).await?;
        resolved.push(name);
        Ok(resolved)
    }

    async fn resolve_normalized(&self, normalized: &Path) -> Result<PathBuf, StorageError> {
        let joined = self.root.join(normalized);

        let mut probe = joined.clone();
        let mut missing = Vec::new();
        let canonical = loop {
            match fs::canonicalize(&probe).await {
                Ok(canonical) => break canonical,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    let Some(name) = probe.file_name().map(|name| name.to_os_string()) else {
                        return Err(StorageError::AccessDenied);
                    };
                    missing.push(name);
                    if !probe.pop() {
                        return Err(StorageError::AccessDenied);
                    }
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        };

        let mut resolved = canonical;
        for name in missing.into_iter().rev() {
            resolved.push(name);
        }
        if !resolved.starts_with(&self.root) {
            debug!(path = ?normalized, resolved = ?resolved, "path escapes storage root");
            return Err(StorageError::AccessDenied);
        }
        Ok(resolved)
    }

    /// 将绝对路径转换为以 `/` 分隔的存储相对路径。
    pub fn relative_path(&self, absolute: &Path) -> Result<String, StorageError> {
        let relative = absolute
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::AccessDenied)?;
        Ok(relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"))
    }

    /// 列出目录内容；目录不存在时返回空列表。
    pub async fn list_dir(&self, relative: &str) -> Result<Vec<FileEntry>, StorageError> {
        let target = self.resolve(relative).await?;
        let mut dir = match fs::read_dir(&target).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let metadata = match fs::metadata(&path).await {
                Ok(metadata) => metadata,
                Err(err) => {
                    debug!(path = ?path, error = %err, "skip unreadable entry");
                    continue;
                }
            };
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind: if metadata.is_dir() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                },
                size: metadata.len(),
                modified: metadata
                    .modified()
                    .map(format_timestamp)
                    .unwrap_or_default(),
                path: self.relative_path(&path)?,
            });
        }

        Ok(entries)
    }

    /// 删除单个文件或目录（递归）。存储根目录本身无法被删除。
    pub async fn delete_path(&self, relative: &str) -> Result<(), StorageError> {
        let target = self.resolve_entry(relative).await?;
        let metadata = match fs::symlink_metadata(&target).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(relative.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        if metadata.is_dir() {
            fs::remove_dir_all(&target).await?;
        } else {
            fs::remove_file(&target).await?;
        }
        Ok(())
    }

    /// 逐个删除路径，返回实际删除的条目。
    pub async fn delete_paths(&self, paths: &[String]) -> Vec<String> {
        let mut deleted = Vec::new();
        for path in paths {
            match self.delete_path(path).await {
                Ok(()) => {
                    info!(path, "deleted entry");
                    deleted.push(path.clone());
                }
                Err(err) => warn!(path, error = %err, "failed to delete entry"),
            }
        }
        deleted
    }

    /// 在 `relative_dir` 下创建名为 `folder_name` 的目录，返回其相对路径。
    pub async fn create_folder(
        &self,
        relative_dir: &str,
        folder_name: &str,
    ) -> Result<String, StorageError> {
        validate_name(folder_name).map_err(|issue| match issue {
            NameIssue::Empty => StorageError::InvalidName("Invalid folder name"),
            NameIssue::InvalidCharacters => {
                StorageError::InvalidName("Folder name contains invalid characters")
            }
        })?;
        let target = self
            .resolve(&format!("{relative_dir}/{folder_name}"))
            .await?;
        if fs::symlink_metadata(&target).await.is_ok() {
            return Err(StorageError::AlreadyExists("Folder already exists"));
        }
        fs::create_dir_all(&target).await?;
        self.relative_path(&target)
    }

    /// 把暂存文件移动到 `relative_dir/name`，覆盖已存在的文件。
    pub async fn place_file(
        &self,
        relative_dir: &str,
        name: &str,
        staged: &Path,
    ) -> Result<String, StorageError> {
        validate_name(name)
            .map_err(|_| StorageError::InvalidName("File name contains invalid characters"))?;
        let dir = self.resolve(relative_dir).await?;
        fs::create_dir_all(&dir).await?;
        let target = self.resolve(&format!("{relative_dir}/{name}")).await?;
        if fs::metadata(&target).await.is_ok_and(|metadata| metadata.is_dir()) {
            return Err(StorageError::AlreadyExists(
                "A folder with that name already exists",
            ));
        }
        move_file(staged, &target).await?;
        self.relative_path(&target)
    }
}

/// 优先 rename，跨文件系统时退化为原子复制后删除源文件。
pub async fn move_file(from: &Path, to: &Path) -> Result<(), StorageError> {
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::CrossesDevices => {
            let mut atomic = AtomicFile::new(to).await?;
            let copied = async {
                let mut source = fs::File::open(from).await?;
                tokio::io::copy(&mut source, atomic.file_mut()).await
            }
            .await;
            if let Err(err) = copied {
                atomic.cleanup().await;
                return Err(err.into());
            }
            atomic.finalize().await?;
            fs::remove_file(from).await?;
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn normalize_relative(relative: &str) -> Result<PathBuf, StorageError> {
    if relative.contains('\0') {
        return Err(StorageError::AccessDenied);
    }
    let mut normalized = PathBuf::new();
    for segment in relative.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => {
                if !normalized.pop() {
                    return Err(StorageError::AccessDenied);
                }
            }
            _ => {
                let mut components = Path::new(segment).components();
                match (components.next(), components.next()) {
                    (Some(Component::Normal(part)), None) => normalized.push(part),
                    _ => return Err(StorageError::AccessDenied),
                }
            }
        }
    }
    Ok(normalized)
}

fn format_timestamp(time: SystemTime) -> String {
    let datetime: DateTime<Utc> = time.into();
    datetime.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Serialize)]
pub struct FileEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub size: u64,
    pub modified: String,
    pub path: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn make_storage() -> (tempfile::TempDir, Storage) {
        let temp = tempdir().expect("tempdir");
        let storage = Storage::open(temp.path().join("storage"))
            .await
            .expect("open storage");
        (temp, storage)
    }

    #[tokio::test]
    async fn resolve_denies_parent_escape() {
        let (_temp, storage) = make_storage().await;
        for path in ["../secret.txt", "a/../../secret", "..\\..\\etc", "/../x"] {
            let result = storage.resolve(path).await;
            assert!(matches!(result, Err(StorageError::AccessDenied)), "{path}");
        }
    }

    #[tokio::test]
    async fn resolve_allows_inner_parent_segments() {
        let (_temp, storage) = make_storage().await;
        let resolved = storage.resolve("a/b/../c").await.expect("resolve");
        assert_eq!(resolved, storage.root_path().join("a/c"));
        let root = storage.resolve("").await.expect("resolve root");
        assert_eq!(root, storage.root_path());
    }

    #[tokio::test]
    async fn resolve_does_not_accept_sibling_prefix() {
        let temp = tempdir().expect("tempdir");
        let storage = Storage::open(temp.path().join("store")).await.expect("open");
        std::fs::create_dir_all(temp.path().join("store-evil")).expect("mkdir");
        let result = storage.resolve("../store-evil/file").await;
        assert!(matches!(result, Err(StorageError::AccessDenied)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_denies_symlink_escape() {
        use std::os::unix::fs::symlink;

        let (temp, storage) = make_storage().await;
        let outside = temp.path().join("outside");
        std::fs::create_dir_all(&outside).expect("create outside");
        std::fs::write(outside.join("secret.txt"), b"secret").expect("write outside");
        symlink(&outside, storage.root_path().join("link")).expect("symlink");

        let result = storage.resolve("link/secret.txt").await;
        assert!(matches!(result, Err(StorageError::AccessDenied)));
        let result = storage.resolve("link/not-yet/created").await;
        assert!(matches!(result, Err(StorageError::AccessDenied)));
    }

    #[tokio::test]
    async fn list_missing_directory_is_empty() {
        let (_temp, storage) = make_storage().await;
        let entries = storage.list_dir("nope/deeper").await.expect("list");
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn list_reports_kinds_and_relative_paths() {
        let (_temp, storage) = make_storage().await;
        let root = storage.root_path();
        std::fs::create_dir_all(root.join("docs/inner")).expect("mkdir");
        std::fs::write(root.join("docs/a.txt"), b"hello").expect("write");

        let mut entries = storage.list_dir("docs").await.expect("list");
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].kind, EntryKind::File);
        assert_eq!(entries[0].size, 5);
        assert_eq!(entries[0].path, "docs/a.txt");
        assert!(entries[0].modified.ends_with('Z'));
        assert_eq!(entries[1].kind, EntryKind::Directory);
        assert_eq!(entries[1].path, "docs/inner");
    }

    #[tokio::test]
    async fn list_traversal_is_denied() {
        let (_temp, storage) = make_storage().await;
        let result = storage.list_dir("../").await;
        assert!(matches!(result, Err(StorageError::AccessDenied)));
    }

    #[tokio::test]
    async fn delete_paths_skips_missing_and_reports_successes() {
        let (_temp, storage) = make_storage().await;
        let root = storage.root_path();
        std::fs::write(root.join("a.txt"), b"a").expect("write a");
        std::fs::create_dir_all(root.join("b/nested")).expect("mkdir b");
        std::fs::write(root.join("b/nested/c.txt"), b"c").expect("write c");

        let deleted = storage
            .delete_paths(&[
                "a.txt".to_string(),
                "missing.txt".to_string(),
                "b/".to_string(),
            ])
            .await;

        assert_eq!(deleted, vec!["a.txt".to_string(), "b/".to_string()]);
        assert!(!root.join("a.txt").exists());
        assert!(!root.join("b").exists());
    }

    #[tokio::test]
    async fn delete_refuses_root_and_escapes() {
        let (temp, storage) = make_storage().await;
        std::fs::write(temp.path().join("victim.txt"), b"keep").expect("write victim");

        let deleted = storage
            .delete_paths(&["".to_string(), "../victim.txt".to_string()])
            .await;

        assert!(deleted.is_empty());
        assert!(storage.root_path().exists());
        assert!(temp.path().join("victim.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn delete_symlink_removes_link_only() {
        use std::os::unix::fs::symlink;

        let (_temp, storage) = make_storage().await;
        let root = storage.root_path();
        std::fs::write(root.join("target.txt"), b"keep").expect("write target");
        symlink(root.join("target.txt"), root.join("alias")).expect("symlink");

        storage.delete_path("alias").await.expect("delete link");

        assert!(root.join("target.txt").exists());
        assert!(std::fs::symlink_metadata(root.join("alias")).is_err());
    }

    #[tokio::test]
    async fn create_folder_validates_and_rejects_duplicates() {
        let (_temp, storage) = make_storage().await;
        let path = storage.create_folder("a/b", "new").await.expect("create");
        assert_eq!(path, "a/b/new");
        assert!(storage.root_path().join("a/b/new").is_dir());

        let again = storage.create_folder("a/b", "new").await;
        assert!(matches!(again, Err(StorageError::AlreadyExists(_))));

        let invalid = storage.create_folder("", "bad:name").await;
        assert!(matches!(invalid, Err(StorageError::InvalidName(_))));

        let denied = storage.create_folder("../..", "x").await;
        assert!(matches!(denied, Err(StorageError::AccessDenied)));
    }

    #[tokio::test]
    async fn place_file_moves_into_created_directory() {
        let (temp, storage) = make_storage().await;
        let staged = temp.path().join("staged.part");
        std::fs::write(&staged, b"payload").expect("write staged");

        let path = storage
            .place_file("incoming/today", "report.txt", &staged)
            .await
            .expect("place");

        assert_eq!(path, "incoming/today/report.txt");
        let contents = std::fs::read(storage.root_path().join(&path)).expect("read");
        assert_eq!(contents, b"payload");
        assert!(!staged.exists());
    }
}
