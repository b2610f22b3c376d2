//! 归档下载：把文件与目录边读边写成 zip 流。

use axum::body::Bytes;
use chrono::{DateTime, Datelike, Local, Timelike};
use futures_util::Stream;
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufWriter, ErrorKind, Seek, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime as ZipDateTime};

use crate::config::ARCHIVE_FRAME_SIZE;
use crate::storage::{Storage, StorageError};

const ARCHIVE_CHANNEL_DEPTH: usize = 4;
const ROOT_ARCHIVE_NAME: &str = "files";

/// 已校验的顶层条目及其在归档中的名称。
#[derive(Debug, Clone)]
pub struct ArchiveSource {
    path: PathBuf,
    name: String,
    is_dir: bool,
}

impl ArchiveSource {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// 通过存储路径守卫解析所有请求路径。
///
/// 多个路径时跳过被拒绝或不存在的条目；只有一个路径且失败时整个请求失败。
/// 目录以自身名称为根；批量中的文件保留相对路径，单独请求时只用文件名。
pub async fn plan_sources(
    storage: &Storage,
    paths: &[String],
) -> Result<Vec<ArchiveSource>, StorageError> {
    let single = paths.len() == 1;
    let mut sources = Vec::with_capacity(paths.len());
    for path in paths {
        match plan_source(storage, path, single).await {
            Ok(source) => sources.push(source),
            Err(err) if single => return Err(err),
            Err(err) => warn!(path, error = %err, "skip archive source"),
        }
    }
    Ok(sources)
}

async fn plan_source(
    storage: &Storage,
    path: &str,
    single: bool,
) -> Result<ArchiveSource, StorageError> {
    let resolved = storage.resolve(path).await?;
    let metadata = match fs::metadata(&resolved).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(StorageError::NotFound(path.to_string()));
        }
        Err(err) => return Err(err.into()),
    };
    let base_name = resolved
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| ROOT_ARCHIVE_NAME.to_string());
    let name = if metadata.is_dir() || single {
        base_name
    } else {
        storage.relative_path(&resolved)?
    };
    Ok(ArchiveSource {
        path: resolved,
        name,
        is_dir: metadata.is_dir(),
    })
}

/// 单个归档中已写入的条目名与已打开的文件数。
#[derive(Debug, Default)]
struct EntrySet {
    names: HashSet<String>,
    files: usize,
}

/// 逐条把 `sources` 写成 zip 到 `sink`，返回归档的文件数。
pub fn write_archive<W: Write>(sources: &[ArchiveSource], sink: W) -> io::Result<usize> {
    let mut entries = EntrySet::default();
    write_entries(sources, sink, &mut entries)?;
    Ok(entries.files)
}

fn write_entries<W: Write>(
    sources: &[ArchiveSource],
    sink: W,
    entries: &mut EntrySet,
) -> io::Result<()> {
    let mut zip = ZipWriter::new_stream(sink);
    for source in sources {
        if source.is_dir {
            add_tree(&mut zip, &source.path, &source.name, entries)?;
        } else {
            add_file(&mut zip, &source.path, &source.name, entries)?;
        }
    }
    let mut sink = zip.finish().map_err(zip_error)?;
    sink.flush()
}

/// 由阻塞线程生成归档流。流被丢弃后，下一次写入失败，线程不再读取后续文件。
pub fn stream_archive(sources: Vec<ArchiveSource>) -> impl Stream<Item = io::Result<Bytes>> {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(ARCHIVE_CHANNEL_DEPTH);
    spawn_archive_worker(sources, tx);
    futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
}

/// 在阻塞线程中写归档；返回已打开的文件数与结束原因。
fn spawn_archive_worker(
    sources: Vec<ArchiveSource>,
    tx: mpsc::Sender<io::Result<Bytes>>,
) -> JoinHandle<(usize, io::Result<()>)> {
    tokio::task::spawn_blocking(move || {
        let sink = BufWriter::with_capacity(ARCHIVE_FRAME_SIZE, ChannelWriter { tx: tx.clone() });
        let mut entries = EntrySet::default();
        let result = write_entries(&sources, sink, &mut entries);
        match &result {
            Ok(()) => debug!(files = entries.files, "archive stream finished"),
            Err(err) if err.kind() == ErrorKind::BrokenPipe => {
                debug!(files = entries.files, "archive download cancelled by client");
            }
            Err(err) => {
                warn!(error = %err, files = entries.files, "archive stream aborted");
                let _ = tx.blocking_send(Err(io::Error::new(err.kind(), err.to_string())));
            }
        }
        (entries.files, result)
    })
}

struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(ErrorKind::BrokenPipe, "archive receiver closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// 显式栈深度优先遍历，按名称顺序访问条目。
fn add_tree<Z: Write + Seek>(
    zip: &mut ZipWriter<Z>,
    root: &Path,
    root_name: &str,
    entries: &mut EntrySet,
) -> io::Result<()> {
    let mut pending = vec![(root.to_path_buf(), root_name.to_string())];
    while let Some((dir, prefix)) = pending.pop() {
        let dir_entry = format!("{prefix}/");
        if entries.names.insert(dir_entry.clone()) {
            zip.add_directory(dir_entry, entry_options(&dir, false))
                .map_err(zip_error)?;
        }

        let mut children = match std::fs::read_dir(&dir) {
            Ok(iter) => iter.collect::<io::Result<Vec<_>>>()?,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        children.sort_by_key(|entry| entry.file_name());

        let mut subdirs = Vec::new();
        for entry in children {
            let file_type = entry.file_type()?;
            let name = format!("{prefix}/{}", entry.file_name().to_string_lossy());
            if file_type.is_symlink() {
                debug!(path = ?entry.path(), "skip symlink in archive");
            } else if file_type.is_dir() {
                subdirs.push((entry.path(), name));
            } else if file_type.is_file() {
                add_file(zip, &entry.path(), &name, entries)?;
            }
        }
        pending.extend(subdirs.into_iter().rev());
    }
    Ok(())
}

fn add_file<Z: Write + Seek>(
    zip: &mut ZipWriter<Z>,
    path: &Path,
    name: &str,
    entries: &mut EntrySet,
) -> io::Result<()> {
    if entries.names.contains(name) {
        debug!(name, "skip duplicate archive entry");
        return Ok(());
    }
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!(path = ?path, "file vanished before archiving");
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    let large = file.metadata()?.len() >= u64::from(u32::MAX);
    zip.start_file(name.to_string(), entry_options(path, large))
        .map_err(zip_error)?;
    entries.names.insert(name.to_string());
    entries.files += 1;
    io::copy(&mut file, zip)?;
    Ok(())
}

fn entry_options(path: &Path, large: bool) -> SimpleFileOptions {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(9))
        .large_file(large);
    match std::fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(zip_timestamp)
    {
        Some(modified) => options.last_modified_time(modified),
        None => options,
    }
}

fn zip_timestamp(time: SystemTime) -> Option<ZipDateTime> {
    let local: DateTime<Local> = time.into();
    ZipDateTime::from_date_and_time(
        u16::try_from(local.year()).ok()?,
        local.month() as u8,
        local.day() as u8,
        local.hour() as u8,
        local.minute() as u8,
        local.second() as u8,
    )
    .ok()
}

fn zip_error(err: zip::result::ZipError) -> io::Error {
    match err {
        zip::result::ZipError::Io(err) => err,
        other => io::Error::other(other),
    }
}
