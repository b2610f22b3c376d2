//! 命令行参数与服务配置默认值。

use clap::Parser;
use std::path::{Path, PathBuf};

pub const UPLOAD_TEMP_DIR: &str = ".axo/temp";
pub const INCOMING_DIR: &str = ".incoming";
pub const SESSION_META_FILE: &str = "session.json";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024 * 1024;
pub const DEFAULT_CHUNK_MAX_SIZE: u64 = 64 * 1024 * 1024;
pub const DEFAULT_UPLOAD_MAX_CHUNKS: u64 = 8192;
pub const DEFAULT_UPLOAD_TEMP_TTL_SECS: u64 = 24 * 60 * 60;
pub const UPLOAD_CLEAN_INTERVAL_SECS: u64 = 900;
pub const DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 30;
pub const ARCHIVE_FRAME_SIZE: usize = 64 * 1024;

/// 服务的命令行参数与环境变量配置。
#[derive(Parser, Debug)]
#[command(name = "axo-sync", version, about = "AxoSync LAN file server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "AXO_STORAGE_DIR",
        default_value = "./storage",
        help = "Storage root directory"
    )]
    pub storage_dir: String,
    #[arg(
        short = 't',
        long,
        env = "AXO_TEMP_DIR",
        help = "Upload temp directory (defaults to .axo/temp next to the storage root)"
    )]
    pub temp_dir: Option<String>,
    #[arg(
        long,
        env = "AXO_PUBLIC_DIR",
        default_value = "public",
        help = "Static client bundle directory"
    )]
    pub public_dir: String,
    #[arg(
        short = 'H',
        long,
        env = "AXO_HOST",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "AXO_PORT",
        default_value_t = DEFAULT_PORT,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        short = 'P',
        long,
        env = "AXO_HTTPS_PORT",
        help = "HTTPS port (HTTPS is disabled when unset)"
    )]
    pub https_port: Option<u16>,
    #[arg(short = 'c', long, env = "AXO_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "AXO_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(long, env = "AXO_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "AXO_MAX_FILE_SIZE",
        default_value_t = DEFAULT_MAX_FILE_SIZE,
        help = "Max size of a single uploaded file in bytes (0 to disable)"
    )]
    pub max_file_size: u64,
    #[arg(
        long,
        env = "AXO_CHUNK_MAX_SIZE",
        default_value_t = DEFAULT_CHUNK_MAX_SIZE,
        help = "Max size of a single upload chunk in bytes (0 to disable)"
    )]
    pub chunk_max_size: u64,
    #[arg(
        long,
        env = "AXO_UPLOAD_MAX_CHUNKS",
        default_value_t = DEFAULT_UPLOAD_MAX_CHUNKS,
        help = "Max chunks per upload (0 to disable)"
    )]
    pub upload_max_chunks: u64,
    #[arg(
        long,
        env = "AXO_UPLOAD_TEMP_TTL_SECS",
        default_value_t = DEFAULT_UPLOAD_TEMP_TTL_SECS,
        help = "Abandoned upload cleanup threshold in seconds (0 to disable)"
    )]
    pub upload_temp_ttl_secs: u64,
}

impl Args {
    /// 计算上传临时目录：显式配置优先，否则位于存储目录旁的 `.axo/temp`。
    pub fn resolve_temp_dir(&self) -> PathBuf {
        match &self.temp_dir {
            Some(dir) => PathBuf::from(dir),
            None => default_temp_dir(Path::new(&self.storage_dir)),
        }
    }
}

/// 返回存储目录同级的默认临时目录。
pub fn default_temp_dir(storage_dir: &Path) -> PathBuf {
    match storage_dir.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(UPLOAD_TEMP_DIR),
        _ => PathBuf::from(UPLOAD_TEMP_DIR),
    }
}
