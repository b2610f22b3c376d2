//! AxoSync 服务端程序。
//!
//! 局域网文件服务：在单一存储根目录上提供列表、整文件与分片上传、
//! 带实时 zip 打包的下载以及文件夹管理。
//! 入口负责打开存储与上传临时区、构建 Axum 路由并启动 HTTP（可选 HTTPS）监听。

mod archive;
mod atomic;
mod background;
mod chunks;
mod config;
mod error;
mod etag;
mod files;
mod http;
mod locking;
mod logging;
mod merge;
mod names;
mod routes;
mod session;
mod storage;
mod tls;
mod upload;

use axum_server::Handle;
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, info};

use crate::background::spawn_background_tasks;
use crate::chunks::ChunkStore;
use crate::config::{Args, DEFAULT_LOCK_WAIT_TIMEOUT_SECS};
use crate::session::SessionRegistry;
use crate::storage::Storage;
use crate::upload::UploadConfig;

/// 启动 AxoSync 服务并阻塞直到关闭。
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage = Arc::new(Storage::open(&args.storage_dir).await?);
    let chunk_store = ChunkStore::new(args.resolve_temp_dir());
    chunk_store.ensure_root().await?;
    info!(root = ?storage.root_path(), "storage ready");
    info!(temp = ?chunk_store.root_path(), "upload temp area ready");

    let registry = Arc::new(SessionRegistry::new(
        chunk_store,
        Duration::from_secs(DEFAULT_LOCK_WAIT_TIMEOUT_SECS),
    ));
    let upload_config = Arc::new(UploadConfig {
        max_file_size: args.max_file_size,
        chunk_max_size: args.chunk_max_size,
        max_chunks: args.upload_max_chunks,
        temp_ttl: Duration::from_secs(args.upload_temp_ttl_secs),
    });

    let app = routes::build_router(
        storage,
        registry.clone(),
        upload_config.clone(),
        Path::new(&args.public_dir),
        args.cors_origins.as_deref(),
    );

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!("🚀 Starting HTTP server at {}", http_addr);
    log_lan_address("http", args.port);

    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(app.clone().into_make_service_with_connect_info::<SocketAddr>());

    let https_server = match args.https_port {
        Some(port) => {
            let https_addr = SocketAddr::new(host, port);
            let tls_config = tls::build_rustls_config(
                args.tls_cert.as_deref(),
                args.tls_key.as_deref(),
                host,
            )
            .await?;
            info!("🔒 Starting HTTPS server at {}", https_addr);
            log_lan_address("https", port);
            let server = axum_server::bind_rustls(https_addr, tls_config)
                .handle(handle.clone())
                .serve(app.into_make_service_with_connect_info::<SocketAddr>());
            Some(server)
        }
        None => None,
    };

    spawn_background_tasks(registry, upload_config);
    tokio::select! {
        result = http_server => result?,
        result = async move {
            match https_server {
                Some(server) => server.await,
                None => std::future::pending().await,
            }
        } => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

/// 输出局域网内其他设备可访问的地址。
fn log_lan_address(scheme: &str, port: u16) {
    match lan_address() {
        Some(ip) => info!("📡 LAN address: {scheme}://{ip}:{port}"),
        None => debug!("no LAN address detected"),
    }
}

/// 取系统出站路由使用的本机地址。UDP connect 只选择路由，不发送数据包。
fn lan_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_loopback() && !ip.is_unspecified()).then_some(ip)
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
