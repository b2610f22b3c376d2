//! TLS 证书加载与自签名生成。

use axum_server::tls_rustls::RustlsConfig;
use rcgen::generate_simple_self_signed;
use std::io::{self, ErrorKind};
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::fs;
use tracing::info;

/// 构建 Rustls 配置：使用给定的 PEM 证书与私钥，二者都未提供时生成自签名证书。
pub async fn build_rustls_config(
    cert: Option<&str>,
    key: Option<&str>,
    host: IpAddr,
) -> io::Result<RustlsConfig> {
    let (cert_path, key_path) = pem_paths(cert, key, host).await?;
    let cert = fs::read(&cert_path).await?;
    let key = fs::read(&key_path).await?;
    RustlsConfig::from_pem(cert, key).await
}

async fn pem_paths(
    cert: Option<&str>,
    key: Option<&str>,
    host: IpAddr,
) -> io::Result<(PathBuf, PathBuf)> {
    match (cert, key) {
        (Some(cert), Some(key)) => Ok((PathBuf::from(cert), PathBuf::from(key))),
        (None, None) => generate_self_signed(host).await,
        _ => Err(io::Error::new(
            ErrorKind::InvalidInput,
            "--tls-cert and --tls-key must be given together",
        )),
    }
}

/// 生成自签名证书并返回文件路径。
async fn generate_self_signed(host: IpAddr) -> io::Result<(PathBuf, PathBuf)> {
    let mut names = vec!["localhost".to_string()];
    if !host.is_unspecified() {
        names.push(host.to_string());
    }
    let cert =
        generate_simple_self_signed(names).map_err(|err| io::Error::other(err.to_string()))?;
    let cert_path = std::env::temp_dir().join("axo-sync-cert.pem");
    let key_path = std::env::temp_dir().join("axo-sync-key.pem");
    fs::write(&cert_path, cert.cert.pem()).await?;
    fs::write(&key_path, cert.key_pair.serialize_pem()).await?;
    info!(path = ?cert_path, "generated self-signed cert");
    Ok((cert_path, key_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn half_configured_tls_is_rejected() {
        let host = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let err = pem_paths(Some("cert.pem"), None, host)
            .await
            .expect_err("missing key");
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        let err = pem_paths(None, Some("key.pem"), host)
            .await
            .expect_err("missing cert");
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn supplied_paths_are_used_as_is() {
        let host = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let (cert, key) = pem_paths(Some("/etc/axo/cert.pem"), Some("/etc/axo/key.pem"), host)
            .await
            .expect("paths");
        assert_eq!(cert, PathBuf::from("/etc/axo/cert.pem"));
        assert_eq!(key, PathBuf::from("/etc/axo/key.pem"));
    }
}
