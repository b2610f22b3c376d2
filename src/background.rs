//! 上传临时区清理的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::UPLOAD_CLEAN_INTERVAL_SECS;
use crate::session::SessionRegistry;
use crate::upload::UploadConfig;

/// 启动后台任务（定期清理被放弃的上传会话）。TTL 为 0 时不启动。
pub fn spawn_background_tasks(registry: Arc<SessionRegistry>, upload: Arc<UploadConfig>) {
    if upload.temp_ttl.is_zero() {
        info!("upload temp sweep disabled");
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(UPLOAD_CLEAN_INTERVAL_SECS));
        loop {
            interval.tick().await;
            match registry.sweep_stale(upload.temp_ttl).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "upload temp sweep finished"),
                Err(err) => warn!(error = %err, "upload temp cleanup failed"),
            }
        }
    });
}
