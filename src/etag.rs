//! ETag 计算与 If-Range 判定。

use axum::http::{HeaderMap, header};
use httpdate::parse_http_date;
use std::fs::Metadata;
use std::time::{SystemTime, UNIX_EPOCH};

/// 根据文件元数据生成弱 ETag。
pub fn etag_from_metadata(metadata: &Metadata) -> String {
    let size = metadata.len();
    let modified = metadata.modified().ok();
    if let Some(modified) = modified
        && let Ok(duration) = modified.duration_since(UNIX_EPOCH)
    {
        return format!(
            "W/\"{}-{}-{}\"",
            size,
            duration.as_secs(),
            duration.subsec_nanos()
        );
    }
    format!("W/\"{}\"", size)
}

/// 判断是否可以按 `Range` 响应。没有 `If-Range` 时总是可以；
/// 否则校验值须与当前 ETag 相同，或是不早于文件修改时间的 HTTP 日期。
pub fn if_range_matches(headers: &HeaderMap, etag: &str, modified: Option<SystemTime>) -> bool {
    let Some(value) = headers
        .get(header::IF_RANGE)
        .and_then(|value| value.to_str().ok())
    else {
        return true;
    };
    let value = value.trim();
    if value.starts_with('"') || value.starts_with("W/") {
        return value == etag;
    }
    match (parse_http_date(value), modified) {
        // HTTP 日期精度为秒。
        (Ok(date), Some(modified)) => modified
            .duration_since(UNIX_EPOCH)
            .ok()
            .zip(date.duration_since(UNIX_EPOCH).ok())
            .is_some_and(|(modified, date)| modified.as_secs() <= date.as_secs()),
        _ => false,
    }
}
