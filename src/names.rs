//! 文件名、目录名与上传 ID 的校验和解码。

use chrono::{DateTime, Utc};

const FORBIDDEN_CHARS: [char; 9] = ['<', '>', ':', '"', '|', '?', '*', '\\', '/'];
const MAX_NAME_BYTES: usize = 255;
const GENERATED_ID_BASE_BYTES: usize = 200;

/// 名称被拒绝的原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameIssue {
    Empty,
    InvalidCharacters,
}

/// 校验单个文件名或目录名（不是路径）。
pub fn validate_name(name: &str) -> Result<(), NameIssue> {
    if name.trim().is_empty() {
        return Err(NameIssue::Empty);
    }
    if name == "." || name == ".." {
        return Err(NameIssue::InvalidCharacters);
    }
    if name
        .chars()
        .any(|ch| FORBIDDEN_CHARS.contains(&ch) || ch.is_control())
    {
        return Err(NameIssue::InvalidCharacters);
    }
    Ok(())
}

/// 上传 ID 同时用作临时区中的目录名。
pub fn is_valid_upload_id(id: &str) -> bool {
    validate_name(id).is_ok() && !id.starts_with('.') && id.len() <= MAX_NAME_BYTES
}

/// 由文件名与当前时间生成上传 ID：`<fileName>-<毫秒时间戳>`。
pub fn generate_upload_id(file_name: &str, now: DateTime<Utc>) -> String {
    let base = truncate_to_boundary(file_name.trim_start_matches('.'), GENERATED_ID_BASE_BYTES);
    let base = if base.is_empty() { "upload" } else { base };
    format!("{base}-{}", now.timestamp_millis())
}

fn truncate_to_boundary(value: &str, max_bytes: usize) -> &str {
    if value.len() <= max_bytes {
        return value;
    }
    let mut end = max_bytes;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// 修复以 latin-1 误解码的 UTF-8 文件名；其他名称原样返回。
pub fn decode_upload_name(name: &str) -> String {
    if name.is_ascii() || name.chars().any(|ch| ch as u32 > 0xFF) {
        return name.to_string();
    }
    let bytes: Vec<u8> = name.chars().map(|ch| ch as u8).collect();
    match String::from_utf8(bytes) {
        Ok(decoded) => decoded,
        Err(_) => name.to_string(),
    }
}
