use std::path::{Path, PathBuf};

use anyhow::Context;
use axum::async_trait;
use bytes::Bytes;
use time::OffsetDateTime;

use crate::error::ApiError;

/// Persists uploaded attachments by stored filename.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn save(&self, filename: &str, body: Bytes) -> anyhow::Result<()>;
    async fn remove(&self, filename: &str) -> anyhow::Result<()>;
}

/// Local-disk store backing the statically served uploads directory.
#[derive(Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub async fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("create uploads dir {}", root.display()))?;
        Ok(Self { root })
    }
}

#[async_trait]
impl AttachmentStore for DiskStore {
    async fn save(&self, filename: &str, body: Bytes) -> anyhow::Result<()> {
        let path = self.root.join(filename);
        tokio::fs::write(&path, &body)
            .await
            .with_context(|| format!("write attachment {}", path.display()))?;
        Ok(())
    }

    async fn remove(&self, filename: &str) -> anyhow::Result<()> {
        let path = self.root.join(filename);
        tokio::fs::remove_file(&path)
            .await
            .with_context(|| format!("remove attachment {}", path.display()))?;
        Ok(())
    }
}

/// A validated upload ready to be persisted and referenced from a task.
#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub stored_name: String,
    pub body: Bytes,
}

/// Images and common document formats only.
const ALLOWED_TYPES: &[(&str, &[&str])] = &[
    ("jpeg", &["image/jpeg"]),
    ("jpg", &["image/jpeg"]),
    ("png", &["image/png"]),
    ("pdf", &["application/pdf"]),
    ("doc", &["application/msword"]),
    (
        "docx",
        &["application/vnd.openxmlformats-officedocument.wordprocessingml.document"],
    ),
];

pub fn validate_attachment(
    original_name: &str,
    content_type: &str,
    size: usize,
    max_bytes: usize,
) -> Result<(), ApiError> {
    if size > max_bytes {
        return Err(ApiError::Validation(format!(
            "File too large: limit is {} bytes",
            max_bytes
        )));
    }
    let ext = Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    let allowed = ALLOWED_TYPES
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, mimes)| mimes.contains(&content_type))
        .unwrap_or(false);
    if !allowed {
        return Err(ApiError::Validation(
            "Only images and documents are allowed".into(),
        ));
    }
    Ok(())
}

/// Collision-resistant stored name: millisecond timestamp prefix plus the
/// sanitized original basename. Path components in the client-supplied name
/// are stripped.
pub fn stored_filename(original_name: &str, now: OffsetDateTime) -> String {
    let base = Path::new(original_name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let safe: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let millis = now.unix_timestamp_nanos() / 1_000_000;
    format!("{}-{}", millis, safe)
}
