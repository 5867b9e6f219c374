use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::attachment::FileMeta;
use crate::error::ValidationError;

pub const DEFAULT_MAX_SIZE_BYTES: u64 = 20 * 1024 * 1024;

/// (extension, mime type) pairs accepted by document ingestion.
const DEFAULT_TYPES: &[(&str, &str)] = &[
    ("pdf", "application/pdf"),
    ("csv", "text/csv"),
    ("txt", "text/plain"),
    ("xlsx", "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
    ("xls", "application/vnd.ms-excel"),
    ("docx", "application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
    ("doc", "application/msword"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("webp", "image/webp"),
    ("gif", "image/gif"),
];

/// Size and type constraints a file must satisfy before upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllowList {
    pub allowed_mime_types: BTreeSet<String>,
    pub allowed_extensions: BTreeSet<String>,
    pub max_size_bytes: u64,
}

impl Default for AllowList {
    fn default() -> Self {
        Self {
            allowed_mime_types: DEFAULT_TYPES.iter().map(|(_, m)| m.to_string()).collect(),
            allowed_extensions: DEFAULT_TYPES.iter().map(|(e, _)| e.to_string()).collect(),
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
        }
    }
}

impl AllowList {
    pub fn new<M, E>(mime_types: M, extensions: E, max_size_bytes: u64) -> Self
    where
        M: IntoIterator,
        M::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        Self {
            allowed_mime_types: mime_types
                .into_iter()
                .map(|m| m.as_ref().trim().to_ascii_lowercase())
                .collect(),
            allowed_extensions: extensions
                .into_iter()
                .map(|e| e.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            max_size_bytes,
        }
    }

    pub fn with_max_size(mut self, max_size_bytes: u64) -> Self {
        self.max_size_bytes = max_size_bytes;
        self
    }

    pub fn allows_mime(&self, mime_type: &str) -> bool {
        // Parameters such as "; charset=utf-8" do not affect the decision.
        let essence = mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        self.allowed_mime_types.contains(&essence)
    }

    pub fn allows_extension(&self, extension: &str) -> bool {
        self.allowed_extensions
            .contains(&extension.trim_start_matches('.').to_ascii_lowercase())
    }

    /// Check size, then mime type, then extension. Both type checks must pass.
    pub fn validate(&self, meta: &FileMeta) -> Result<(), ValidationError> {
        if meta.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if meta.size_bytes > self.max_size_bytes {
            return Err(ValidationError::TooLarge {
                name: meta.name.clone(),
                size_bytes: meta.size_bytes,
                max_bytes: self.max_size_bytes,
            });
        }
        if !self.allows_mime(&meta.mime_type) {
            return Err(ValidationError::MimeTypeNotAllowed {
                name: meta.name.clone(),
                mime_type: meta.mime_type.clone(),
            });
        }
        let extension = meta.extension().unwrap_or_default();
        if !self.allows_extension(&extension) {
            return Err(ValidationError::ExtensionNotAllowed {
                name: meta.name.clone(),
                extension,
            });
        }
        Ok(())
    }
}

/// Best-effort mime type for a file name, falling back to octet-stream.
pub fn mime_for_name(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    DEFAULT_TYPES
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, m)| *m)
        .unwrap_or("application/octet-stream")
}
