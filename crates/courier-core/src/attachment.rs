use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentStatus {
    Pending,
    Uploading,
    Uploaded,
    Sending,
    Sent,
    Processing,
    Error,
}

impl AttachmentStatus {
    pub const ALL: &[AttachmentStatus] = &[
        AttachmentStatus::Pending,
        AttachmentStatus::Uploading,
        AttachmentStatus::Uploaded,
        AttachmentStatus::Sending,
        AttachmentStatus::Sent,
        AttachmentStatus::Processing,
        AttachmentStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentStatus::Pending => "pending",
            AttachmentStatus::Uploading => "uploading",
            AttachmentStatus::Uploaded => "uploaded",
            AttachmentStatus::Sending => "sending",
            AttachmentStatus::Sent => "sent",
            AttachmentStatus::Processing => "processing",
            AttachmentStatus::Error => "error",
        }
    }

    /// States reachable from `self` in a single step.
    pub fn allowed_next(&self) -> &'static [AttachmentStatus] {
        use AttachmentStatus::*;
        match self {
            Pending => &[Uploading, Error],
            Uploading => &[Uploaded, Error],
            Uploaded => &[Sending, Error],
            Sending => &[Sent, Error],
            Sent => &[],
            Error => &[Pending, Uploading],
            Processing => &[Uploaded, Error],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_next().is_empty()
    }

    /// Removal is refused while the attachment is in flight or delivered.
    pub fn is_locked(&self) -> bool {
        matches!(self, AttachmentStatus::Sending | AttachmentStatus::Sent)
    }
}

impl fmt::Display for AttachmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `from -> to` is a legal lifecycle step. Self-transitions are never legal.
pub fn can_transition(from: AttachmentStatus, to: AttachmentStatus) -> bool {
    from.allowed_next().contains(&to)
}

/// A user-selected file before it enters a store.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub name: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub source: Bytes,
}

impl FileMeta {
    /// Build metadata whose size is taken from the bytes themselves.
    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, source: Bytes) -> Self {
        Self {
            name: name.into(),
            size_bytes: source.len() as u64,
            mime_type: mime_type.into(),
            source,
        }
    }

    pub fn extension(&self) -> Option<String> {
        extension_of(&self.name)
    }
}

/// Snapshot of one attachment. The raw bytes stay with the owning store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub name: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub status: AttachmentStatus,
    #[serde(default)]
    pub storage_path: Option<String>,
    #[serde(default)]
    pub upload_progress: u8,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Attachment {
    pub fn new(meta: &FileMeta) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: meta.name.clone(),
            size_bytes: meta.size_bytes,
            mime_type: meta.mime_type.clone(),
            status: AttachmentStatus::Pending,
            storage_path: None,
            upload_progress: 0,
            retry_count: 0,
            error_detail: None,
            created_at: Utc::now(),
        }
    }

    pub fn extension(&self) -> Option<String> {
        extension_of(&self.name)
    }

    /// Move to `to` and apply whichever patch fields belong to that state.
    ///
    /// Callers must have checked `can_transition` already.
    pub fn apply(&mut self, to: AttachmentStatus, patch: AttachmentPatch) {
        self.status = to;
        match to {
            AttachmentStatus::Uploading => {
                self.upload_progress = patch.upload_progress.unwrap_or(0).min(100);
                self.error_detail = None;
            }
            AttachmentStatus::Uploaded => {
                if let Some(path) = patch.storage_path {
                    self.storage_path = Some(path);
                }
                self.upload_progress = 100;
                self.error_detail = None;
            }
            AttachmentStatus::Error => {
                self.error_detail = Some(
                    patch
                        .error_detail
                        .unwrap_or_else(|| "unknown error".to_string()),
                );
            }
            _ => {
                self.error_detail = None;
            }
        }
    }
}

/// Optional fields accompanying a status change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentPatch {
    pub storage_path: Option<String>,
    pub error_detail: Option<String>,
    pub upload_progress: Option<u8>,
}

impl AttachmentPatch {
    pub fn storage_path(path: impl Into<String>) -> Self {
        Self {
            storage_path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            error_detail: Some(detail.into()),
            ..Default::default()
        }
    }
}

fn extension_of(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    use AttachmentStatus::{Error, Pending, Processing, Sending, Sent, Uploaded, Uploading};

    const TABLE: &[(AttachmentStatus, AttachmentStatus)] = &[
        (Pending, Uploading),
        (Pending, Error),
        (Uploading, Uploaded),
        (Uploading, Error),
        (Uploaded, Sending),
        (Uploaded, Error),
        (Sending, Sent),
        (Sending, Error),
        (Error, Pending),
        (Error, Uploading),
        (Processing, Uploaded),
        (Processing, Error),
    ];

    #[test]
    fn listed_transitions_are_allowed() {
        for (from, to) in TABLE {
            assert!(can_transition(*from, *to), "{from} -> {to} should be legal");
        }
    }

    #[test]
    fn every_unlisted_pair_is_rejected() {
        for from in AttachmentStatus::ALL {
            for to in AttachmentStatus::ALL {
                if TABLE.contains(&(*from, *to)) {
                    continue;
                }
                assert!(!can_transition(*from, *to), "{from} -> {to} should be illegal");
            }
        }
    }

    #[test]
    fn sent_is_the_only_terminal_state() {
        for s in AttachmentStatus::ALL {
            assert_eq!(s.is_terminal(), *s == AttachmentStatus::Sent);
            assert!(!can_transition(AttachmentStatus::Sent, *s));
        }
    }

    #[test]
    fn self_transitions_are_rejected() {
        for s in AttachmentStatus::ALL {
            assert!(!can_transition(*s, *s));
        }
    }

    #[test]
    fn status_display_matches_wire_name() {
        for s in AttachmentStatus::ALL {
            assert_eq!(format!("{s}"), s.as_str());
            let parsed: AttachmentStatus =
                serde_json::from_str(&format!("\"{}\"", s.as_str())).unwrap();
            assert_eq!(parsed, *s);
        }
        assert!(serde_json::from_str::<AttachmentStatus>("\"done\"").is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&AttachmentStatus::Uploading).unwrap();
        assert_eq!(json, "\"uploading\"");
    }

    #[test]
    fn extension_is_lowercased() {
        let meta = FileMeta::from_bytes("Report.PDF", "application/pdf", Bytes::from_static(b"x"));
        assert_eq!(meta.extension().as_deref(), Some("pdf"));
        assert_eq!(meta.size_bytes, 1);
    }

    #[test]
    fn extension_missing_or_dotfile() {
        assert_eq!(extension_of("README"), None);
        assert_eq!(extension_of(".env"), None);
        assert_eq!(extension_of("trailing."), None);
        assert_eq!(extension_of("a.tar.gz").as_deref(), Some("gz"));
    }

    #[test]
    fn apply_uploaded_sets_path_and_clears_error() {
        let meta = FileMeta::from_bytes("a.pdf", "application/pdf", Bytes::new());
        let mut att = Attachment::new(&meta);
        att.apply(AttachmentStatus::Error, AttachmentPatch::error("boom"));
        assert_eq!(att.error_detail.as_deref(), Some("boom"));

        att.apply(AttachmentStatus::Uploading, AttachmentPatch::default());
        assert!(att.error_detail.is_none());

        att.apply(AttachmentStatus::Uploaded, AttachmentPatch::storage_path("c/1/a.pdf"));
        assert_eq!(att.storage_path.as_deref(), Some("c/1/a.pdf"));
        assert_eq!(att.upload_progress, 100);
    }

    #[test]
    fn apply_ignores_storage_path_outside_uploaded() {
        let meta = FileMeta::from_bytes("a.pdf", "application/pdf", Bytes::new());
        let mut att = Attachment::new(&meta);
        att.apply(AttachmentStatus::Uploading, AttachmentPatch::storage_path("nope"));
        assert!(att.storage_path.is_none());
    }

    #[test]
    fn new_attachment_starts_pending() {
        let meta = FileMeta::from_bytes("a.png", "image/png", Bytes::from_static(b"12"));
        let att = Attachment::new(&meta);
        assert_eq!(att.status, AttachmentStatus::Pending);
        assert_eq!(att.retry_count, 0);
        assert_eq!(att.size_bytes, 2);
        assert!(uuid::Uuid::parse_str(&att.id).is_ok());
    }
}
