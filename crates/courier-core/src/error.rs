use thiserror::Error;

use crate::attachment::AttachmentStatus;

/// Why a file was refused before it could enter a store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("file name is empty")]
    EmptyName,

    #[error("{name} is {size_bytes} bytes, limit is {max_bytes}")]
    TooLarge {
        name: String,
        size_bytes: u64,
        max_bytes: u64,
    },

    #[error("{name}: mime type '{mime_type}' is not allowed")]
    MimeTypeNotAllowed { name: String, mime_type: String },

    #[error("{name}: extension '{extension}' is not allowed")]
    ExtensionNotAllowed { name: String, extension: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttachmentError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("attachment {id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: AttachmentStatus,
        to: AttachmentStatus,
    },

    #[error("attachment {id} is {status} and cannot be removed")]
    Conflict { id: String, status: AttachmentStatus },

    #[error("attachment {0} has no storage path")]
    MissingStoragePath(String),

    #[error("file data for attachment {0} is no longer available")]
    SourceUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("attachment store has been disposed")]
    Disposed,
}

impl AttachmentError {
    pub fn invalid_transition(
        id: impl Into<String>,
        from: AttachmentStatus,
        to: AttachmentStatus,
    ) -> Self {
        Self::InvalidTransition {
            id: id.into(),
            from,
            to,
        }
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self, AttachmentError::Disposed)
    }
}
