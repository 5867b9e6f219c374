use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::Attachment;
use courier_store::{attachment_key, ObjectStore, StoreError};
use thiserror::Error;
use tracing::debug;

use crate::attachment_store::AttachmentStore;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl UploadError {
    /// Bad keys and missing objects will fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            UploadError::Store(StoreError::InvalidKey(_) | StoreError::NotFound(_))
        )
    }
}

/// Progress channel handed to an [`Uploader`] for one attachment.
///
/// Holds the store weakly and is tagged with its generation, so reports from
/// an upload that outlived its store go nowhere.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    store: Weak<AttachmentStore>,
    generation: u64,
    attachment_id: String,
}

impl ProgressSink {
    pub fn new(store: &Arc<AttachmentStore>, attachment_id: impl Into<String>) -> Self {
        Self {
            store: Arc::downgrade(store),
            generation: store.generation(),
            attachment_id: attachment_id.into(),
        }
    }

    pub fn attachment_id(&self) -> &str {
        &self.attachment_id
    }

    pub fn report(&self, percent: u8) {
        let Some(store) = self.store.upgrade() else {
            return;
        };
        if store.generation() != self.generation || store.is_disposed() {
            return;
        }
        // Late reports after the attachment left `uploading` are dropped by the store.
        let _ = store.set_progress(&self.attachment_id, percent);
    }
}

/// Moves attachment bytes to durable storage and returns where they landed.
#[async_trait]
pub trait Uploader: Send + Sync {
    fn name(&self) -> &str;

    async fn upload(
        &self,
        attachment: &Attachment,
        data: Bytes,
        progress: ProgressSink,
    ) -> Result<String, UploadError>;

    /// Drop an object this uploader stored earlier. Backends that keep
    /// nothing of their own have nothing to do.
    async fn discard(&self, storage_path: &str) -> Result<(), UploadError> {
        let _ = storage_path;
        Ok(())
    }
}

/// Uploads into an [`ObjectStore`] under the composition's attachment prefix.
pub struct StoreUploader {
    store: Arc<dyn ObjectStore>,
    composition_id: String,
}

impl StoreUploader {
    pub fn new(store: Arc<dyn ObjectStore>, composition_id: impl Into<String>) -> Self {
        Self {
            store,
            composition_id: composition_id.into(),
        }
    }
}

#[async_trait]
impl Uploader for StoreUploader {
    fn name(&self) -> &str {
        self.store.name()
    }

    async fn upload(
        &self,
        attachment: &Attachment,
        data: Bytes,
        progress: ProgressSink,
    ) -> Result<String, UploadError> {
        let key = attachment_key(&self.composition_id, &attachment.id, &attachment.name);
        debug!(
            "putting {} bytes for {} at {key} via {}",
            data.len(),
            attachment.id,
            self.store.name()
        );
        progress.report(0);
        self.store.put(&key, data).await?;
        progress.report(100);
        Ok(key)
    }

    async fn discard(&self, storage_path: &str) -> Result<(), UploadError> {
        debug!("deleting {storage_path} via {}", self.store.name());
        self.store.delete(storage_path).await?;
        Ok(())
    }
}
