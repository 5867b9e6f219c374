use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use courier_core::{Attachment, AttachmentError, AttachmentStatus, FileMeta};
use tracing::info;

use crate::attachment_store::AttachmentStore;
use crate::config::PipelineConfig;
use crate::coordinator::{UploadCoordinator, UploadSummary};
use crate::gate::{DeliveryError, DeliveryGate};
use crate::notify::{NotificationStream, Notifier};
use crate::uploader::Uploader;

/// One message or form together with its attachments.
///
/// Dropping a `Composition` disposes its store, which abandons any uploads
/// still in flight.
pub struct Composition {
    store: Arc<AttachmentStore>,
    coordinator: UploadCoordinator,
    gate: DeliveryGate,
    notifier: Notifier,
}

impl Composition {
    pub fn new(id: impl Into<String>, config: &PipelineConfig) -> Self {
        let notifier = Notifier::default();
        let store = Arc::new(AttachmentStore::new(id, config.allow_list.clone()));
        let coordinator = UploadCoordinator::new(store.clone(), config, notifier.clone());
        let gate = DeliveryGate::new(store.clone(), notifier.clone());
        info!(
            "opened composition {} (generation {})",
            store.composition_id(),
            store.generation()
        );
        Self {
            store,
            coordinator,
            gate,
            notifier,
        }
    }

    pub fn id(&self) -> &str {
        self.store.composition_id()
    }

    pub fn store(&self) -> &Arc<AttachmentStore> {
        &self.store
    }

    pub fn notifications(&self) -> NotificationStream {
        self.notifier.subscribe()
    }

    pub fn add(&self, meta: FileMeta) -> Result<Attachment, AttachmentError> {
        self.store.add(meta)
    }

    /// Remove an attachment, deleting its uploaded object if it has one.
    pub async fn remove(
        &self,
        id: &str,
        uploader: &dyn Uploader,
    ) -> Result<Attachment, AttachmentError> {
        self.coordinator.remove(id, uploader).await
    }

    /// Drop every attachment that is not yet sent, deleting uploaded objects.
    pub async fn discard_unsent(&self, uploader: &dyn Uploader) -> usize {
        let ids = self.store.ids_with_status(&[
            AttachmentStatus::Pending,
            AttachmentStatus::Uploaded,
            AttachmentStatus::Error,
        ]);
        let mut removed = 0;
        for id in &ids {
            if self.remove(id, uploader).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }

    pub fn attachment_ids(&self) -> Vec<String> {
        self.store.list().into_iter().map(|a| a.id).collect()
    }

    pub async fn upload_pending(&self, uploader: Arc<dyn Uploader>) -> UploadSummary {
        self.coordinator.upload_pending(uploader).await
    }

    pub async fn retry_failed(&self, uploader: Arc<dyn Uploader>) -> UploadSummary {
        let failed = self.store.ids_with_status(&[AttachmentStatus::Error]);
        self.coordinator.retry_failed(&failed, uploader).await
    }

    pub fn can_send(&self) -> bool {
        self.gate.can_send(&self.attachment_ids())
    }

    /// Deliver the composition with every attachment it currently holds.
    pub async fn send<T, E, F, Fut>(&self, send: F) -> Result<T, DeliveryError<E>>
    where
        F: FnOnce(Vec<String>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.gate.commit_send(&self.attachment_ids(), send).await
    }

    pub fn dispose(&self) {
        self.store.dispose();
    }
}

impl Drop for Composition {
    fn drop(&mut self) {
        self.store.dispose();
    }
}
