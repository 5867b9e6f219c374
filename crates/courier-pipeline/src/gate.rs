use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use courier_core::{AttachmentError, AttachmentPatch, AttachmentStatus, Notification};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::attachment_store::AttachmentStore;
use crate::notify::Notifier;

#[derive(Debug, Error)]
pub enum DeliveryError<E> {
    #[error("attachments are not ready to send")]
    NotReady,

    #[error(transparent)]
    Attachment(#[from] AttachmentError),

    #[error("send failed: {0}")]
    Send(E),
}

/// Holds the outer send back until every attachment is uploaded, then
/// commits `uploaded -> sending -> sent` around it.
pub struct DeliveryGate {
    store: Arc<AttachmentStore>,
    notifier: Notifier,
}

impl DeliveryGate {
    pub fn new(store: Arc<AttachmentStore>, notifier: Notifier) -> Self {
        Self { store, notifier }
    }

    /// True iff every id exists and is `uploaded`. An empty set is ready.
    pub fn can_send(&self, ids: &[String]) -> bool {
        ids.iter()
            .all(|id| self.store.status(id) == Some(AttachmentStatus::Uploaded))
    }

    /// Run `send` with the attachments' storage paths once they are all uploaded.
    ///
    /// A failed send puts every attachment back to `uploaded` so the user can
    /// try again; nothing is marked `error`.
    pub async fn commit_send<T, E, F, Fut>(
        &self,
        ids: &[String],
        send: F,
    ) -> Result<T, DeliveryError<E>>
    where
        F: FnOnce(Vec<String>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut unique: Vec<String> = Vec::with_capacity(ids.len());
        for id in ids {
            if !unique.contains(id) {
                unique.push(id.clone());
            }
        }
        if !self.can_send(&unique) {
            return Err(DeliveryError::NotReady);
        }
        let paths = self.store.ready_paths(&unique)?;

        let mut moved = Vec::with_capacity(unique.len());
        for id in &unique {
            match self
                .store
                .transition(id, AttachmentStatus::Sending, AttachmentPatch::default())
            {
                Ok(_) => moved.push(id.clone()),
                Err(e) => {
                    error!("could not mark {id} as sending: {e}");
                    self.rollback(&moved);
                    return Err(e.into());
                }
            }
        }

        info!(
            "sending {} with {} attachments",
            self.store.composition_id(),
            moved.len()
        );
        let result = send(paths).await;

        if self.store.is_disposed() {
            warn!(
                "attachment store for {} disposed during send; leaving states alone",
                self.store.composition_id()
            );
            return result.map_err(DeliveryError::Send);
        }

        match result {
            Ok(value) => {
                for id in &moved {
                    if let Err(e) =
                        self.store
                            .transition(id, AttachmentStatus::Sent, AttachmentPatch::default())
                    {
                        error!("could not mark {id} as sent: {e}");
                    }
                }
                self.notifier.emit(Notification::success(format!(
                    "Sent with {} attachments",
                    moved.len()
                )));
                Ok(value)
            }
            Err(e) => {
                warn!("send for {} failed: {e}", self.store.composition_id());
                self.rollback(&moved);
                self.notifier
                    .emit(Notification::error("Send failed").with_description(e.to_string()));
                Err(DeliveryError::Send(e))
            }
        }
    }

    fn rollback(&self, ids: &[String]) {
        for id in ids {
            if let Err(e) = self.store.rollback_sending(id) {
                error!("could not roll back {id}: {e}");
            }
        }
    }
}
