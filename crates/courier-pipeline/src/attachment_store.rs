use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use courier_core::{
    can_transition, AllowList, Attachment, AttachmentError, AttachmentPatch, AttachmentStatus,
    FileMeta,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Change notifications published to store observers, in mutation order.
///
/// Every subscriber sees every event; nothing is dropped under bursts.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Added(Attachment),
    Updated(Attachment),
    Removed { id: String },
    Disposed,
}

struct Entry {
    attachment: Attachment,
    source: Option<Bytes>,
}

#[derive(Default)]
struct Inner {
    order: Vec<String>,
    entries: HashMap<String, Entry>,
    disposed: bool,
    subscribers: Vec<mpsc::UnboundedSender<StoreEvent>>,
}

impl Inner {
    /// Called with the lock held, so observers see events in mutation order.
    fn publish(&mut self, event: StoreEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Authoritative set of attachments for one composition.
///
/// Every method takes the lock for its whole body and never across an await,
/// so mutations of a single attachment cannot interleave.
pub struct AttachmentStore {
    composition_id: String,
    generation: u64,
    allow_list: AllowList,
    inner: Mutex<Inner>,
    disposed_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for AttachmentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentStore")
            .field("composition_id", &self.composition_id)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl AttachmentStore {
    pub fn new(composition_id: impl Into<String>, allow_list: AllowList) -> Self {
        let (disposed_tx, _) = watch::channel(false);
        Self {
            composition_id: composition_id.into(),
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            allow_list,
            inner: Mutex::new(Inner::default()),
            disposed_tx,
        }
    }

    pub fn composition_id(&self) -> &str {
        &self.composition_id
    }

    /// Unique per store instance; upload tasks are tagged with it.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }

    /// Receives every event from now on. The stream ends after `Disposed`.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StoreEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        if !inner.disposed {
            inner.subscribers.push(tx);
        }
        rx
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a live entry, failing on disposal or unknown id.
    fn entry_mut<'a>(inner: &'a mut Inner, id: &str) -> Result<&'a mut Entry, AttachmentError> {
        if inner.disposed {
            return Err(AttachmentError::Disposed);
        }
        inner
            .entries
            .get_mut(id)
            .ok_or_else(|| AttachmentError::NotFound(id.to_string()))
    }

    pub fn add(&self, meta: FileMeta) -> Result<Attachment, AttachmentError> {
        self.allow_list.validate(&meta)?;

        let mut inner = self.lock();
        if inner.disposed {
            return Err(AttachmentError::Disposed);
        }
        let attachment = Attachment::new(&meta);
        debug!(
            "adding attachment {} ({}, {} bytes) to {}",
            attachment.id, attachment.name, attachment.size_bytes, self.composition_id
        );
        inner.order.push(attachment.id.clone());
        inner.entries.insert(
            attachment.id.clone(),
            Entry {
                attachment: attachment.clone(),
                source: Some(meta.source),
            },
        );
        inner.publish(StoreEvent::Added(attachment.clone()));
        Ok(attachment)
    }

    pub fn get(&self, id: &str) -> Option<Attachment> {
        self.lock().entries.get(id).map(|e| e.attachment.clone())
    }

    pub fn status(&self, id: &str) -> Option<AttachmentStatus> {
        self.lock().entries.get(id).map(|e| e.attachment.status)
    }

    /// Snapshots in insertion order.
    pub fn list(&self) -> Vec<Attachment> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .map(|e| e.attachment.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn source(&self, id: &str) -> Option<Bytes> {
        self.lock().entries.get(id).and_then(|e| e.source.clone())
    }

    pub fn remove(&self, id: &str) -> Result<Attachment, AttachmentError> {
        let mut inner = self.lock();
        let status = Self::entry_mut(&mut inner, id)?.attachment.status;
        if status.is_locked() {
            return Err(AttachmentError::Conflict {
                id: id.to_string(),
                status,
            });
        }
        inner.order.retain(|o| o != id);
        let entry = inner
            .entries
            .remove(id)
            .ok_or_else(|| AttachmentError::NotFound(id.to_string()))?;
        debug!("removed attachment {id} from {}", self.composition_id);
        inner.publish(StoreEvent::Removed { id: id.to_string() });
        Ok(entry.attachment)
    }

    /// Validated status change plus the patch fields belonging to `to`.
    pub fn transition(
        &self,
        id: &str,
        to: AttachmentStatus,
        patch: AttachmentPatch,
    ) -> Result<Attachment, AttachmentError> {
        let mut inner = self.lock();
        let entry = Self::entry_mut(&mut inner, id)?;
        let from = entry.attachment.status;
        if !can_transition(from, to) {
            error!("rejected transition {from} -> {to} for attachment {id}");
            return Err(AttachmentError::invalid_transition(id, from, to));
        }
        if to == AttachmentStatus::Uploaded
            && patch.storage_path.is_none()
            && entry.attachment.storage_path.is_none()
        {
            return Err(AttachmentError::MissingStoragePath(id.to_string()));
        }

        entry.attachment.apply(to, patch);
        if to == AttachmentStatus::Uploaded {
            entry.source = None;
        }
        let snapshot = entry.attachment.clone();
        debug!("attachment {id}: {from} -> {to}");
        inner.publish(StoreEvent::Updated(snapshot.clone()));
        Ok(snapshot)
    }

    /// Progress is only recorded while uploading; late reports are ignored.
    pub fn set_progress(&self, id: &str, percent: u8) -> Result<(), AttachmentError> {
        let mut inner = self.lock();
        let entry = Self::entry_mut(&mut inner, id)?;
        let percent = percent.min(100);
        if entry.attachment.status != AttachmentStatus::Uploading
            || entry.attachment.upload_progress == percent
        {
            return Ok(());
        }
        entry.attachment.upload_progress = percent;
        let snapshot = entry.attachment.clone();
        inner.publish(StoreEvent::Updated(snapshot));
        Ok(())
    }

    pub fn record_retry(&self, id: &str) -> Result<u32, AttachmentError> {
        let mut inner = self.lock();
        let entry = Self::entry_mut(&mut inner, id)?;
        entry.attachment.retry_count += 1;
        let snapshot = entry.attachment.clone();
        inner.publish(StoreEvent::Updated(snapshot.clone()));
        Ok(snapshot.retry_count)
    }

    /// User-initiated retry of a failed attachment: `error -> pending`.
    ///
    /// The allow-list is checked again since it may have changed since `add`.
    pub fn retry(&self, id: &str) -> Result<Attachment, AttachmentError> {
        let mut inner = self.lock();
        let entry = Self::entry_mut(&mut inner, id)?;
        let from = entry.attachment.status;
        if !can_transition(from, AttachmentStatus::Pending) {
            return Err(AttachmentError::invalid_transition(
                id,
                from,
                AttachmentStatus::Pending,
            ));
        }
        let Some(source) = entry.source.clone() else {
            return Err(AttachmentError::SourceUnavailable(id.to_string()));
        };
        let meta = FileMeta {
            name: entry.attachment.name.clone(),
            size_bytes: entry.attachment.size_bytes,
            mime_type: entry.attachment.mime_type.clone(),
            source,
        };
        self.allow_list.validate(&meta)?;

        entry
            .attachment
            .apply(AttachmentStatus::Pending, AttachmentPatch::default());
        let snapshot = entry.attachment.clone();
        info!("attachment {id} queued for retry");
        inner.publish(StoreEvent::Updated(snapshot.clone()));
        Ok(snapshot)
    }

    /// Undo phase one of a send: `sending -> uploaded`.
    ///
    /// Only the delivery gate calls this; it is not a lifecycle transition.
    pub fn rollback_sending(&self, id: &str) -> Result<Attachment, AttachmentError> {
        let mut inner = self.lock();
        let entry = Self::entry_mut(&mut inner, id)?;
        let from = entry.attachment.status;
        if from != AttachmentStatus::Sending {
            return Err(AttachmentError::invalid_transition(
                id,
                from,
                AttachmentStatus::Uploaded,
            ));
        }
        entry
            .attachment
            .apply(AttachmentStatus::Uploaded, AttachmentPatch::default());
        let snapshot = entry.attachment.clone();
        inner.publish(StoreEvent::Updated(snapshot.clone()));
        Ok(snapshot)
    }

    /// Storage paths for `ids`, in the order given.
    pub fn ready_paths(&self, ids: &[String]) -> Result<Vec<String>, AttachmentError> {
        let inner = self.lock();
        ids.iter()
            .map(|id| {
                let entry = inner
                    .entries
                    .get(id)
                    .ok_or_else(|| AttachmentError::NotFound(id.clone()))?;
                entry
                    .attachment
                    .storage_path
                    .clone()
                    .ok_or_else(|| AttachmentError::MissingStoragePath(id.clone()))
            })
            .collect()
    }

    /// Ids in insertion order whose status is in `statuses`.
    pub fn ids_with_status(&self, statuses: &[AttachmentStatus]) -> Vec<String> {
        let wanted: HashSet<_> = statuses.iter().copied().collect();
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter(|id| {
                inner
                    .entries
                    .get(*id)
                    .is_some_and(|e| wanted.contains(&e.attachment.status))
            })
            .cloned()
            .collect()
    }

    /// Tear the store down. All records and their bytes are dropped, later
    /// mutations fail with `Disposed`, and in-flight uploads are abandoned.
    pub fn dispose(&self) {
        let mut inner = self.lock();
        if inner.disposed {
            return;
        }
        inner.disposed = true;
        let dropped = inner.order.len();
        inner.order.clear();
        inner.entries.clear();
        info!(
            "disposed attachment store for {} (generation {}, {dropped} attachments dropped)",
            self.composition_id, self.generation
        );
        inner.publish(StoreEvent::Disposed);
        inner.subscribers.clear();
        self.disposed_tx.send_replace(true);
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    /// Resolves once [`dispose`](Self::dispose) has been called.
    pub async fn wait_disposed(&self) {
        let mut rx = self.disposed_tx.subscribe();
        let _ = rx.wait_for(|disposed| *disposed).await;
    }
}
