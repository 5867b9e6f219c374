use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use courier_core::{Attachment, AttachmentError, AttachmentPatch, AttachmentStatus, Notification};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::attachment_store::AttachmentStore;
use crate::config::PipelineConfig;
use crate::notify::Notifier;
use crate::retry::{with_deadline, RetryPolicy};
use crate::uploader::{ProgressSink, UploadError, Uploader};

/// Per-id outcome of an [`UploadCoordinator::upload_all`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    /// Not `pending` when the batch started.
    pub skipped: Vec<String>,
    /// Still running when the store was disposed.
    pub abandoned: Vec<String>,
}

impl UploadSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty() && self.abandoned.is_empty()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.skipped.len() + self.abandoned.len()
    }

    fn merge(&mut self, other: UploadSummary) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
        self.skipped.extend(other.skipped);
        self.abandoned.extend(other.abandoned);
    }
}

#[derive(Debug)]
enum Outcome {
    Uploaded { id: String, name: String },
    Failed { id: String, name: String, detail: String },
    Skipped { id: String },
    Abandoned { id: String },
}

/// Runs uploads for the attachments of one store.
pub struct UploadCoordinator {
    store: Arc<AttachmentStore>,
    policy: RetryPolicy,
    max_concurrent: usize,
    deadline: Option<Duration>,
    notifier: Notifier,
}

impl UploadCoordinator {
    pub fn new(store: Arc<AttachmentStore>, config: &PipelineConfig, notifier: Notifier) -> Self {
        Self {
            store,
            policy: RetryPolicy::new(config.retry),
            max_concurrent: config.max_concurrent.clamp(1, Semaphore::MAX_PERMITS),
            deadline: config.upload_deadline(),
            notifier,
        }
    }

    pub fn store(&self) -> &Arc<AttachmentStore> {
        &self.store
    }

    /// Upload every `pending` attachment in insertion order of the store.
    pub async fn upload_pending(&self, uploader: Arc<dyn Uploader>) -> UploadSummary {
        let ids = self.store.ids_with_status(&[AttachmentStatus::Pending]);
        self.upload_all(&ids, uploader).await
    }

    /// Upload the given attachments concurrently, each under its own retry policy.
    ///
    /// Transport failures end up in the attachment's `error_detail`, never here.
    pub async fn upload_all(&self, ids: &[String], uploader: Arc<dyn Uploader>) -> UploadSummary {
        let mut summary = UploadSummary::default();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut set = JoinSet::new();
        let mut outstanding = HashSet::new();

        for id in ids {
            if outstanding.contains(id) {
                continue;
            }
            if self.store.status(id) != Some(AttachmentStatus::Pending) {
                debug!("skipping attachment {id}: not pending");
                summary.skipped.push(id.clone());
                continue;
            }
            outstanding.insert(id.clone());
            let task = UploadTask {
                store: self.store.clone(),
                uploader: uploader.clone(),
                semaphore: semaphore.clone(),
                policy: self.policy,
                deadline: self.deadline,
                id: id.clone(),
            };
            set.spawn(async move {
                tokio::select! {
                    outcome = task.run() => outcome,
                    _ = task.store.wait_disposed() => Outcome::Abandoned { id: task.id.clone() },
                }
            });
        }

        if !outstanding.is_empty() {
            info!(
                "uploading {} attachments for {} via {} (max {} at once)",
                outstanding.len(),
                self.store.composition_id(),
                uploader.name(),
                self.max_concurrent
            );
        }

        while let Some(joined) = set.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("upload task failed to complete: {e}");
                    continue;
                }
            };
            self.record(outcome, &mut outstanding, &mut summary);
        }

        // Tasks that panicked never reported; don't leave them in `uploading`.
        for id in outstanding {
            let detail = "upload task aborted".to_string();
            match self
                .store
                .transition(&id, AttachmentStatus::Error, AttachmentPatch::error(&detail))
            {
                Ok(_) => summary.failed.push(id),
                Err(_) => summary.abandoned.push(id),
            }
        }

        if !summary.abandoned.is_empty() {
            self.notifier.emit(Notification::warning(format!(
                "{} uploads abandoned",
                summary.abandoned.len()
            )));
        }
        summary
    }

    /// Manual retry: move each `error` attachment back to `pending` and upload again.
    pub async fn retry_failed(&self, ids: &[String], uploader: Arc<dyn Uploader>) -> UploadSummary {
        let mut summary = UploadSummary::default();
        let mut queued = Vec::new();
        for id in ids {
            if self.store.status(id) != Some(AttachmentStatus::Error) {
                summary.skipped.push(id.clone());
                continue;
            }
            match self.store.retry(id) {
                Ok(_) => queued.push(id.clone()),
                Err(e) => {
                    warn!("cannot retry attachment {id}: {e}");
                    self.notifier
                        .emit(Notification::error("Retry not possible").with_description(e.to_string()));
                    summary.failed.push(id.clone());
                }
            }
        }
        summary.merge(self.upload_all(&queued, uploader).await);
        summary
    }

    /// Remove an attachment and delete whatever it already put in storage.
    ///
    /// A failed delete is logged, not returned; the record is gone either way.
    pub async fn remove(
        &self,
        id: &str,
        uploader: &dyn Uploader,
    ) -> Result<Attachment, AttachmentError> {
        let removed = self.store.remove(id)?;
        if let Some(path) = &removed.storage_path {
            match uploader.discard(path).await {
                Ok(()) => debug!("discarded {path} for removed attachment {id}"),
                Err(e) => warn!("could not discard {path} for attachment {id}: {e}"),
            }
        }
        Ok(removed)
    }

    fn record(
        &self,
        outcome: Outcome,
        outstanding: &mut HashSet<String>,
        summary: &mut UploadSummary,
    ) {
        match outcome {
            Outcome::Uploaded { id, name } => {
                outstanding.remove(&id);
                self.notifier
                    .emit(Notification::success(format!("{name} uploaded")));
                summary.succeeded.push(id);
            }
            Outcome::Failed { id, name, detail } => {
                outstanding.remove(&id);
                self.notifier.emit(
                    Notification::error(format!("Failed to upload {name}")).with_description(detail),
                );
                summary.failed.push(id);
            }
            Outcome::Skipped { id } => {
                outstanding.remove(&id);
                summary.skipped.push(id);
            }
            Outcome::Abandoned { id } => {
                outstanding.remove(&id);
                summary.abandoned.push(id);
            }
        }
    }
}

struct UploadTask {
    store: Arc<AttachmentStore>,
    uploader: Arc<dyn Uploader>,
    semaphore: Arc<Semaphore>,
    policy: RetryPolicy,
    deadline: Option<Duration>,
    id: String,
}

impl UploadTask {
    fn abandoned(&self) -> Outcome {
        debug!(
            "upload of {} abandoned (generation {})",
            self.id,
            self.store.generation()
        );
        Outcome::Abandoned {
            id: self.id.clone(),
        }
    }

    async fn run(&self) -> Outcome {
        let Ok(_permit) = self.semaphore.acquire().await else {
            return self.abandoned();
        };

        let attachment = match self.store.transition(
            &self.id,
            AttachmentStatus::Uploading,
            AttachmentPatch::default(),
        ) {
            Ok(a) => a,
            Err(AttachmentError::Disposed) => return self.abandoned(),
            Err(e) => {
                // Removed or moved on between scheduling and start.
                debug!("not uploading {}: {e}", self.id);
                return Outcome::Skipped {
                    id: self.id.clone(),
                };
            }
        };

        let result = match self.store.source(&self.id) {
            Some(data) => self.upload_with_retry(&attachment, data).await,
            None => Err(AttachmentError::SourceUnavailable(self.id.clone()).to_string()),
        };

        match result {
            Ok(path) => match self.store.transition(
                &self.id,
                AttachmentStatus::Uploaded,
                AttachmentPatch::storage_path(path),
            ) {
                Ok(done) => {
                    info!(
                        "uploaded {} ({}) to {:?} after {} retries",
                        done.id, done.name, done.storage_path, done.retry_count
                    );
                    Outcome::Uploaded {
                        id: done.id,
                        name: done.name,
                    }
                }
                Err(AttachmentError::Disposed) => self.abandoned(),
                Err(e) => {
                    error!("could not record upload of {}: {e}", self.id);
                    Outcome::Failed {
                        id: self.id.clone(),
                        name: attachment.name,
                        detail: e.to_string(),
                    }
                }
            },
            Err(detail) => match self.store.transition(
                &self.id,
                AttachmentStatus::Error,
                AttachmentPatch::error(&detail),
            ) {
                Ok(failed) => {
                    error!(
                        "upload of {} ({}) failed: {detail}",
                        failed.id, failed.name
                    );
                    Outcome::Failed {
                        id: failed.id,
                        name: failed.name,
                        detail,
                    }
                }
                Err(AttachmentError::Disposed) => self.abandoned(),
                Err(e) => {
                    error!("could not record failed upload of {}: {e}", self.id);
                    Outcome::Failed {
                        id: self.id.clone(),
                        name: attachment.name,
                        detail,
                    }
                }
            },
        }
    }

    /// Storage path on success, otherwise the message of the last error.
    async fn upload_with_retry(
        &self,
        attachment: &Attachment,
        data: Bytes,
    ) -> Result<String, String> {
        let attempts = self.policy.execute_with(
            || {
                let uploader = self.uploader.clone();
                let attachment = attachment.clone();
                let data = data.clone();
                let sink = ProgressSink::new(&self.store, &self.id);
                async move { uploader.upload(&attachment, data, sink).await }
            },
            UploadError::is_retryable,
            |_, _| {
                let _ = self.store.record_retry(&self.id);
            },
        );

        match self.deadline {
            Some(deadline) => match with_deadline(deadline, attempts).await {
                Ok(result) => result.map_err(|e| e.last.to_string()),
                Err(e) => Err(e.to_string()),
            },
            None => attempts.await.map_err(|e| e.last.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use courier_core::{AllowList, FileMeta, NotificationKind};

    use super::*;
    use crate::retry::RetryOptions;

    /// Tracks how many uploads are in flight at once.
    struct GaugeUploader {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Uploader for GaugeUploader {
        fn name(&self) -> &str {
            "gauge"
        }

        async fn upload(
            &self,
            attachment: &Attachment,
            _data: Bytes,
            _progress: ProgressSink,
        ) -> Result<String, UploadError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(format!("mem/{}", attachment.id))
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Uploader for AlwaysFails {
        fn name(&self) -> &str {
            "always-fails"
        }

        async fn upload(
            &self,
            _attachment: &Attachment,
            _data: Bytes,
            _progress: ProgressSink,
        ) -> Result<String, UploadError> {
            Err(UploadError::Transport("503 service unavailable".into()))
        }
    }

    /// Fails with a key error that no amount of retrying fixes.
    #[derive(Default)]
    struct BadKey {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Uploader for BadKey {
        fn name(&self) -> &str {
            "bad-key"
        }

        async fn upload(
            &self,
            attachment: &Attachment,
            _data: Bytes,
            _progress: ProgressSink,
        ) -> Result<String, UploadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let key = format!("compositions/../x/{}", attachment.id);
            Err(courier_store::StoreError::InvalidKey(key).into())
        }
    }

    fn add_pdfs(store: &AttachmentStore, n: usize) -> Vec<String> {
        (0..n)
            .map(|i| {
                store
                    .add(FileMeta::from_bytes(
                        format!("doc-{i}.pdf"),
                        "application/pdf",
                        Bytes::from_static(b"pdf"),
                    ))
                    .unwrap()
                    .id
            })
            .collect()
    }

    fn coordinator(config: PipelineConfig) -> UploadCoordinator {
        let store = Arc::new(AttachmentStore::new("c1", AllowList::default()));
        UploadCoordinator::new(store, &config, Notifier::default())
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded() {
        let coord = coordinator(PipelineConfig::default().with_max_concurrent(2));
        let ids = add_pdfs(coord.store(), 6);
        let uploader = Arc::new(GaugeUploader {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let summary = coord.upload_all(&ids, uploader.clone()).await;

        assert_eq!(summary.succeeded.len(), 6);
        assert!(summary.all_succeeded());
        assert_eq!(uploader.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_marks_error_with_last_message() {
        let coord = coordinator(PipelineConfig::default());
        let ids = add_pdfs(coord.store(), 1);
        let mut notes = coord.notifier.subscribe();

        let summary = coord.upload_all(&ids, Arc::new(AlwaysFails)).await;

        assert_eq!(summary.failed, ids);
        let att = coord.store().get(&ids[0]).unwrap();
        assert_eq!(att.status, AttachmentStatus::Error);
        assert_eq!(
            att.error_detail.as_deref(),
            Some("transport error: 503 service unavailable")
        );
        assert_eq!(att.retry_count, 2);

        let note = notes.try_recv().unwrap();
        assert_eq!(note.kind, NotificationKind::Error);
        assert_eq!(
            note.description.as_deref(),
            Some("transport error: 503 service unavailable")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn non_pending_ids_are_skipped() {
        let coord = coordinator(PipelineConfig::default());
        let ids = add_pdfs(coord.store(), 2);
        coord
            .store()
            .transition(&ids[1], AttachmentStatus::Error, AttachmentPatch::error("x"))
            .unwrap();
        let unknown = "nope".to_string();

        let summary = coord
            .upload_all(
                &[ids[0].clone(), ids[1].clone(), unknown.clone()],
                Arc::new(AlwaysFails),
            )
            .await;

        assert_eq!(summary.skipped, vec![ids[1].clone(), unknown]);
        assert_eq!(summary.failed, vec![ids[0].clone()]);
        assert_eq!(summary.total(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_failure_counts_as_failed() {
        let config = PipelineConfig::default()
            .with_upload_deadline(Duration::from_millis(20))
            .with_retry(RetryOptions::default().with_max_retries(1));
        let coord = coordinator(config);
        let ids = add_pdfs(coord.store(), 1);
        let uploader = Arc::new(GaugeUploader {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let summary = coord.upload_all(&ids, uploader).await;

        assert_eq!(summary.failed, ids);
        let att = coord.store().get(&ids[0]).unwrap();
        assert_eq!(att.error_detail.as_deref(), Some("deadline of 20ms exceeded"));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_failed_reuploads_error_attachments() {
        let coord = coordinator(PipelineConfig::default());
        let ids = add_pdfs(coord.store(), 1);
        coord.upload_all(&ids, Arc::new(AlwaysFails)).await;

        let uploader = Arc::new(GaugeUploader {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let summary = coord.retry_failed(&ids, uploader).await;

        assert_eq!(summary.succeeded, ids);
        let att = coord.store().get(&ids[0]).unwrap();
        assert_eq!(att.status, AttachmentStatus::Uploaded);
        assert_eq!(att.retry_count, 2);
    }

    #[tokio::test]
    async fn oversized_concurrency_limit_is_capped() {
        let coord = coordinator(PipelineConfig::default().with_max_concurrent(usize::MAX));
        let ids = add_pdfs(coord.store(), 2);
        let uploader = Arc::new(GaugeUploader {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let summary = coord.upload_all(&ids, uploader).await;

        assert_eq!(summary.succeeded.len(), 2);
        assert_eq!(coord.max_concurrent, Semaphore::MAX_PERMITS);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_store_errors_fail_without_retry() {
        let coord = coordinator(PipelineConfig::default());
        let ids = add_pdfs(coord.store(), 1);
        let uploader = Arc::new(BadKey::default());
        let start = tokio::time::Instant::now();

        let summary = coord.upload_all(&ids, uploader.clone()).await;

        assert_eq!(summary.failed, ids);
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 1);
        let att = coord.store().get(&ids[0]).unwrap();
        assert_eq!(att.retry_count, 0);
        assert!(att.error_detail.unwrap().starts_with("invalid key:"));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn remove_deletes_uploaded_object() {
        use courier_store::{LocalStore, ObjectStore, StoreConfig, StoreError};

        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::default().with_local_dir(dir.path().to_string_lossy());
        let objects: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(&config));
        let uploader = Arc::new(crate::uploader::StoreUploader::new(objects.clone(), "c1"));

        let coord = coordinator(PipelineConfig::default());
        let ids = add_pdfs(coord.store(), 2);
        coord.upload_all(&ids, uploader.clone()).await;
        let path = coord.store().get(&ids[0]).unwrap().storage_path.unwrap();
        assert!(objects.get(&path).await.is_ok());

        let removed = coord.remove(&ids[0], uploader.as_ref()).await.unwrap();

        assert_eq!(removed.storage_path.as_deref(), Some(path.as_str()));
        assert!(matches!(
            objects.get(&path).await.unwrap_err(),
            StoreError::NotFound(_)
        ));
        assert_eq!(coord.store().len(), 1);
    }

    #[tokio::test]
    async fn remove_refuses_attachment_being_sent() {
        let coord = coordinator(PipelineConfig::default());
        let ids = add_pdfs(coord.store(), 1);
        let store = coord.store();
        store
            .transition(&ids[0], AttachmentStatus::Uploading, AttachmentPatch::default())
            .unwrap();
        store
            .transition(&ids[0], AttachmentStatus::Uploaded, AttachmentPatch::storage_path("k"))
            .unwrap();
        store
            .transition(&ids[0], AttachmentStatus::Sending, AttachmentPatch::default())
            .unwrap();

        let err = coord.remove(&ids[0], &AlwaysFails).await.unwrap_err();
        assert!(matches!(err, AttachmentError::Conflict { .. }));
    }
}
