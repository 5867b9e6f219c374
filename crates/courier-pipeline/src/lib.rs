pub mod attachment_store;
pub mod composition;
pub mod config;
pub mod coordinator;
pub mod gate;
pub mod notify;
pub mod retry;
pub mod uploader;

pub use attachment_store::{AttachmentStore, StoreEvent};
pub use composition::Composition;
pub use config::PipelineConfig;
pub use coordinator::{UploadCoordinator, UploadSummary};
pub use gate::{DeliveryError, DeliveryGate};
pub use notify::{NotificationStream, Notifier};
pub use retry::{
    with_deadline, DeadlineExceeded, FetchError, FetchResult, RetryExhausted, RetryOptions,
    RetryPolicy,
};
pub use uploader::{ProgressSink, StoreUploader, UploadError, Uploader};
