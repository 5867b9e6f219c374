pub mod attachment;
pub mod error;
pub mod notification;
pub mod policy;

pub use attachment::{can_transition, Attachment, AttachmentPatch, AttachmentStatus, FileMeta};
pub use error::{AttachmentError, ValidationError};
pub use notification::{Notification, NotificationKind};
pub use policy::AllowList;
