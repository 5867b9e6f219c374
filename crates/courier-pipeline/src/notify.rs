use courier_core::Notification;
use tokio::sync::broadcast;
use tracing::debug;

/// Broadcast stream of user-facing notifications.
pub type NotificationStream = broadcast::Receiver<Notification>;

/// Fan-out point for notifications; the pipeline never renders anything itself.
#[derive(Clone, Debug)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Notifier {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> NotificationStream {
        self.tx.subscribe()
    }

    /// Emission is best-effort; nobody listening is not an error.
    pub fn emit(&self, notification: Notification) {
        debug!("notify [{}] {}", notification.kind, notification.message);
        let _ = self.tx.send(notification);
    }
}
