//! Best-effort status notifications for live progress displays.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Broadcast group every status update is published to.
pub const STATUS_GROUP: &str = "status_updates";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Starting,
    Working,
    Success,
    Failed,
}

/// Payload of a progress notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub filename: Option<String>,
    pub task_id: Option<String>,
    pub current_progress: u32,
    pub max_progress: u32,
    pub status: TaskStatus,
    pub message: String,
}

impl StatusUpdate {
    /// The terminal 100/100 success update.
    pub fn finished(filename: Option<String>, task_id: Option<String>) -> Self {
        Self {
            filename,
            task_id,
            current_progress: 100,
            max_progress: 100,
            status: TaskStatus::Success,
            message: "finished".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification transport unavailable: {0}")]
    TransportUnavailable(String),
}

/// A fire-and-forget publisher of [`StatusUpdate`]s.
pub trait StatusNotifier: Send + Sync {
    fn publish(
        &self,
        group: &str,
        update: &StatusUpdate,
    ) -> Result<(), NotifyError>;
}

/// Publish `update`, logging instead of returning any transport failure.
pub fn publish_best_effort(notifier: &dyn StatusNotifier, update: &StatusUpdate) {
    if let Err(e) = notifier.publish(STATUS_GROUP, update) {
        tracing::warn!(
            error = %e,
            task_id = update.task_id.as_deref().unwrap_or("-"),
            "could not publish status update; the broker may be unreachable"
        );
    }
}

/// In-process publisher backed by a bounded tokio broadcast channel.
///
/// Sending never blocks: slow receivers lag and lose the oldest updates.
/// Publishing with no subscribers is reported as an unavailable transport.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<(String, StatusUpdate)>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(String, StatusUpdate)> {
        self.sender.subscribe()
    }
}

impl StatusNotifier for BroadcastNotifier {
    fn publish(
        &self,
        group: &str,
        update: &StatusUpdate,
    ) -> Result<(), NotifyError> {
        self.sender
            .send((group.to_string(), update.clone()))
            .map(|_| ())
            .map_err(|_| {
                NotifyError::TransportUnavailable(format!(
                    "no subscribers on group '{group}'"
                ))
            })
    }
}

/// Writes each update to the log as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl StatusNotifier for TracingNotifier {
    fn publish(
        &self,
        group: &str,
        update: &StatusUpdate,
    ) -> Result<(), NotifyError> {
        let payload = serde_json::to_string(update)
            .map_err(|e| NotifyError::TransportUnavailable(e.to_string()))?;
        tracing::debug!(group, %payload, "status update");
        Ok(())
    }
}
