mod http;
mod notifications;
mod remote;

use std::sync::Arc;

pub use self::http::{
    HttpClient, HttpError, RecordedRequest, ScriptedHttpClient, ValidatedUrl, MAX_URL_LENGTH,
};
#[cfg(feature = "http")]
pub use self::http::ReqwestClient;
pub use self::notifications::{
    ensure_permission, NotificationError, NotificationId, NotificationRequest,
    NotificationScheduler, PermissionState, RecordingReminderSink, RecordingScheduler, Reminder,
    ReminderSink, Trigger,
};
pub use self::remote::{
    CollectionPath, Direction, DocumentPath, InMemoryRemoteStore, NewDocument, OrderBy, Query,
    RemoteError, RemoteStore, SetMode, SnapshotStream, StorageErrorCode, MAX_SEGMENT_LENGTH,
    USERS_COLLECTION,
};

use crate::clock::{Clock, SystemClock};

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    #[error("Remote store error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Notification error: {0}")]
    Notification(#[from] NotificationError),
}

impl CapabilityError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_retryable(),
            Self::Remote(e) => e.is_retryable(),
            Self::Notification(e) => e.is_retryable(),
        }
    }
}

/// Handles to every external collaborator the core talks to. The shell
/// supplies platform implementations; tests use the in-memory ones.
#[derive(Clone)]
pub struct Capabilities {
    pub remote: Arc<dyn RemoteStore>,
    pub notifications: Arc<dyn NotificationScheduler>,
    pub reminders: Arc<dyn ReminderSink>,
    pub http: Arc<dyn HttpClient>,
    pub clock: Arc<dyn Clock>,
}

impl Capabilities {
    /// Fully in-process bundle: memory-backed store, recording scheduler and
    /// sink, scripted HTTP client.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            remote: Arc::new(InMemoryRemoteStore::new(clock.clone())),
            notifications: Arc::new(RecordingScheduler::new()),
            reminders: Arc::new(RecordingReminderSink::new()),
            http: Arc::new(ScriptedHttpClient::new()),
            clock,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::in_memory(Arc::new(SystemClock))
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}
