use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PermissionState {
    #[default]
    NotDetermined,
    Denied,
    Authorized,
    Provisional,
    Ephemeral,
}

impl PermissionState {
    #[must_use]
    pub const fn is_authorized(self) -> bool {
        matches!(self, Self::Authorized | Self::Provisional | Self::Ephemeral)
    }

    #[must_use]
    pub const fn is_denied(self) -> bool {
        matches!(self, Self::Denied)
    }

    #[must_use]
    pub const fn needs_request(self) -> bool {
        matches!(self, Self::NotDetermined)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Trigger {
    Interval { seconds: u64, repeats: bool },
    Daily { hour: u8, minute: u8 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationRequest {
    pub title: String,
    pub body: String,
    pub trigger: Trigger,
    pub channel: String,
}

/// Opaque handle the platform returns for a scheduled notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(String);

impl NotificationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum NotificationError {
    #[error("notifications not available on this platform")]
    NotAvailable,

    #[error("permission denied by user")]
    PermissionDenied,

    #[error("scheduling failed: {reason}")]
    ScheduleFailed {
        reason: String,
        #[serde(default)]
        is_retryable: bool,
    },

    #[error("no scheduled notification with id {id}")]
    NotFound { id: String },

    #[error("operation timed out")]
    Timeout,

    #[error("unknown error: {message}")]
    Unknown { message: String },
}

impl NotificationError {
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::ScheduleFailed { is_retryable, .. } => *is_retryable,
            Self::Timeout => true,
            Self::NotAvailable
            | Self::PermissionDenied
            | Self::NotFound { .. }
            | Self::Unknown { .. } => false,
        }
    }

    #[must_use]
    pub fn schedule_failed(reason: impl Into<String>) -> Self {
        Self::ScheduleFailed {
            reason: reason.into(),
            is_retryable: false,
        }
    }
}

/// Platform-level local notification scheduler. Scheduled notifications
/// fire even when the process is not running.
#[async_trait::async_trait]
pub trait NotificationScheduler: Send + Sync {
    async fn permission_status(&self) -> Result<PermissionState, NotificationError>;

    async fn request_permission(&self) -> Result<PermissionState, NotificationError>;

    async fn schedule(
        &self,
        request: NotificationRequest,
    ) -> Result<NotificationId, NotificationError>;

    async fn cancel(&self, id: &NotificationId) -> Result<(), NotificationError>;
}

/// Asks for permission when it has not been decided yet.
pub async fn ensure_permission(
    scheduler: &dyn NotificationScheduler,
) -> Result<(), NotificationError> {
    let mut state = scheduler.permission_status().await?;
    if state.needs_request() {
        state = scheduler.request_permission().await?;
    }
    if state.is_authorized() {
        Ok(())
    } else {
        Err(NotificationError::PermissionDenied)
    }
}

/// In-app alert delivered while the process is active (visible alert plus
/// vibration).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reminder {
    pub title: String,
    pub body: String,
    pub vibrate_ms: u64,
}

pub trait ReminderSink: Send + Sync {
    fn remind(&self, reminder: &Reminder);
}

/// Scheduler that records requests instead of delivering them.
#[derive(Debug)]
pub struct RecordingScheduler {
    permission: Mutex<PermissionState>,
    grant_on_request: bool,
    scheduled: Mutex<Vec<(NotificationId, NotificationRequest)>>,
    cancelled: Mutex<Vec<NotificationId>>,
    fail_schedule: AtomicBool,
    next_id: AtomicU64,
}

impl Default for RecordingScheduler {
    fn default() -> Self {
        Self::with_permission(PermissionState::Authorized)
    }
}

impl RecordingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// A `NotDetermined` scheduler grants on request; any other state is sticky.
    pub fn with_permission(permission: PermissionState) -> Self {
        Self {
            permission: Mutex::new(permission),
            grant_on_request: permission.needs_request(),
            scheduled: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            fail_schedule: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn set_fail_schedule(&self, fail: bool) {
        self.fail_schedule.store(fail, Ordering::SeqCst);
    }

    /// Notifications scheduled and not yet cancelled.
    pub fn pending(&self) -> Vec<(NotificationId, NotificationRequest)> {
        lock(&self.scheduled).clone()
    }

    pub fn cancelled(&self) -> Vec<NotificationId> {
        lock(&self.cancelled).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait::async_trait]
impl NotificationScheduler for RecordingScheduler {
    async fn permission_status(&self) -> Result<PermissionState, NotificationError> {
        Ok(*lock(&self.permission))
    }

    async fn request_permission(&self) -> Result<PermissionState, NotificationError> {
        let mut permission = lock(&self.permission);
        if self.grant_on_request && permission.needs_request() {
            *permission = PermissionState::Authorized;
        }
        Ok(*permission)
    }

    async fn schedule(
        &self,
        request: NotificationRequest,
    ) -> Result<NotificationId, NotificationError> {
        if self.fail_schedule.load(Ordering::SeqCst) {
            return Err(NotificationError::schedule_failed("scheduler rejected request"));
        }
        if !lock(&self.permission).is_authorized() {
            return Err(NotificationError::PermissionDenied);
        }

        let id = NotificationId(format!(
            "notification-{}",
            self.next_id.fetch_add(1, Ordering::SeqCst)
        ));
        debug!(id = %id, channel = %request.channel, "Scheduled notification");
        lock(&self.scheduled).push((id.clone(), request));
        Ok(id)
    }

    async fn cancel(&self, id: &NotificationId) -> Result<(), NotificationError> {
        let mut scheduled = lock(&self.scheduled);
        let before = scheduled.len();
        scheduled.retain(|(existing, _)| existing != id);
        if scheduled.len() == before {
            return Err(NotificationError::NotFound { id: id.0.clone() });
        }
        lock(&self.cancelled).push(id.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingReminderSink {
    reminders: Mutex<Vec<Reminder>>,
}

impl RecordingReminderSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reminders(&self) -> Vec<Reminder> {
        lock(&self.reminders).clone()
    }

    pub fn count(&self) -> usize {
        lock(&self.reminders).len()
    }
}

impl ReminderSink for RecordingReminderSink {
    fn remind(&self, reminder: &Reminder) {
        lock(&self.reminders).push(reminder.clone());
    }
}
