//! Pressure-relief reminder: one periodic countdown per user that survives
//! process restarts.
//!
//! The countdown is derived from wall-clock time since `startedAt`, never
//! from counted ticks, so a suspended process resumes at the right offset.
//! Reminders are delivered in-app by the tick loop and out-of-app by a
//! repeating platform notification.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{
    ensure_permission, Capabilities, DocumentPath, NotificationError, NotificationId,
    NotificationRequest, NotificationScheduler, RemoteError, RemoteStore, Reminder, ReminderSink,
    SetMode, Trigger,
};
use crate::clock::Clock;
use crate::config::TimerConfig;
use crate::listener::remote_call;
use crate::model::{Fields, OwnerId, Session, TimerState, UnixTimeMs};

pub const SETTINGS_COLLECTION: &str = "settings";
pub const TIMER_DOCUMENT: &str = "pressureTimer";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TimerError {
    #[error("invalid interval '{input}': enter a positive number of minutes")]
    InvalidInterval { input: String },

    #[error("failed to persist timer state: {0}")]
    Persist(RemoteError),

    #[error("failed to schedule reminder: {0}")]
    Notification(#[from] NotificationError),

    #[error("remote call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl TimerError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TimerError::Persist(e) => e.is_retryable(),
            TimerError::Notification(e) => e.is_retryable(),
            TimerError::Timeout { .. } => true,
            TimerError::InvalidInterval { .. } => false,
        }
    }

    fn from_remote(e: RemoteError) -> Self {
        match e {
            RemoteError::Timeout { timeout_ms } => TimerError::Timeout { timeout_ms },
            other => TimerError::Persist(other),
        }
    }
}

/// Parses the interval text field: a positive base-10 integer of minutes.
pub fn parse_interval(input: &str) -> Result<u32, TimerError> {
    let trimmed = input.trim();
    match trimmed.parse::<u32>() {
        Ok(minutes) if minutes > 0 && trimmed.bytes().all(|b| b.is_ascii_digit()) => Ok(minutes),
        _ => Err(TimerError::InvalidInterval {
            input: input.to_string(),
        }),
    }
}

/// Seconds until the next boundary of a period that began at `started_at`.
/// Always in `1..=period_secs`; exactly on a boundary a full period remains.
pub fn remaining_secs(period_secs: u64, started_at: UnixTimeMs, now: UnixTimeMs) -> u64 {
    if period_secs == 0 {
        return 0;
    }
    period_secs - now.secs_since(started_at) % period_secs
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub remaining_secs: u64,
    pub due: bool,
}

/// Pure countdown state. `poll` reports `due` at most once per boundary,
/// collapsing boundaries that passed between polls into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Countdown {
    period_secs: u64,
    started_at: UnixTimeMs,
    fired_cycles: u64,
}

impl Countdown {
    pub fn start(period_secs: u64, now: UnixTimeMs) -> Self {
        Self {
            period_secs,
            started_at: now,
            fired_cycles: 0,
        }
    }

    /// Continues a countdown started earlier. Boundaries already passed
    /// are treated as delivered.
    pub fn resume(period_secs: u64, started_at: UnixTimeMs, now: UnixTimeMs) -> Self {
        let mut countdown = Self::start(period_secs, started_at);
        countdown.fired_cycles = countdown.cycles(now);
        countdown
    }

    fn cycles(&self, now: UnixTimeMs) -> u64 {
        if self.period_secs == 0 {
            return 0;
        }
        now.secs_since(self.started_at) / self.period_secs
    }

    pub fn remaining(&self, now: UnixTimeMs) -> u64 {
        remaining_secs(self.period_secs, self.started_at, now)
    }

    pub fn poll(&mut self, now: UnixTimeMs) -> Tick {
        let cycles = self.cycles(now);
        let due = cycles > self.fired_cycles;
        if due {
            self.fired_cycles = cycles;
        }
        Tick {
            remaining_secs: self.remaining(now),
            due,
        }
    }
}

#[derive(Default)]
struct TimerInner {
    task: Option<JoinHandle<()>>,
    notification: Option<NotificationId>,
    interval_minutes: Option<u32>,
}

impl TimerInner {
    fn abort_loop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.interval_minutes = None;
    }
}

pub struct PressureReliefTimer {
    remote: Arc<dyn RemoteStore>,
    notifications: Arc<dyn NotificationScheduler>,
    reminders: Arc<dyn ReminderSink>,
    clock: Arc<dyn Clock>,
    session: Session,
    config: TimerConfig,
    timeout: Duration,
    inner: Mutex<TimerInner>,
    remaining: Arc<watch::Sender<Option<u64>>>,
}

impl PressureReliefTimer {
    pub fn new(
        caps: &Capabilities,
        session: Session,
        config: TimerConfig,
        timeout: Duration,
    ) -> Self {
        let (remaining, _) = watch::channel(None);
        Self {
            remote: caps.remote.clone(),
            notifications: caps.notifications.clone(),
            reminders: caps.reminders.clone(),
            clock: caps.clock.clone(),
            session,
            config,
            timeout,
            inner: Mutex::new(TimerInner::default()),
            remaining: Arc::new(remaining),
        }
    }

    /// Seconds until the next reminder, `None` when no countdown runs.
    pub fn remaining(&self) -> Option<u64> {
        *self.remaining.borrow()
    }

    /// Receiver updated on every tick.
    pub fn watch(&self) -> watch::Receiver<Option<u64>> {
        self.remaining.subscribe()
    }

    pub async fn interval_minutes(&self) -> Option<u32> {
        self.inner.lock().await.interval_minutes
    }

    fn state_path(owner: &OwnerId) -> Result<DocumentPath, RemoteError> {
        DocumentPath::user(owner)?
            .collection(SETTINGS_COLLECTION)?
            .doc(TIMER_DOCUMENT)
    }

    /// Starts (or replaces) the countdown. The previous loop and platform
    /// notification are cancelled first.
    #[instrument(skip(self))]
    pub async fn start(&self, interval_minutes: u32) -> Result<(), TimerError> {
        if interval_minutes == 0 {
            return Err(TimerError::InvalidInterval {
                input: interval_minutes.to_string(),
            });
        }

        let mut inner = self.inner.lock().await;
        inner.abort_loop();
        if let Some(old) = inner.notification.take() {
            self.cancel_notification(&old).await;
        }
        self.remaining.send_replace(None);

        let now = self.clock.now();
        let period_secs = u64::from(interval_minutes) * 60;
        let notification = self.schedule_notification(interval_minutes, period_secs).await?;

        if let Some(owner) = self.session.owner() {
            let mut state = TimerState::running(interval_minutes, now);
            state.notification_id = notification.as_ref().map(|id| id.as_str().to_string());

            if let Err(e) = self.persist(owner, &state, SetMode::Overwrite).await {
                warn!(error = %e, "Failed to persist timer state");
                if let Some(id) = &notification {
                    self.cancel_notification(id).await;
                }
                return Err(e);
            }
        }

        inner.task = Some(self.spawn_loop(Countdown::start(period_secs, now), interval_minutes));
        inner.notification = notification;
        inner.interval_minutes = Some(interval_minutes);
        self.remaining.send_replace(Some(period_secs));

        info!(interval_minutes, "Pressure relief timer started");
        Ok(())
    }

    /// Cancels the countdown and platform notification and persists
    /// `isRunning: false`.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), TimerError> {
        let mut inner = self.inner.lock().await;
        inner.abort_loop();
        self.remaining.send_replace(None);

        let mut notification = inner.notification.take();
        if notification.is_none() {
            // A restarted process may not have resumed; fall back to the
            // persisted registration.
            if let Some(state) = self.load_state().await {
                notification = state.notification_id.map(NotificationId::new);
            }
        }
        if let Some(id) = notification {
            self.cancel_notification(&id).await;
        }

        if let Some(owner) = self.session.owner() {
            let mut fields = Fields::new();
            fields.insert("isRunning".into(), Value::Bool(false));
            fields.insert("notificationId".into(), Value::Null);
            let path = Self::state_path(owner).map_err(TimerError::Persist)?;
            remote_call(self.timeout, self.remote.set(&path, fields, SetMode::Merge))
                .await
                .map_err(TimerError::from_remote)?;
        }

        info!("Pressure relief timer stopped");
        Ok(())
    }

    /// Restores a countdown persisted by an earlier process. Returns the
    /// remaining seconds, or `None` (no countdown) when nothing is running
    /// or the stored state is absent, unreadable or malformed.
    #[instrument(skip(self))]
    pub async fn resume_on_launch(&self) -> Option<u64> {
        let state = self.load_state().await?;
        let Some((interval_minutes, started_at)) = state.active() else {
            debug!("Timer not running");
            return None;
        };

        let now = self.clock.now();
        let countdown = Countdown::resume(state.period_secs(), started_at, now);
        let remaining = countdown.remaining(now);

        let mut inner = self.inner.lock().await;
        inner.abort_loop();
        inner.notification = state.notification_id.map(NotificationId::new);
        inner.task = Some(self.spawn_loop(countdown, interval_minutes));
        inner.interval_minutes = Some(interval_minutes);
        self.remaining.send_replace(Some(remaining));

        info!(interval_minutes, remaining, "Pressure relief timer resumed");
        Some(remaining)
    }

    async fn load_state(&self) -> Option<TimerState> {
        let owner = self.session.owner()?;
        let path = Self::state_path(owner).ok()?;

        let document = match remote_call(self.timeout, self.remote.get(&path)).await {
            Ok(Some(document)) => document,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Failed to read timer state");
                return None;
            }
        };

        match serde_json::from_value::<TimerState>(Value::Object(document.fields)) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(error = %e, "Malformed timer state");
                None
            }
        }
    }

    async fn persist(
        &self,
        owner: &OwnerId,
        state: &TimerState,
        mode: SetMode,
    ) -> Result<(), TimerError> {
        let path = Self::state_path(owner).map_err(TimerError::Persist)?;
        let fields = match serde_json::to_value(state) {
            Ok(Value::Object(fields)) => fields,
            _ => {
                return Err(TimerError::Persist(RemoteError::Serialization {
                    message: "timer state must serialize to an object".into(),
                }))
            }
        };
        remote_call(self.timeout, self.remote.set(&path, fields, mode))
            .await
            .map_err(TimerError::from_remote)
    }

    /// Registers the repeating platform notification. A denied permission
    /// leaves only the in-app reminder.
    async fn schedule_notification(
        &self,
        interval_minutes: u32,
        period_secs: u64,
    ) -> Result<Option<NotificationId>, TimerError> {
        match ensure_permission(self.notifications.as_ref()).await {
            Ok(()) => {}
            Err(NotificationError::PermissionDenied) => {
                warn!("Notification permission denied, in-app reminders only");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let request = NotificationRequest {
            title: self.config.title.clone(),
            body: self.config.body(interval_minutes),
            trigger: Trigger::Interval {
                seconds: period_secs,
                repeats: true,
            },
            channel: self.config.channel.clone(),
        };
        let id = self.notifications.schedule(request).await?;
        Ok(Some(id))
    }

    async fn cancel_notification(&self, id: &NotificationId) {
        match self.notifications.cancel(id).await {
            Ok(()) | Err(NotificationError::NotFound { .. }) => {}
            Err(e) => warn!(error = %e, id = %id, "Failed to cancel notification"),
        }
    }

    fn spawn_loop(&self, mut countdown: Countdown, interval_minutes: u32) -> JoinHandle<()> {
        let clock = self.clock.clone();
        let reminders = self.reminders.clone();
        let remaining = self.remaining.clone();
        let tick = self.config.tick();
        let reminder = Reminder {
            title: self.config.title.clone(),
            body: self.config.body(interval_minutes),
            vibrate_ms: self.config.vibrate_ms,
        };

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let tick = countdown.poll(clock.now());
                if tick.due {
                    debug!("Pressure relief reminder due");
                    reminders.remind(&reminder);
                }
                remaining.send_replace(Some(tick.remaining_secs));
            }
        })
    }
}

impl Drop for PressureReliefTimer {
    fn drop(&mut self) {
        self.inner.get_mut().abort_loop();
    }
}
