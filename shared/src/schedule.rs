use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::capabilities::{
    ensure_permission, NotificationError, NotificationId, NotificationRequest,
    NotificationScheduler, Trigger,
};
use crate::journal::Journal;
use crate::model::{BladderEntry, EntryId, ValidationError};
use crate::AppResult;

/// Time of day for a catheterization, minute precision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CatheterTime {
    hour: u8,
    minute: u8,
}

impl CatheterTime {
    pub fn new(hour: u8, minute: u8) -> Result<Self, ValidationError> {
        if hour > 23 || minute > 59 {
            return Err(invalid("hour must be 0-23 and minute 0-59"));
        }
        Ok(Self { hour, minute })
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }
}

fn invalid(reason: &str) -> ValidationError {
    ValidationError::Invalid {
        field: "time",
        reason: reason.into(),
    }
}

fn parse_clock(text: &str) -> Result<(u8, u8), ValidationError> {
    let (h, m) = text
        .split_once(':')
        .ok_or_else(|| invalid("expected HH:MM"))?;
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(h) || h.len() > 2 || !digits(m) || m.len() != 2 {
        return Err(invalid("expected HH:MM"));
    }
    let hour = h.parse().map_err(|_| invalid("expected HH:MM"))?;
    let minute = m.parse().map_err(|_| invalid("expected HH:MM"))?;
    Ok((hour, minute))
}

/// Accepts `HH:MM` (24 hour) and `H:MM AM`/`H:MM PM` (case-insensitive,
/// space before the suffix optional).
impl FromStr for CatheterTime {
    type Err = ValidationError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let text = input.trim();
        if text.is_empty() {
            return Err(ValidationError::Missing { field: "time" });
        }

        let upper = text.to_ascii_uppercase();
        let meridiem = if upper.ends_with("AM") {
            Some(false)
        } else if upper.ends_with("PM") {
            Some(true)
        } else {
            None
        };

        match meridiem {
            None => {
                let (hour, minute) = parse_clock(text)?;
                Self::new(hour, minute)
            }
            Some(pm) => {
                let (hour, minute) = parse_clock(text[..text.len() - 2].trim_end())?;
                if !(1..=12).contains(&hour) {
                    return Err(invalid("12-hour times need an hour of 1-12"));
                }
                let hour = match (hour, pm) {
                    (12, false) => 0,
                    (12, true) => 12,
                    (h, false) => h,
                    (h, true) => h + 12,
                };
                Self::new(hour, minute)
            }
        }
    }
}

impl fmt::Display for CatheterTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = if self.hour < 12 { "AM" } else { "PM" };
        let hour = match self.hour % 12 {
            0 => 12,
            h => h,
        };
        write!(f, "{hour:02}:{:02} {suffix}", self.minute)
    }
}

impl TryFrom<String> for CatheterTime {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CatheterTime> for String {
    fn from(time: CatheterTime) -> Self {
        time.to_string()
    }
}

/// Daily catheterization schedule: each time is logged through the journal
/// and backed by one repeating daily notification.
pub struct BladderSchedule {
    journal: Arc<Journal>,
    notifications: Arc<dyn NotificationScheduler>,
    channel: String,
    armed: Mutex<Vec<(CatheterTime, NotificationId)>>,
}

impl BladderSchedule {
    pub fn new(
        journal: Arc<Journal>,
        notifications: Arc<dyn NotificationScheduler>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            journal,
            notifications,
            channel: channel.into(),
            armed: Mutex::new(Vec::new()),
        }
    }

    /// Parses and records a time, then arms its daily reminder.
    #[instrument(skip(self))]
    pub async fn add(&self, input: &str) -> AppResult<(EntryId, CatheterTime)> {
        let time: CatheterTime = input.parse()?;
        let id = self
            .journal
            .record(&BladderEntry {
                time: time.to_string(),
            })
            .await?;

        match self.arm(time).await {
            Ok(_) => {}
            Err(NotificationError::PermissionDenied) => {
                warn!(%time, "Notification permission denied, schedule not armed");
            }
            Err(e) => return Err(e.into()),
        }

        info!(%time, "Catheterization time added");
        Ok((id, time))
    }

    /// Schedules the daily notification for `time` unless one is already
    /// armed. Returns the id of the new registration.
    pub async fn arm(&self, time: CatheterTime) -> Result<Option<NotificationId>, NotificationError> {
        let mut armed = self.armed.lock().await;
        if armed.iter().any(|(t, _)| *t == time) {
            return Ok(None);
        }

        ensure_permission(self.notifications.as_ref()).await?;
        let id = self
            .notifications
            .schedule(NotificationRequest {
                title: "Catheterization reminder".into(),
                body: format!("Scheduled catheterization at {time}"),
                trigger: Trigger::Daily {
                    hour: time.hour(),
                    minute: time.minute(),
                },
                channel: self.channel.clone(),
            })
            .await?;

        armed.push((time, id.clone()));
        armed.sort_by_key(|(t, _)| *t);
        Ok(Some(id))
    }

    /// Cancels every armed reminder.
    pub async fn disarm(&self) -> Result<(), NotificationError> {
        let mut armed = self.armed.lock().await;
        for (time, id) in armed.drain(..) {
            match self.notifications.cancel(&id).await {
                Ok(()) | Err(NotificationError::NotFound { .. }) => {}
                Err(e) => warn!(%time, error = %e, "Failed to cancel bladder reminder"),
            }
        }
        Ok(())
    }

    /// Armed times in time-of-day order.
    pub async fn armed(&self) -> Vec<CatheterTime> {
        self.armed.lock().await.iter().map(|(t, _)| *t).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{InMemoryRemoteStore, PermissionState, RecordingScheduler};
    use crate::clock::ManualClock;
    use crate::config::RetryPolicy;
    use crate::listener::SyncListener;
    use crate::model::{Category, OwnerId, Session, UnixTimeMs};
    use crate::offline_store::LocalStore;
    use crate::ErrorKind;
    use std::time::Duration;

    fn t(s: &str) -> CatheterTime {
        s.parse().unwrap()
    }

    #[test]
    fn parses_24_hour() {
        assert_eq!(t("08:30"), CatheterTime::new(8, 30).unwrap());
        assert_eq!(t("8:30"), CatheterTime::new(8, 30).unwrap());
        assert_eq!(t("23:59"), CatheterTime::new(23, 59).unwrap());
        assert_eq!(t("00:00"), CatheterTime::new(0, 0).unwrap());
    }

    #[test]
    fn parses_12_hour() {
        assert_eq!(t("08:30 AM"), CatheterTime::new(8, 30).unwrap());
        assert_eq!(t("8:30pm"), CatheterTime::new(20, 30).unwrap());
        assert_eq!(t("12:05 AM"), CatheterTime::new(0, 5).unwrap());
        assert_eq!(t("12:45 PM"), CatheterTime::new(12, 45).unwrap());
    }

    #[test]
    fn rejects_malformed_times() {
        for bad in ["", "  ", "24:00", "8", "8:5", "08:60", "13:00 PM", "0:30 AM", "ab:cd", "8:30 XM"] {
            assert!(bad.parse::<CatheterTime>().is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn displays_as_12_hour_clock() {
        assert_eq!(t("8:05").to_string(), "08:05 AM");
        assert_eq!(t("00:15").to_string(), "12:15 AM");
        assert_eq!(t("12:00").to_string(), "12:00 PM");
        assert_eq!(t("21:40").to_string(), "09:40 PM");
    }

    #[test]
    fn display_round_trips() {
        let time = t("17:25");
        assert_eq!(t(&time.to_string()), time);
        let json = serde_json::to_string(&time).unwrap();
        assert_eq!(json, "\"05:25 PM\"");
        assert_eq!(serde_json::from_str::<CatheterTime>(&json).unwrap(), time);
    }

    fn schedule(
        dir: &std::path::Path,
        scheduler: Arc<RecordingScheduler>,
    ) -> BladderSchedule {
        let clock = Arc::new(ManualClock::new(UnixTimeMs(1_700_000_000_000)));
        let remote = Arc::new(InMemoryRemoteStore::new(clock.clone()));
        let listener = SyncListener::new(
            remote,
            Session::signed_in(OwnerId::new("u1").unwrap()),
            RetryPolicy::default(),
            Duration::from_secs(15),
        );
        let journal = Arc::new(Journal::new(listener, Arc::new(LocalStore::new(dir, clock))));
        BladderSchedule::new(journal, scheduler, "bladder")
    }

    #[tokio::test]
    async fn add_records_and_arms_daily_reminder() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Arc::new(RecordingScheduler::new());
        let schedule = schedule(dir.path(), scheduler.clone());

        let (_, time) = schedule.add("8:30 pm").await.unwrap();
        assert_eq!(time.to_string(), "08:30 PM");

        let pending = scheduler.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1.channel, "bladder");
        assert_eq!(pending[0].1.trigger, Trigger::Daily { hour: 20, minute: 30 });

        let entries = schedule.journal.recent(Category::Bladder, 10).await.unwrap();
        assert_eq!(entries[0].text("time"), Some("08:30 PM"));
    }

    #[tokio::test]
    async fn duplicate_time_arms_once() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Arc::new(RecordingScheduler::new());
        let schedule = schedule(dir.path(), scheduler.clone());

        schedule.add("07:00").await.unwrap();
        schedule.add("7:00 AM").await.unwrap();
        schedule.add("06:15").await.unwrap();

        assert_eq!(scheduler.pending().len(), 2);
        assert_eq!(schedule.armed().await, vec![t("06:15"), t("07:00")]);
    }

    #[tokio::test]
    async fn disarm_cancels_everything() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Arc::new(RecordingScheduler::new());
        let schedule = schedule(dir.path(), scheduler.clone());
        schedule.add("07:00").await.unwrap();
        schedule.add("19:00").await.unwrap();

        schedule.disarm().await.unwrap();
        assert!(scheduler.pending().is_empty());
        assert!(schedule.armed().await.is_empty());
    }

    #[tokio::test]
    async fn denied_permission_still_records() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Arc::new(RecordingScheduler::with_permission(PermissionState::Denied));
        let schedule = schedule(dir.path(), scheduler.clone());

        schedule.add("09:00").await.unwrap();
        assert!(scheduler.pending().is_empty());
        assert_eq!(schedule.journal.recent(Category::Bladder, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_time_is_input_error() {
        let dir = tempfile::tempdir().unwrap();
        let schedule = schedule(dir.path(), Arc::new(RecordingScheduler::new()));
        let err = schedule.add("25:00").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }
}
