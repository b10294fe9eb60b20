//! Timer lifecycle across simulated process restarts, driven through the
//! public API with a shared in-memory store standing in for the backend.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use shared::capabilities::{
    DocumentPath, InMemoryRemoteStore, RecordingReminderSink, RecordingScheduler, RemoteStore,
    ScriptedHttpClient, Trigger,
};
use shared::clock::ManualClock;
use shared::config::TimerConfig;
use shared::model::{OwnerId, TimerState, UnixTimeMs};
use shared::timer::PressureReliefTimer;
use shared::{App, Capabilities, Config, Session};

const START: UnixTimeMs = UnixTimeMs(1_700_000_000_000);
const TIMEOUT: Duration = Duration::from_secs(15);

struct Backend {
    clock: Arc<ManualClock>,
    remote: Arc<InMemoryRemoteStore>,
    scheduler: Arc<RecordingScheduler>,
}

impl Backend {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(START));
        Self {
            remote: Arc::new(InMemoryRemoteStore::new(clock.clone())),
            scheduler: Arc::new(RecordingScheduler::new()),
            clock,
        }
    }

    /// Capabilities for one "process": store and scheduler persist across
    /// processes, the in-app reminder sink does not.
    fn process(&self) -> (Capabilities, Arc<RecordingReminderSink>) {
        let sink = Arc::new(RecordingReminderSink::new());
        let caps = Capabilities {
            remote: self.remote.clone(),
            notifications: self.scheduler.clone(),
            reminders: sink.clone(),
            http: Arc::new(ScriptedHttpClient::new()),
            clock: self.clock.clone(),
        };
        (caps, sink)
    }

    async fn state(&self) -> Option<TimerState> {
        let path = DocumentPath::parse("users/u1/settings/pressureTimer").unwrap();
        let doc = self.remote.get(&path).await.unwrap()?;
        Some(serde_json::from_value(Value::Object(doc.fields)).unwrap())
    }
}

fn user() -> Session {
    Session::signed_in(OwnerId::new("u1").unwrap())
}

fn timer(caps: &Capabilities, session: Session) -> PressureReliefTimer {
    PressureReliefTimer::new(caps, session, TimerConfig::default(), TIMEOUT)
}

#[tokio::test]
async fn restart_45_minutes_into_30_minute_interval_shows_15_minutes() {
    let backend = Backend::new();

    {
        let (caps, _) = backend.process();
        let first = timer(&caps, user());
        first.start(30).await.unwrap();
        assert_eq!(first.remaining(), Some(1_800));
    }

    backend.clock.advance(Duration::from_secs(45 * 60));

    let (caps, _) = backend.process();
    let second = timer(&caps, user());
    assert_eq!(second.resume_on_launch().await, Some(900));
    assert_eq!(second.remaining(), Some(900));
    assert_eq!(second.interval_minutes().await, Some(30));

    // The platform registration made by the first process is still the only one.
    let pending = backend.scheduler.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(
        pending[0].1.trigger,
        Trigger::Interval {
            seconds: 1_800,
            repeats: true
        }
    );
    assert_eq!(pending[0].1.body, "Time to shift weight! (30 min)");
}

#[tokio::test]
async fn stop_after_restart_cancels_persisted_notification() {
    let backend = Backend::new();
    {
        let (caps, _) = backend.process();
        timer(&caps, user()).start(20).await.unwrap();
    }
    let id = backend.state().await.unwrap().notification_id.unwrap();

    let (caps, _) = backend.process();
    let restarted = timer(&caps, user());
    restarted.stop().await.unwrap();

    assert!(backend.scheduler.pending().is_empty());
    assert_eq!(backend.scheduler.cancelled().len(), 1);
    assert_eq!(backend.scheduler.cancelled()[0].as_str(), id);

    let state = backend.state().await.unwrap();
    assert!(!state.is_running);
    assert_eq!(state.notification_id, None);
    assert_eq!(restarted.resume_on_launch().await, None);
}

#[tokio::test]
async fn restart_replaces_previous_interval() {
    let backend = Backend::new();
    let (caps, _) = backend.process();
    let timer = timer(&caps, user());

    timer.start(30).await.unwrap();
    backend.clock.advance(Duration::from_secs(600));
    timer.start(10).await.unwrap();

    let state = backend.state().await.unwrap();
    assert_eq!(state.interval_minutes, 10);
    assert_eq!(state.started_at, Some(START.plus_secs(600)));
    assert_eq!(backend.scheduler.pending().len(), 1);
    assert_eq!(timer.remaining(), Some(600));
}

#[tokio::test]
async fn signed_out_timer_does_not_survive_restart() {
    let backend = Backend::new();
    {
        let (caps, _) = backend.process();
        let t = timer(&caps, Session::SignedOut);
        t.start(15).await.unwrap();
        assert_eq!(t.remaining(), Some(900));
    }
    assert!(backend.state().await.is_none());

    let (caps, _) = backend.process();
    assert_eq!(timer(&caps, Session::SignedOut).resume_on_launch().await, None);
}

#[tokio::test]
async fn app_launch_resumes_timer() {
    let backend = Backend::new();
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        data_dir: dir.path().to_path_buf(),
        ..Config::default()
    };

    {
        let (caps, _) = backend.process();
        let app = App::new(config.clone(), caps, user());
        app.start_timer(" 30 ").await.unwrap();
    }

    backend.clock.advance(Duration::from_secs(29 * 60 + 30));
    let (caps, _) = backend.process();
    let app = App::new(config, caps, user());
    assert_eq!(app.launch().await, Some(30));
}
