//! Journal routing: signed-out writes land in the local blob, signed-in
//! writes round-trip through the remote store and its live feed.

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde_json::json;
use shared::capabilities::{InMemoryRemoteStore, ScriptedHttpClient};
use shared::clock::ManualClock;
use shared::config::RetryPolicy;
use shared::journal::{Feed, Journal};
use shared::listener::SyncListener;
use shared::model::{Goal, MoodEntry, OwnerId, PainLog, UnixTimeMs};
use shared::offline_store::{LocalStore, NotificationTone, Preferences};
use shared::{App, Capabilities, Category, Config, ErrorKind, Session};

const START: UnixTimeMs = UnixTimeMs(1_700_000_000_000);

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        base_backoff_ms: 10,
        max_backoff_ms: 50,
        max_jitter_ms: 0,
        max_attempts: None,
    }
}

fn user() -> Session {
    Session::signed_in(OwnerId::new("u1").unwrap())
}

#[tokio::test]
async fn guest_entries_persist_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(START));
    let caps = Capabilities::in_memory(clock.clone());
    let config = Config {
        data_dir: dir.path().to_path_buf(),
        ..Config::default()
    };

    {
        let app = App::new(config.clone(), caps.clone(), Session::SignedOut);
        app.journal().record(&Goal::new("transfer to chair")).await.unwrap();
        clock.advance(Duration::from_secs(60));
        app.journal()
            .record(&PainLog {
                pain_type: "burning".into(),
                location: "lower back".into(),
                rating: 6,
            })
            .await
            .unwrap();
    }

    let app = App::new(config, caps, Session::SignedOut);
    let mut feed = app.journal().open(Category::Pain).unwrap();
    assert!(matches!(feed, Feed::Local(_)));
    let pain = feed.entries().await.unwrap();
    assert_eq!(pain.len(), 1);
    assert_eq!(pain[0].text("type"), Some("burning"));
    assert_eq!(pain[0].fields["rating"], json!(6));

    let raw = std::fs::read_to_string(dir.path().join("patient-guest.json")).unwrap();
    assert!(raw.contains("\n  \"goals\""), "blob should be pretty-printed");
}

#[tokio::test]
async fn guest_validation_errors_write_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let app = App::new(
        Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        },
        Capabilities::in_memory(Arc::new(ManualClock::new(START))),
        Session::SignedOut,
    );

    let err = app
        .journal()
        .record(&MoodEntry {
            mood: 11,
            journal: "great".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidInput);
    assert!(!dir.path().join("patient-guest.json").exists());
}

#[tokio::test]
async fn preferences_reset_on_clear() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path(), Arc::new(ManualClock::new(START)));

    store
        .save_preferences(&Preferences {
            reminders_enabled: false,
            notification_tone: NotificationTone::Bell,
        })
        .unwrap();
    store
        .append_payload(&OwnerId::guest(), &Goal::new("roll 1km"))
        .unwrap();

    store.clear(&OwnerId::guest()).unwrap();
    assert_eq!(store.preferences(), Preferences::default());
    assert!(store.read(&OwnerId::guest()).is_empty());
}

#[tokio::test]
async fn signed_in_add_appears_in_live_feed() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(START));
    let remote = Arc::new(InMemoryRemoteStore::new(clock.clone()));
    let listener = SyncListener::new(remote.clone(), user(), fast_retry(), Duration::from_secs(5));
    let journal = Journal::new(listener, Arc::new(LocalStore::new(dir.path(), clock.clone())));

    let mut feed = journal.open(Category::Goal).unwrap();
    assert!(feed.is_live());
    assert_eq!(feed.entries().await.unwrap(), vec![]);

    let first = journal.record(&Goal::new("first")).await.unwrap();
    clock.advance(Duration::from_secs(1));
    journal.record(&Goal::new("second")).await.unwrap();

    let mut latest = feed.entries().await.unwrap();
    while latest.len() < 2 {
        latest = feed.entries().await.unwrap();
    }
    let texts: Vec<_> = latest.iter().filter_map(|e| e.text("text")).collect();
    assert_eq!(texts, ["second", "first"]);

    journal.remove(Category::Goal, &first).await.unwrap();
    let after = feed.entries().await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].text("text"), Some("second"));

    // Signed-in writes never touch the local blob.
    assert!(journal.local().read(&OwnerId::guest()).is_empty());
}

#[tokio::test]
async fn live_feed_recovers_after_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(START));
    let remote = Arc::new(InMemoryRemoteStore::new(clock.clone()));
    let listener = SyncListener::new(remote.clone(), user(), fast_retry(), Duration::from_secs(5));
    let journal = Journal::new(listener, Arc::new(LocalStore::new(dir.path(), clock)));

    let mut feed = journal.open(Category::Mood).unwrap();
    assert!(feed.entries().await.unwrap().is_empty());

    remote.disconnect_listeners().await;
    journal
        .record(&MoodEntry {
            mood: 4,
            journal: "tired".into(),
        })
        .await
        .unwrap();

    let entries = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let entries = feed.entries().await.unwrap();
            if !entries.is_empty() {
                return entries;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(entries[0].fields["mood"], json!(4));
}

#[tokio::test]
async fn guest_summary_reads_local_blob() {
    let dir = tempfile::tempdir().unwrap();
    let http = Arc::new(ScriptedHttpClient::new());
    http.push_response(Ok(json!({
        "choices": [{"message": {"content":
            "{\"overview\": \"Consistent goal tracking.\", \"recommendations\": [\"Keep going\"]}"
        }}]
    })));
    let caps = Capabilities {
        http: http.clone(),
        ..Capabilities::in_memory(Arc::new(ManualClock::new(START)))
    };
    let app = App::new(
        Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        },
        caps,
        Session::SignedOut,
    );
    app.journal().record(&Goal::new("stand with frame")).await.unwrap();

    let summarizer = app
        .summarizer_with_key(SecretString::new("sk-test".into()))
        .unwrap();
    let summary = summarizer
        .summarize_blob(&app.local().read(&OwnerId::guest()))
        .await
        .unwrap();

    assert_eq!(summary.overview, "Consistent goal tracking.");
    assert_eq!(summary.recommendations, vec!["Keep going"]);
    let prompt = http.requests()[0].body["messages"][1]["content"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(prompt.contains("stand with frame"));
}
