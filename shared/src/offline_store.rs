use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::clock::Clock;
use crate::model::{
    Category, EntryId, EntryPayload, Fields, LogEntry, OwnerId, UnixTimeMs, ValidationError,
    CREATED_AT_FIELD,
};

const MAX_BLOB_BYTES: u64 = 10 * 1024 * 1024;
const PREFERENCES_FILE: &str = "preferences.json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid entry: {0}")]
    Invalid(#[from] ValidationError),

    #[error("store too large: {size} bytes, max {max}")]
    StoreTooLarge { size: u64, max: u64 },
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// One locally stored record: `{id, createdAt, ...fields}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub id: EntryId,
    #[serde(rename = "createdAt", default)]
    pub created_at: UnixTimeMs,
    #[serde(flatten)]
    pub fields: Fields,
}

/// On-disk record shape; files written before ids existed omit `id`.
#[derive(Deserialize)]
struct StoredRecord {
    #[serde(default)]
    id: Option<EntryId>,
    #[serde(rename = "createdAt", default)]
    created_at: UnixTimeMs,
    #[serde(flatten)]
    fields: Fields,
}

impl StoredRecord {
    /// Records without an id get one derived from their timestamp and
    /// position, so repeated reads of an unchanged file agree. The next
    /// write persists it.
    fn into_record(self, index: usize) -> LocalRecord {
        let id = self.id.unwrap_or_else(|| legacy_id(self.created_at, index));
        LocalRecord {
            id,
            created_at: self.created_at,
            fields: self.fields,
        }
    }
}

fn legacy_id(created_at: UnixTimeMs, index: usize) -> EntryId {
    EntryId::new(format!("legacy-{}-{index}", created_at.0)).unwrap_or_else(|_| EntryId::generate())
}

/// Per-owner offline ledger, keyed by category collection name
/// (`goals`, `painLogs`, ...).
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct LocalBlob {
    buckets: BTreeMap<String, Vec<LocalRecord>>,
}

impl<'de> Deserialize<'de> for LocalBlob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let stored = BTreeMap::<String, Vec<StoredRecord>>::deserialize(deserializer)?;
        let buckets = stored
            .into_iter()
            .map(|(name, records)| {
                let records = records
                    .into_iter()
                    .enumerate()
                    .map(|(index, record)| record.into_record(index))
                    .collect();
                (name, records)
            })
            .collect();
        Ok(Self { buckets })
    }
}

impl LocalBlob {
    pub fn records(&self, category: Category) -> &[LocalRecord] {
        self.buckets
            .get(category.collection())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn len(&self, category: Category) -> usize {
        self.records(category).len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(Vec::is_empty)
    }

    /// Entries of one category, newest first. Equal timestamps keep the
    /// later-appended record first.
    pub fn entries(&self, category: Category) -> Vec<LogEntry> {
        let mut entries: Vec<LogEntry> = self
            .records(category)
            .iter()
            .rev()
            .map(|record| LogEntry {
                id: record.id.clone(),
                category,
                created_at: record.created_at,
                fields: record.fields.clone(),
            })
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries
    }

    pub fn to_pretty_json(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn push(&mut self, category: Category, record: LocalRecord) {
        self.buckets
            .entry(category.collection().to_string())
            .or_default()
            .push(record);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationTone {
    #[default]
    Default,
    Chime,
    Bell,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Preferences {
    pub reminders_enabled: bool,
    pub notification_tone: NotificationTone,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            reminders_enabled: true,
            notification_tone: NotificationTone::Default,
        }
    }
}

/// File-backed fallback store used when no remote session exists.
/// Single writer per process; callers serialize access.
pub struct LocalStore {
    root: PathBuf,
    clock: Arc<dyn Clock>,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: root.into(),
            clock,
        }
    }

    pub fn path_for(&self, owner: &OwnerId) -> PathBuf {
        self.root.join(format!("patient-{owner}.json"))
    }

    /// Returns the owner's blob. Missing, unreadable or corrupt files read
    /// as an empty blob.
    #[instrument(skip_all, fields(owner = %owner))]
    pub fn read(&self, owner: &OwnerId) -> LocalBlob {
        match load_blob(&self.path_for(owner)) {
            Ok(blob) => blob,
            Err(e) => {
                warn!(error = %e, "Local blob unreadable, treating as empty");
                LocalBlob::default()
            }
        }
    }

    /// Appends `{id, createdAt: now, ...fields}` to the category bucket and
    /// rewrites the whole blob.
    #[instrument(skip_all, fields(owner = %owner, category = %category))]
    pub fn append(
        &self,
        owner: &OwnerId,
        category: Category,
        mut fields: Fields,
    ) -> Result<LocalRecord, StoreError> {
        let path = self.path_for(owner);
        let mut blob = match load_blob(&path) {
            Ok(blob) => blob,
            Err(e @ StoreError::StoreTooLarge { .. }) => return Err(e),
            Err(e) => {
                warn!(error = %e, "Replacing unreadable local blob");
                LocalBlob::default()
            }
        };

        fields.remove("id");
        fields.remove(CREATED_AT_FIELD);
        let record = LocalRecord {
            id: EntryId::generate(),
            created_at: self.clock.now(),
            fields,
        };
        blob.push(category, record.clone());

        std::fs::create_dir_all(&self.root)?;
        write_atomic(&path, blob.to_pretty_json()?.as_bytes())?;
        debug!(count = blob.len(category), "Appended local record");

        Ok(record)
    }

    pub fn append_payload<P: EntryPayload>(
        &self,
        owner: &OwnerId,
        payload: &P,
    ) -> Result<LocalRecord, StoreError> {
        let fields = payload.to_fields()?;
        self.append(owner, P::CATEGORY, fields)
    }

    /// Deletes one record. Returns `false` when no record had that id.
    #[instrument(skip_all, fields(owner = %owner, category = %category, id = %id))]
    pub fn remove(
        &self,
        owner: &OwnerId,
        category: Category,
        id: &EntryId,
    ) -> Result<bool, StoreError> {
        let path = self.path_for(owner);
        let mut blob = load_blob(&path)?;

        let Some(records) = blob.buckets.get_mut(category.collection()) else {
            return Ok(false);
        };
        let before = records.len();
        records.retain(|record| &record.id != id);
        if records.len() == before {
            return Ok(false);
        }

        write_atomic(&path, blob.to_pretty_json()?.as_bytes())?;
        Ok(true)
    }

    /// Removes the owner's blob and resets preferences to defaults.
    #[instrument(skip_all, fields(owner = %owner))]
    pub fn clear(&self, owner: &OwnerId) -> Result<(), StoreError> {
        for path in [self.path_for(owner), self.root.join(PREFERENCES_FILE)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!("Cleared local data");
        Ok(())
    }

    pub fn preferences(&self) -> Preferences {
        let path = self.root.join(PREFERENCES_FILE);
        match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "Corrupt preferences, using defaults");
                Preferences::default()
            }),
            Err(_) => Preferences::default(),
        }
    }

    pub fn save_preferences(&self, preferences: &Preferences) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.root)?;
        let raw = serde_json::to_string_pretty(preferences)?;
        write_atomic(&self.root.join(PREFERENCES_FILE), raw.as_bytes())
    }
}

fn check_size(path: &Path) -> Result<(), StoreError> {
    let size = std::fs::metadata(path)?.len();
    if size > MAX_BLOB_BYTES {
        return Err(StoreError::StoreTooLarge {
            size,
            max: MAX_BLOB_BYTES,
        });
    }
    Ok(())
}

fn load_blob(path: &Path) -> Result<LocalBlob, StoreError> {
    if !path.exists() {
        return Ok(LocalBlob::default());
    }
    check_size(path)?;

    let raw = std::fs::read_to_string(path)?;
    if raw.trim().is_empty() {
        return Ok(LocalBlob::default());
    }
    Ok(serde_json::from_str(&raw)?)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp_path = path.with_extension("tmp");

    let mut file = File::create(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;

    std::fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{Goal, PainLog};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    fn owner() -> OwnerId {
        OwnerId::new("user-1").unwrap()
    }

    fn store(root: &Path) -> (Arc<ManualClock>, LocalStore) {
        let clock = Arc::new(ManualClock::new(UnixTimeMs(1_700_000_000_000)));
        (clock.clone(), LocalStore::new(root, clock))
    }

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn read_without_writes_is_empty() {
        let dir = tempdir().unwrap();
        let (_, store) = store(dir.path());
        let blob = store.read(&owner());
        assert!(blob.is_empty());
        assert_eq!(blob.len(Category::Goal), 0);
    }

    #[test]
    fn append_adds_exactly_one_entry() {
        let dir = tempdir().unwrap();
        let (_, store) = store(dir.path());
        let before = store.read(&owner()).len(Category::Goal);

        store
            .append(&owner(), Category::Goal, fields(json!({"text": "walk 10m"})))
            .unwrap();

        let blob = store.read(&owner());
        assert_eq!(blob.len(Category::Goal), before + 1);
        assert_eq!(blob.records(Category::Goal)[0].fields["text"], "walk 10m");
    }

    #[test]
    fn file_is_pretty_json_keyed_by_collection() {
        let dir = tempdir().unwrap();
        let (_, store) = store(dir.path());
        store
            .append_payload(
                &owner(),
                &PainLog {
                    pain_type: "Neuropathic".into(),
                    location: "Lower back".into(),
                    rating: 5,
                },
            )
            .unwrap();

        let path = dir.path().join("patient-user-1.json");
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains('\n'));
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let record = &value["painLogs"][0];
        assert_eq!(record["type"], "Neuropathic");
        assert_eq!(record["createdAt"], 1_700_000_000_000u64);
        assert!(record["id"].is_string());
    }

    #[test]
    fn corrupt_file_reads_as_empty() {
        let dir = tempdir().unwrap();
        let (_, store) = store(dir.path());
        std::fs::write(store.path_for(&owner()), b"{not json").unwrap();

        assert!(store.read(&owner()).is_empty());

        store
            .append(&owner(), Category::Goal, fields(json!({"text": "again"})))
            .unwrap();
        assert_eq!(store.read(&owner()).len(Category::Goal), 1);
    }

    #[test]
    fn records_without_id_get_one() {
        let dir = tempdir().unwrap();
        let (_, store) = store(dir.path());
        std::fs::write(
            store.path_for(&owner()),
            br#"{"goals": [{"createdAt": 5, "text": "old"}]}"#,
        )
        .unwrap();

        let blob = store.read(&owner());
        let record = &blob.records(Category::Goal)[0];
        assert!(!record.id.as_str().is_empty());
        assert_eq!(record.created_at, UnixTimeMs(5));
        assert_eq!(store.read(&owner()).records(Category::Goal)[0].id, record.id);

        assert!(store.remove(&owner(), Category::Goal, &record.id).unwrap());
        assert!(store.read(&owner()).is_empty());
    }

    #[test]
    fn ids_of_old_records_survive_removing_a_sibling() {
        let dir = tempdir().unwrap();
        let (_, store) = store(dir.path());
        std::fs::write(
            store.path_for(&owner()),
            br#"{"goals": [{"createdAt": 5, "text": "a"}, {"createdAt": 5, "text": "b"}]}"#,
        )
        .unwrap();

        let before = store.read(&owner());
        let [first, second] = before.records(Category::Goal) else {
            panic!("expected two records");
        };
        assert_ne!(first.id, second.id);

        assert!(store.remove(&owner(), Category::Goal, &first.id).unwrap());
        let after = store.read(&owner());
        assert_eq!(after.records(Category::Goal), std::slice::from_ref(second));
        assert!(std::fs::read_to_string(store.path_for(&owner()))
            .unwrap()
            .contains(second.id.as_str()));
    }

    #[test]
    fn entries_are_newest_first() {
        let dir = tempdir().unwrap();
        let (clock, store) = store(dir.path());
        for text in ["first", "second", "third"] {
            store.append_payload(&owner(), &Goal::new(text)).unwrap();
            clock.advance(Duration::from_secs(1));
        }

        let texts: Vec<_> = store
            .read(&owner())
            .entries(Category::Goal)
            .iter()
            .map(|e| e.text("text").unwrap().to_string())
            .collect();
        assert_eq!(texts, ["third", "second", "first"]);
    }

    #[test]
    fn append_strips_reserved_keys() {
        let dir = tempdir().unwrap();
        let (_, store) = store(dir.path());
        let record = store
            .append(
                &owner(),
                Category::Goal,
                fields(json!({"text": "x", "createdAt": 1, "id": "forged"})),
            )
            .unwrap();
        assert_ne!(record.id.as_str(), "forged");
        assert!(!record.fields.contains_key("createdAt"));
    }

    #[test]
    fn invalid_payload_is_rejected() {
        let dir = tempdir().unwrap();
        let (_, store) = store(dir.path());
        let result = store.append_payload(&owner(), &Goal::new("   "));
        assert!(matches!(result, Err(StoreError::Invalid(_))));
        assert!(!store.path_for(&owner()).exists());
    }

    #[test]
    fn atomic_write_leaves_no_tmp_on_success() {
        let dir = tempdir().unwrap();
        let (_, store) = store(dir.path());
        store.append_payload(&owner(), &Goal::new("x")).unwrap();

        let path = store.path_for(&owner());
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn remove_deletes_by_id() {
        let dir = tempdir().unwrap();
        let (_, store) = store(dir.path());
        let keep = store.append_payload(&owner(), &Goal::new("keep")).unwrap();
        let drop = store.append_payload(&owner(), &Goal::new("drop")).unwrap();

        assert!(store.remove(&owner(), Category::Goal, &drop.id).unwrap());
        assert!(!store.remove(&owner(), Category::Goal, &drop.id).unwrap());

        let blob = store.read(&owner());
        assert_eq!(blob.len(Category::Goal), 1);
        assert_eq!(blob.records(Category::Goal)[0].id, keep.id);
    }

    #[test]
    fn owners_are_isolated() {
        let dir = tempdir().unwrap();
        let (_, store) = store(dir.path());
        store.append_payload(&owner(), &Goal::new("mine")).unwrap();
        assert!(store.read(&OwnerId::guest()).is_empty());
    }

    #[test]
    fn clear_resets_blob_and_preferences() {
        let dir = tempdir().unwrap();
        let (_, store) = store(dir.path());
        store.append_payload(&owner(), &Goal::new("x")).unwrap();
        store
            .save_preferences(&Preferences {
                reminders_enabled: false,
                notification_tone: NotificationTone::Bell,
            })
            .unwrap();
        assert!(!store.preferences().reminders_enabled);

        store.clear(&owner()).unwrap();
        assert!(store.read(&owner()).is_empty());
        assert_eq!(store.preferences(), Preferences::default());

        // Clearing twice is fine.
        store.clear(&owner()).unwrap();
    }
}
