use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, str::FromStr};

use crate::event::Document;

/// Free-form document fields, as stored remotely and in the local blob.
pub type Fields = Map<String, Value>;

pub const CREATED_AT_FIELD: &str = "createdAt";
pub const GUEST_OWNER: &str = "guest";

const MAX_ID_LENGTH: usize = 128;
const MAX_TEXT_LENGTH: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} is required")]
    Missing { field: &'static str },
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: i64,
        max: i64,
        value: i64,
    },
    #[error("{field} is too long ({len} > {max})")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Result<Self, ValidationError> {
                let s = s.into().trim().to_string();
                if s.is_empty() {
                    return Err(ValidationError::Missing {
                        field: stringify!($name),
                    });
                }
                if s.len() > MAX_ID_LENGTH {
                    return Err(ValidationError::TooLong {
                        field: stringify!($name),
                        len: s.len(),
                        max: MAX_ID_LENGTH,
                    });
                }
                if s.chars().any(|c| c.is_control() || c == '/') {
                    return Err(ValidationError::Invalid {
                        field: stringify!($name),
                        reason: "contains '/' or control characters".into(),
                    });
                }
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(OwnerId);
typed_id!(EntryId);

impl EntryId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl OwnerId {
    pub fn guest() -> Self {
        Self(GUEST_OWNER.to_string())
    }
}

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    pub fn plus_secs(self, secs: u64) -> Self {
        Self(self.0.saturating_add(secs.saturating_mul(1000)))
    }

    /// Whole seconds from `earlier` to `self`; zero if the clock went backwards.
    pub fn secs_since(self, earlier: UnixTimeMs) -> u64 {
        self.0.saturating_sub(earlier.0) / 1000
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_u64().map(Self)
    }
}

/// Who the app is acting for. Passed into every session-scoped service.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Session {
    #[default]
    SignedOut,
    SignedIn { owner: OwnerId },
}

impl Session {
    pub fn signed_in(owner: OwnerId) -> Self {
        Self::SignedIn { owner }
    }

    pub fn owner(&self) -> Option<&OwnerId> {
        match self {
            Self::SignedIn { owner } => Some(owner),
            Self::SignedOut => None,
        }
    }

    pub fn is_signed_in(&self) -> bool {
        matches!(self, Self::SignedIn { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Goal,
    Bladder,
    Pain,
    Mood,
}

impl Category {
    pub const ALL: [Category; 4] = [Self::Goal, Self::Bladder, Self::Pain, Self::Mood];

    /// Remote sub-collection name, also used as the local blob bucket key.
    pub const fn collection(self) -> &'static str {
        match self {
            Self::Goal => "goals",
            Self::Bladder => "bladderEntries",
            Self::Pain => "painLogs",
            Self::Mood => "mentalEntries",
        }
    }

    pub fn from_collection(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.collection() == name)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection())
    }
}

impl FromStr for Category {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(category) = Self::from_collection(s) {
            return Ok(category);
        }
        match s.to_ascii_lowercase().as_str() {
            "goal" => Ok(Self::Goal),
            "bladder" => Ok(Self::Bladder),
            "pain" => Ok(Self::Pain),
            "mood" => Ok(Self::Mood),
            _ => Err(ValidationError::Invalid {
                field: "category",
                reason: format!("unknown category '{s}'"),
            }),
        }
    }
}

/// One user-submitted record in a category.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: EntryId,
    pub category: Category,
    pub created_at: UnixTimeMs,
    pub fields: Fields,
}

impl LogEntry {
    /// Builds an entry from a remote document. Returns `None` when the
    /// document has no usable `createdAt` (e.g. a pending server timestamp).
    pub fn from_document(category: Category, document: &Document) -> Option<Self> {
        let id = EntryId::new(document.id()).ok()?;
        let mut fields = document.fields.clone();
        let created_at = fields
            .remove(CREATED_AT_FIELD)
            .as_ref()
            .and_then(UnixTimeMs::from_value)?;
        Some(Self {
            id,
            category,
            created_at,
            fields,
        })
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }
}

// --- Timer ---

/// Persisted description of the running pressure-relief reminder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerState {
    pub interval_minutes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<UnixTimeMs>,
    pub is_running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_id: Option<String>,
}

impl TimerState {
    pub fn running(interval_minutes: u32, started_at: UnixTimeMs) -> Self {
        Self {
            interval_minutes,
            started_at: Some(started_at),
            is_running: true,
            notification_id: None,
        }
    }

    /// Running state with its start time, or `None` if idle or malformed.
    pub fn active(&self) -> Option<(u32, UnixTimeMs)> {
        match (self.is_running, self.started_at) {
            (true, Some(started_at)) if self.interval_minutes > 0 => {
                Some((self.interval_minutes, started_at))
            }
            _ => None,
        }
    }

    pub fn period_secs(&self) -> u64 {
        u64::from(self.interval_minutes) * 60
    }
}

// --- Typed payloads ---

/// A category-specific record that can be written through the listener or
/// the local store.
pub trait EntryPayload: Serialize {
    const CATEGORY: Category;

    fn validate(&self) -> Result<(), ValidationError>;

    fn to_fields(&self) -> Result<Fields, ValidationError> {
        self.validate()?;
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) | Err(_) => Err(ValidationError::Invalid {
                field: "payload",
                reason: "payload must serialize to an object".into(),
            }),
        }
    }
}

fn require_text(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Missing { field });
    }
    if value.len() > MAX_TEXT_LENGTH {
        return Err(ValidationError::TooLong {
            field,
            len: value.len(),
            max: MAX_TEXT_LENGTH,
        });
    }
    Ok(())
}

fn require_scale(field: &'static str, value: u8) -> Result<(), ValidationError> {
    if !(1..=10).contains(&value) {
        return Err(ValidationError::OutOfRange {
            field,
            min: 1,
            max: 10,
            value: i64::from(value),
        });
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    pub text: String,
}

impl Goal {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into().trim().to_string(),
        }
    }
}

impl EntryPayload for Goal {
    const CATEGORY: Category = Category::Goal;

    fn validate(&self) -> Result<(), ValidationError> {
        require_text("text", &self.text)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BladderEntry {
    pub time: String,
}

impl EntryPayload for BladderEntry {
    const CATEGORY: Category = Category::Bladder;

    fn validate(&self) -> Result<(), ValidationError> {
        require_text("time", &self.time)?;
        crate::schedule::CatheterTime::from_str(&self.time).map(|_| ())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PainLog {
    #[serde(rename = "type")]
    pub pain_type: String,
    pub location: String,
    pub rating: u8,
}

impl EntryPayload for PainLog {
    const CATEGORY: Category = Category::Pain;

    fn validate(&self) -> Result<(), ValidationError> {
        require_text("type", &self.pain_type)?;
        require_text("location", &self.location)?;
        require_scale("rating", self.rating)
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MoodEntry {
    pub mood: u8,
    pub journal: String,
}

// Journal text is private; keep it out of logs.
impl fmt::Debug for MoodEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MoodEntry")
            .field("mood", &self.mood)
            .field("journal_len", &self.journal.len())
            .finish()
    }
}

impl EntryPayload for MoodEntry {
    const CATEGORY: Category = Category::Mood;

    fn validate(&self) -> Result<(), ValidationError> {
        require_scale("mood", self.mood)?;
        require_text("journal", &self.journal)
    }
}
