use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, instrument};

use crate::clock::Clock;
use crate::event::{Document, Snapshot};
use crate::model::{Fields, OwnerId};

pub const MAX_SEGMENT_LENGTH: usize = 512;
pub const USERS_COLLECTION: &str = "users";

pub type SnapshotStream = mpsc::UnboundedReceiver<Result<Snapshot, RemoteError>>;

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum RemoteError {
    #[error("document not found: {path}")]
    NotFound { path: String },

    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("permission denied: {path}")]
    PermissionDenied { path: String },

    #[error("service unavailable: {message}")]
    Unavailable { message: String },

    #[error("operation timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("serialization error: {message}")]
    Serialization { message: String },

    #[error("storage error: {message} (code: {code:?}, retryable: {retryable})")]
    Storage {
        code: StorageErrorCode,
        message: String,
        retryable: bool,
    },
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Storage { retryable, .. } => *retryable,
            RemoteError::Unavailable { .. } | RemoteError::Timeout { .. } => true,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound { .. })
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        let retryable = code.is_retryable();
        Self::Storage {
            code,
            message: message.into(),
            retryable,
        }
    }

    fn invalid(path: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: truncate_path(path),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unknown,
    ConnectionLost,
    QuotaExceeded,
    Aborted,
    Internal,
}

impl StorageErrorCode {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageErrorCode::ConnectionLost | StorageErrorCode::Aborted
        )
    }
}

fn truncate_path(path: &str) -> String {
    if path.len() <= 100 {
        path.to_string()
    } else {
        let mut end = 100;
        while !path.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &path[..end])
    }
}

fn validate_segment(path: &str, segment: &str) -> Result<(), RemoteError> {
    if segment.is_empty() {
        return Err(RemoteError::invalid(path, "path segments cannot be empty"));
    }

    if segment.len() > MAX_SEGMENT_LENGTH {
        return Err(RemoteError::invalid(
            path,
            format!("segment exceeds maximum length of {} bytes", MAX_SEGMENT_LENGTH),
        ));
    }

    if segment.trim().is_empty() {
        return Err(RemoteError::invalid(path, "segment cannot be only whitespace"));
    }

    if segment == "." || segment.contains("..") {
        return Err(RemoteError::invalid(
            path,
            "segment cannot contain path traversal sequences",
        ));
    }

    if segment.chars().any(char::is_control) {
        return Err(RemoteError::invalid(path, "segment contains control characters"));
    }

    Ok(())
}

fn split_path(path: &str) -> Result<Vec<String>, RemoteError> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(RemoteError::invalid(path, "path cannot be empty"));
    }
    trimmed
        .split('/')
        .map(|segment| {
            validate_segment(path, segment)?;
            Ok(segment.to_string())
        })
        .collect()
}

/// Path to a collection: an odd number of segments (`users/u1/goals`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionPath {
    segments: Vec<String>,
}

impl CollectionPath {
    pub fn parse(path: &str) -> Result<Self, RemoteError> {
        let segments = split_path(path)?;
        if segments.len() % 2 == 0 {
            return Err(RemoteError::invalid(
                path,
                "collection paths need an odd number of segments",
            ));
        }
        Ok(Self { segments })
    }

    /// `users/{owner}/{name}`
    pub fn user(owner: &OwnerId, name: &str) -> Result<Self, RemoteError> {
        DocumentPath::user(owner)?.collection(name)
    }

    pub fn doc(&self, id: &str) -> Result<DocumentPath, RemoteError> {
        validate_segment(&self.raw(), id)?;
        Ok(self.child(id))
    }

    pub(crate) fn child(&self, id: &str) -> DocumentPath {
        let mut segments = self.segments.clone();
        segments.push(id.to_string());
        DocumentPath { segments }
    }

    /// Last segment; collection-group queries match on it.
    pub fn name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    pub fn parent(&self) -> Option<DocumentPath> {
        if self.segments.len() < 3 {
            return None;
        }
        Some(DocumentPath {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn raw(&self) -> String {
        self.segments.join("/")
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw())
    }
}

/// Path to a document: an even number of segments (`users/u1/goals/abc`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentPath {
    segments: Vec<String>,
}

impl DocumentPath {
    pub fn parse(path: &str) -> Result<Self, RemoteError> {
        let segments = split_path(path)?;
        if segments.len() % 2 != 0 {
            return Err(RemoteError::invalid(
                path,
                "document paths need an even number of segments",
            ));
        }
        Ok(Self { segments })
    }

    /// `users/{owner}`
    pub fn user(owner: &OwnerId) -> Result<Self, RemoteError> {
        CollectionPath::parse(USERS_COLLECTION)?.doc(owner.as_str())
    }

    pub fn collection(&self, name: &str) -> Result<CollectionPath, RemoteError> {
        validate_segment(&self.raw(), name)?;
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Ok(CollectionPath { segments })
    }

    pub fn id(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    pub fn parent(&self) -> CollectionPath {
        CollectionPath {
            segments: self.segments[..self.segments.len().saturating_sub(1)].to_vec(),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn raw(&self) -> String {
        self.segments.join("/")
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw())
    }
}

/// A document to append to a collection. When `server_timestamp` names a
/// field, the store fills it with its own clock at commit time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDocument {
    pub fields: Fields,
    pub server_timestamp: Option<String>,
}

impl NewDocument {
    pub fn new(fields: Fields) -> Self {
        Self {
            fields,
            server_timestamp: None,
        }
    }

    pub fn stamped(mut self, field: impl Into<String>) -> Self {
        self.server_timestamp = Some(field.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    Overwrite,
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub collection: CollectionPath,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(collection: CollectionPath) -> Self {
        Self {
            collection,
            order_by: None,
            limit: None,
        }
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Remote document database. The backend owns ordering and timestamps;
/// callers trust what it returns.
#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync {
    async fn add(
        &self,
        collection: &CollectionPath,
        document: NewDocument,
    ) -> Result<DocumentPath, RemoteError>;

    async fn set(&self, path: &DocumentPath, fields: Fields, mode: SetMode)
        -> Result<(), RemoteError>;

    async fn get(&self, path: &DocumentPath) -> Result<Option<Document>, RemoteError>;

    async fn delete(&self, path: &DocumentPath) -> Result<(), RemoteError>;

    /// First document in any collection named `group` whose `field` equals `value`.
    async fn find_in_group(
        &self,
        group: &str,
        field: &str,
        value: &Value,
    ) -> Result<Option<Document>, RemoteError>;

    /// Live query. Each item is the full ordered result set; the stream ends
    /// when the backend drops the listener.
    async fn listen(&self, query: Query) -> Result<SnapshotStream, RemoteError>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

struct StoredDocument {
    fields: Fields,
    seq: u64,
}

struct CollectionState {
    path: CollectionPath,
    docs: BTreeMap<String, StoredDocument>,
}

struct LiveQuery {
    query: Query,
    last: Vec<Document>,
    tx: mpsc::UnboundedSender<Result<Snapshot, RemoteError>>,
}

#[derive(Default)]
struct MemoryState {
    collections: HashMap<String, CollectionState>,
    listeners: Vec<LiveQuery>,
    next_seq: u64,
    last_stamp: u64,
}

impl MemoryState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn collection_mut(&mut self, path: &CollectionPath) -> &mut CollectionState {
        self.collections
            .entry(path.raw())
            .or_insert_with(|| CollectionState {
                path: path.clone(),
                docs: BTreeMap::new(),
            })
    }

    fn notify(&mut self, collection: &CollectionPath) {
        let MemoryState {
            collections,
            listeners,
            ..
        } = self;

        listeners.retain_mut(|live| {
            if live.query.collection != *collection {
                return !live.tx.is_closed();
            }
            let current = run_query(collections, &live.query);
            let snapshot = Snapshot::diff(&live.last, current.clone());
            if snapshot.changes.is_empty() {
                return true;
            }
            live.last = current;
            live.tx.send(Ok(snapshot)).is_ok()
        });
    }
}

fn compare_values(a: &Value, b: &Value) -> CmpOrdering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(CmpOrdering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn run_query(collections: &HashMap<String, CollectionState>, query: &Query) -> Vec<Document> {
    let Some(collection) = collections.get(&query.collection.raw()) else {
        return Vec::new();
    };

    let mut docs: Vec<(&String, &StoredDocument)> = match &query.order_by {
        // Ordering by a field excludes documents that lack it.
        Some(order) => collection
            .docs
            .iter()
            .filter(|(_, d)| d.fields.contains_key(&order.field))
            .collect(),
        None => collection.docs.iter().collect(),
    };

    match &query.order_by {
        Some(order) => docs.sort_by(|(_, a), (_, b)| {
            let ord = match (a.fields.get(&order.field), b.fields.get(&order.field)) {
                (Some(x), Some(y)) => compare_values(x, y),
                _ => CmpOrdering::Equal,
            }
            .then(a.seq.cmp(&b.seq));
            match order.direction {
                Direction::Ascending => ord,
                Direction::Descending => ord.reverse(),
            }
        }),
        None => docs.sort_by_key(|(_, d)| d.seq),
    }

    let limit = query.limit.unwrap_or(usize::MAX);
    docs.into_iter()
        .take(limit)
        .map(|(id, stored)| Document {
            path: collection.path.child(id),
            fields: stored.fields.clone(),
        })
        .collect()
}

/// Complete in-process document store. Used by tests and by shells running
/// without a backend.
pub struct InMemoryRemoteStore {
    clock: Arc<dyn Clock>,
    state: RwLock<MemoryState>,
    online: AtomicBool,
}

impl InMemoryRemoteStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: RwLock::new(MemoryState::default()),
            online: AtomicBool::new(true),
        }
    }

    /// While offline, writes, reads and new listens fail with a retryable
    /// `Unavailable` error.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Drops every live listener, ending their streams.
    pub async fn disconnect_listeners(&self) {
        let mut state = self.state.write().await;
        debug!(count = state.listeners.len(), "Dropping live listeners");
        state.listeners.clear();
    }

    pub async fn listener_count(&self) -> usize {
        let mut state = self.state.write().await;
        state.listeners.retain(|l| !l.tx.is_closed());
        state.listeners.len()
    }

    pub async fn documents(&self, collection: &CollectionPath) -> Vec<Document> {
        let state = self.state.read().await;
        run_query(&state.collections, &Query::new(collection.clone()))
    }

    fn ensure_online(&self) -> Result<(), RemoteError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Unavailable {
                message: "backend unreachable".into(),
            })
        }
    }
}

#[async_trait::async_trait]
impl RemoteStore for InMemoryRemoteStore {
    #[instrument(skip_all, fields(collection = %collection))]
    async fn add(
        &self,
        collection: &CollectionPath,
        document: NewDocument,
    ) -> Result<DocumentPath, RemoteError> {
        self.ensure_online()?;

        let id = uuid::Uuid::new_v4().simple().to_string();
        let mut state = self.state.write().await;

        let mut fields = document.fields;
        if let Some(field) = document.server_timestamp {
            let stamp = self.clock.now().0.max(state.last_stamp);
            state.last_stamp = stamp;
            fields.insert(field, Value::from(stamp));
        }

        let seq = state.next_seq();
        state
            .collection_mut(collection)
            .docs
            .insert(id.clone(), StoredDocument { fields, seq });
        state.notify(collection);

        Ok(collection.child(&id))
    }

    #[instrument(skip_all, fields(path = %path))]
    async fn set(
        &self,
        path: &DocumentPath,
        fields: Fields,
        mode: SetMode,
    ) -> Result<(), RemoteError> {
        self.ensure_online()?;

        let collection = path.parent();
        let mut state = self.state.write().await;
        let seq = state.next_seq();
        let docs = &mut state.collection_mut(&collection).docs;

        match (docs.get_mut(path.id()), mode) {
            (Some(existing), SetMode::Merge) => existing.fields.extend(fields),
            (Some(existing), SetMode::Overwrite) => existing.fields = fields,
            (None, _) => {
                docs.insert(path.id().to_string(), StoredDocument { fields, seq });
            }
        }
        state.notify(&collection);

        Ok(())
    }

    async fn get(&self, path: &DocumentPath) -> Result<Option<Document>, RemoteError> {
        self.ensure_online()?;

        let state = self.state.read().await;
        Ok(state
            .collections
            .get(&path.parent().raw())
            .and_then(|c| c.docs.get(path.id()))
            .map(|stored| Document {
                path: path.clone(),
                fields: stored.fields.clone(),
            }))
    }

    #[instrument(skip_all, fields(path = %path))]
    async fn delete(&self, path: &DocumentPath) -> Result<(), RemoteError> {
        self.ensure_online()?;

        let collection = path.parent();
        let mut state = self.state.write().await;
        let removed = state
            .collections
            .get_mut(&collection.raw())
            .and_then(|c| c.docs.remove(path.id()));

        if removed.is_none() {
            return Err(RemoteError::NotFound { path: path.raw() });
        }
        state.notify(&collection);

        Ok(())
    }

    async fn find_in_group(
        &self,
        group: &str,
        field: &str,
        value: &Value,
    ) -> Result<Option<Document>, RemoteError> {
        self.ensure_online()?;

        let state = self.state.read().await;
        let found = state
            .collections
            .values()
            .filter(|c| c.path.name() == group)
            .flat_map(|c| c.docs.iter().map(move |(id, d)| (c, id, d)))
            .filter(|(_, _, d)| d.fields.get(field) == Some(value))
            .min_by_key(|(_, _, d)| d.seq)
            .map(|(c, id, d)| Document {
                path: c.path.child(id),
                fields: d.fields.clone(),
            });

        Ok(found)
    }

    #[instrument(skip_all, fields(collection = %query.collection))]
    async fn listen(&self, query: Query) -> Result<SnapshotStream, RemoteError> {
        self.ensure_online()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.write().await;

        let current = run_query(&state.collections, &query);
        let snapshot = Snapshot::diff(&[], current.clone());
        // The receiver is still in scope, so the initial send cannot fail.
        let _ = tx.send(Ok(snapshot));

        state.listeners.push(LiveQuery {
            query,
            last: current,
            tx,
        });

        Ok(rx)
    }
}
