use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{
    CollectionPath, Direction, NewDocument, Query, RemoteError, RemoteStore,
};
use crate::config::RetryPolicy;
use crate::event::Snapshot;
use crate::model::{
    Category, EntryId, EntryPayload, Fields, LogEntry, OwnerId, Session, ValidationError,
    CREATED_AT_FIELD,
};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    #[error("no signed-in session")]
    Unauthenticated,

    #[error("invalid entry: {0}")]
    Invalid(#[from] ValidationError),

    #[error("write failed: {0}")]
    Write(RemoteError),

    #[error("read failed: {0}")]
    Read(RemoteError),

    #[error("entry not found: {path}")]
    NotFound { path: String },

    #[error("remote call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Write(e) | SyncError::Read(e) => e.is_retryable(),
            SyncError::Timeout { .. } => true,
            _ => false,
        }
    }

    pub(crate) fn from_write(e: RemoteError) -> Self {
        match e {
            RemoteError::Timeout { timeout_ms } => SyncError::Timeout { timeout_ms },
            RemoteError::NotFound { path } => SyncError::NotFound { path },
            other => SyncError::Write(other),
        }
    }

    pub(crate) fn from_read(e: RemoteError) -> Self {
        match e {
            RemoteError::Timeout { timeout_ms } => SyncError::Timeout { timeout_ms },
            other => SyncError::Read(other),
        }
    }
}

/// Bounds a remote call by `timeout`; expiry becomes `RemoteError::Timeout`.
pub(crate) async fn remote_call<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or(Err(RemoteError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }))
}

#[derive(Debug, Clone)]
enum Emission<T> {
    Waiting,
    Ready(T),
    Failed(SyncError),
}

/// Cancellable handle to a live query. Each item replaces the previous one
/// wholesale, so only the latest unread snapshot is kept. Dropping the
/// handle cancels the query.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: watch::Receiver<Emission<T>>,
    task: JoinHandle<()>,
}

impl<T: Clone> Subscription<T> {
    /// Latest unread snapshot, waiting for one if needed. `None` once the
    /// subscription has ended; [`Subscription::error`] tells why.
    pub async fn next(&mut self) -> Option<T> {
        loop {
            if self.rx.changed().await.is_err() {
                return None;
            }
            match &*self.rx.borrow_and_update() {
                Emission::Ready(value) => return Some(value.clone()),
                Emission::Failed(_) => return None,
                Emission::Waiting => {}
            }
        }
    }

    pub fn try_next(&mut self) -> Option<T> {
        if !self.rx.has_changed().unwrap_or(false) {
            return None;
        }
        match &*self.rx.borrow_and_update() {
            Emission::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }
}

impl<T> Subscription<T> {
    /// The error that ended the subscription, if it gave up.
    pub fn error(&self) -> Option<SyncError> {
        match &*self.rx.borrow() {
            Emission::Failed(e) => Some(e.clone()),
            _ => None,
        }
    }

    pub fn cancel(&mut self) {
        self.task.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Runs `query` until cancelled, re-listening with backoff whenever the
/// stream fails with a retryable error or ends. A non-retryable error or
/// running out of attempts ends the subscription with that error.
pub(crate) fn spawn_live_query<T, F>(
    remote: Arc<dyn RemoteStore>,
    query: Query,
    retry: RetryPolicy,
    timeout: Duration,
    map: F,
) -> Subscription<T>
where
    T: Send + Sync + 'static,
    F: Fn(Snapshot) -> T + Send + 'static,
{
    let (tx, rx) = watch::channel(Emission::Waiting);
    let collection = query.collection.to_string();

    let task = tokio::spawn(async move {
        let mut attempt: u32 = 0;

        loop {
            let error = match remote_call(timeout, remote.listen(query.clone())).await {
                Ok(mut stream) => loop {
                    tokio::select! {
                        item = stream.recv() => match item {
                            Some(Ok(snapshot)) => {
                                attempt = 0;
                                if tx.send(Emission::Ready(map(snapshot))).is_err() {
                                    return;
                                }
                            }
                            Some(Err(e)) => break e,
                            None => break RemoteError::Unavailable {
                                message: "listener disconnected".into(),
                            },
                        },
                        _ = tx.closed() => return,
                    }
                },
                Err(e) => e,
            };

            if !error.is_retryable() {
                warn!(%collection, %error, "Live query failed, not retrying");
                tx.send_replace(Emission::Failed(SyncError::from_read(error)));
                return;
            }

            let Some(delay) = retry.delay_for(attempt) else {
                warn!(%collection, attempts = attempt, "Live query retries exhausted");
                tx.send_replace(Emission::Failed(SyncError::from_read(error)));
                return;
            };
            attempt = attempt.saturating_add(1);
            debug!(
                %collection,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting live query"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = tx.closed() => return,
            }
        }
    });

    Subscription { rx, task }
}

/// Mirrors a signed-in user's category collections, newest first.
#[derive(Clone)]
pub struct SyncListener {
    remote: Arc<dyn RemoteStore>,
    session: Session,
    retry: RetryPolicy,
    timeout: Duration,
}

impl SyncListener {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        session: Session,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            remote,
            session,
            retry,
            timeout,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn owner(&self) -> Result<&OwnerId, SyncError> {
        self.session.owner().ok_or(SyncError::Unauthenticated)
    }

    fn collection(&self, category: Category) -> Result<CollectionPath, SyncError> {
        let owner = self.owner()?;
        CollectionPath::user(owner, category.collection()).map_err(SyncError::Write)
    }

    /// Live, restartable stream of the category's full list ordered by
    /// `createdAt` descending. Documents still missing a timestamp are
    /// skipped.
    #[instrument(skip_all, fields(category = %category))]
    pub fn subscribe(&self, category: Category) -> Result<Subscription<Vec<LogEntry>>, SyncError> {
        let collection = self.collection(category)?;
        let query = Query::new(collection).order_by(CREATED_AT_FIELD, Direction::Descending);

        info!("Subscribing");
        Ok(spawn_live_query(
            self.remote.clone(),
            query,
            self.retry.clone(),
            self.timeout,
            move |snapshot| {
                snapshot
                    .documents
                    .iter()
                    .filter_map(|doc| LogEntry::from_document(category, doc))
                    .collect()
            },
        ))
    }

    /// Appends one entry with a server-assigned `createdAt`. Nothing is
    /// inserted locally; the subscription re-emits once the write lands.
    #[instrument(skip_all, fields(category = %category))]
    pub async fn add(&self, category: Category, mut fields: Fields) -> Result<EntryId, SyncError> {
        let collection = self.collection(category)?;
        fields.remove(CREATED_AT_FIELD);

        let document = NewDocument::new(fields).stamped(CREATED_AT_FIELD);
        let path = remote_call(self.timeout, self.remote.add(&collection, document))
            .await
            .map_err(SyncError::from_write)?;

        debug!(id = path.id(), "Entry written");
        Ok(EntryId::new(path.id())?)
    }

    pub async fn add_entry<P: EntryPayload + Sync>(&self, payload: &P) -> Result<EntryId, SyncError> {
        let fields = payload.to_fields()?;
        self.add(P::CATEGORY, fields).await
    }

    #[instrument(skip_all, fields(category = %category, id = %id))]
    pub async fn remove(&self, category: Category, id: &EntryId) -> Result<(), SyncError> {
        let path = self
            .collection(category)?
            .doc(id.as_str())
            .map_err(SyncError::Write)?;

        remote_call(self.timeout, self.remote.delete(&path))
            .await
            .map_err(SyncError::from_write)
    }
}
