use std::sync::Arc;

use tracing::{debug, instrument};

use crate::capabilities::RemoteError;
use crate::listener::{Subscription, SyncError, SyncListener};
use crate::model::{Category, EntryId, EntryPayload, LogEntry, OwnerId, Session};
use crate::offline_store::LocalStore;
use crate::{AppError, AppResult, ErrorKind};

/// What a category screen renders: a live remote mirror when signed in,
/// otherwise a one-off read of the local blob.
#[derive(Debug)]
pub enum Feed {
    Live(Subscription<Vec<LogEntry>>),
    Local(Vec<LogEntry>),
}

impl Feed {
    pub fn is_live(&self) -> bool {
        matches!(self, Feed::Live(_))
    }

    /// Current entries: the next live emission, or the local list.
    pub async fn entries(&mut self) -> Option<Vec<LogEntry>> {
        match self {
            Feed::Live(sub) => sub.next().await,
            Feed::Local(entries) => Some(entries.clone()),
        }
    }
}

/// Routes log writes to the remote store when signed in and to the local
/// blob (owner `guest`) otherwise. Guest entries stay local.
#[derive(Clone)]
pub struct Journal {
    listener: SyncListener,
    local: Arc<LocalStore>,
}

impl Journal {
    pub fn new(listener: SyncListener, local: Arc<LocalStore>) -> Self {
        Self { listener, local }
    }

    pub fn session(&self) -> &Session {
        self.listener.session()
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    fn guest() -> OwnerId {
        OwnerId::guest()
    }

    #[instrument(skip_all, fields(category = %P::CATEGORY))]
    pub async fn record<P: EntryPayload + Sync>(&self, payload: &P) -> AppResult<EntryId> {
        if self.session().is_signed_in() {
            return Ok(self.listener.add_entry(payload).await?);
        }

        let record = self.local.append_payload(&Self::guest(), payload)?;
        debug!("Recorded locally");
        Ok(record.id)
    }

    pub fn open(&self, category: Category) -> AppResult<Feed> {
        if self.session().is_signed_in() {
            return Ok(Feed::Live(self.listener.subscribe(category)?));
        }
        Ok(Feed::Local(self.local.read(&Self::guest()).entries(category)))
    }

    #[instrument(skip_all, fields(category = %category, id = %id))]
    pub async fn remove(&self, category: Category, id: &EntryId) -> AppResult<()> {
        if self.session().is_signed_in() {
            return Ok(self.listener.remove(category, id).await?);
        }

        if self.local.remove(&Self::guest(), category, id)? {
            Ok(())
        } else {
            Err(AppError::new(ErrorKind::NotFound, "Entry not found")
                .with_context("id", id.as_str()))
        }
    }

    /// Newest `limit` entries of a category, read once. A live read waits
    /// at most the request timeout for its first snapshot.
    #[instrument(skip_all, fields(category = %category))]
    pub async fn recent(&self, category: Category, limit: usize) -> AppResult<Vec<LogEntry>> {
        let mut entries = match self.open(category)? {
            Feed::Live(mut sub) => {
                let timeout = self.listener.timeout();
                let first = tokio::time::timeout(timeout, sub.next()).await;
                sub.cancel();
                match first {
                    Ok(Some(entries)) => entries,
                    Ok(None) => {
                        let error = sub.error().unwrap_or_else(|| {
                            SyncError::Read(RemoteError::Unavailable {
                                message: "live query ended".into(),
                            })
                        });
                        return Err(error.into());
                    }
                    Err(_) => {
                        return Err(SyncError::Timeout {
                            timeout_ms: timeout.as_millis() as u64,
                        }
                        .into())
                    }
                }
            }
            Feed::Local(entries) => entries,
        };
        entries.truncate(limit);
        Ok(entries)
    }
}
