#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod billing;
pub mod capabilities;
pub mod clock;
pub mod config;
pub mod event;
pub mod journal;
pub mod listener;
pub mod model;
pub mod offline_store;
pub mod relay;
pub mod schedule;
pub mod summary;
pub mod timer;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::billing::BillingError;
use crate::capabilities::{CapabilityError, HttpError, NotificationError, RemoteError};
use crate::config::ConfigError;
use crate::listener::SyncError;
use crate::model::ValidationError;
use crate::offline_store::StoreError;
use crate::relay::RelayError;
use crate::summary::SummaryError;
use crate::timer::TimerError;

pub use app::App;
pub use capabilities::Capabilities;
pub use config::Config;
pub use model::{Category, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidInput,
    Unauthenticated,
    Write,
    Read,
    NotFound,
    Parse,
    Timeout,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::InvalidInput => "INVALID_INPUT",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::Write => "WRITE_ERROR",
            Self::Read => "READ_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Parse => "PARSE_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Write | Self::Read | Self::Timeout => ErrorSeverity::Transient,
            Self::InvalidInput | Self::Unauthenticated | Self::NotFound | Self::Parse => {
                ErrorSeverity::Permanent
            }
            Self::Internal => ErrorSeverity::Fatal,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Write | Self::Read | Self::Timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Downgrades a transient error to permanent when the source says a
    /// retry cannot help.
    #[must_use]
    fn retryable_if(self, retryable: bool) -> Self {
        if !retryable && matches!(self.severity, ErrorSeverity::Transient) {
            return self.with_severity(ErrorSeverity::Permanent);
        }
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && matches!(self.severity, ErrorSeverity::Transient)
    }

    /// Alert text for the user. Input errors carry their own message; the
    /// rest use fixed wording so internal details never reach the UI.
    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::InvalidInput => self.message.clone(),
            ErrorKind::Unauthenticated => "Please sign in to continue.".into(),
            ErrorKind::Write => "Couldn't save your changes. Please try again.".into(),
            ErrorKind::Read => {
                "Couldn't load your data. Please check your connection and try again.".into()
            }
            ErrorKind::NotFound => "The requested item could not be found.".into(),
            ErrorKind::Parse => {
                "We couldn't understand the response. Please try again.".into()
            }
            ErrorKind::Timeout => "The request timed out. Please try again.".into(),
            ErrorKind::Internal => {
                "An unexpected error occurred. Please try again or contact support.".into()
            }
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<ValidationError> for AppError {
    fn from(e: ValidationError) -> Self {
        AppError::new(ErrorKind::InvalidInput, e.to_string())
    }
}

impl From<RemoteError> for AppError {
    fn from(e: RemoteError) -> Self {
        let retryable = e.is_retryable();
        let kind = match &e {
            RemoteError::NotFound { .. } => ErrorKind::NotFound,
            RemoteError::InvalidPath { .. } => ErrorKind::InvalidInput,
            RemoteError::PermissionDenied { .. } => ErrorKind::Unauthenticated,
            RemoteError::Timeout { .. } => ErrorKind::Timeout,
            RemoteError::Serialization { .. } => ErrorKind::Parse,
            RemoteError::Unavailable { .. } | RemoteError::Storage { .. } => ErrorKind::Write,
        };
        AppError::new(kind, "Remote store request failed")
            .with_internal(e.to_string())
            .retryable_if(retryable)
    }
}

impl From<NotificationError> for AppError {
    fn from(e: NotificationError) -> Self {
        let retryable = e.is_retryable();
        let kind = match &e {
            NotificationError::Timeout => ErrorKind::Timeout,
            NotificationError::NotFound { .. } => ErrorKind::NotFound,
            NotificationError::NotAvailable
            | NotificationError::PermissionDenied
            | NotificationError::ScheduleFailed { .. }
            | NotificationError::Unknown { .. } => ErrorKind::Write,
        };
        AppError::new(kind, "Couldn't schedule the reminder")
            .with_internal(e.to_string())
            .retryable_if(retryable)
    }
}

impl From<HttpError> for AppError {
    fn from(e: HttpError) -> Self {
        let retryable = e.is_retryable();
        let kind = match &e {
            HttpError::Timeout { .. } => ErrorKind::Timeout,
            HttpError::HttpStatus { status: 401 | 403, .. } => ErrorKind::Unauthenticated,
            HttpError::HttpStatus { status: 404, .. } => ErrorKind::NotFound,
            HttpError::HttpStatus { .. } | HttpError::ConnectionError { .. } => ErrorKind::Read,
            HttpError::InvalidResponse { .. } | HttpError::SerializationError { .. } => {
                ErrorKind::Parse
            }
            HttpError::InvalidUrl { .. } | HttpError::PrivateNetworkBlocked { .. } => {
                ErrorKind::Internal
            }
        };
        let mut error = AppError::new(kind, "Request failed")
            .with_internal(e.to_string())
            .retryable_if(retryable);
        if let HttpError::HttpStatus { status, .. } = e {
            error = error.with_context("http_status", status.to_string());
        }
        error
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Invalid(v) => v.into(),
            StoreError::Serialization(message) => {
                AppError::new(ErrorKind::Parse, "Local data is unreadable").with_internal(message)
            }
            StoreError::Io(io) => AppError::new(ErrorKind::Write, "Couldn't save data locally")
                .with_internal(io.to_string()),
            StoreError::StoreTooLarge { size, max } => {
                AppError::new(ErrorKind::Write, "Local storage is full")
                    .with_severity(ErrorSeverity::Permanent)
                    .with_context("size", size.to_string())
                    .with_context("max", max.to_string())
            }
        }
    }
}

impl From<SyncError> for AppError {
    fn from(e: SyncError) -> Self {
        let retryable = e.is_retryable();
        match e {
            SyncError::Unauthenticated => {
                AppError::new(ErrorKind::Unauthenticated, "Not signed in")
            }
            SyncError::Invalid(v) => v.into(),
            SyncError::Write(r) => AppError::new(ErrorKind::Write, "Couldn't save the entry")
                .with_internal(r.to_string())
                .retryable_if(retryable),
            SyncError::Read(r) => AppError::new(ErrorKind::Read, "Couldn't load entries")
                .with_internal(r.to_string())
                .retryable_if(retryable),
            SyncError::NotFound { path } => {
                AppError::new(ErrorKind::NotFound, "Entry not found").with_context("path", path)
            }
            SyncError::Timeout { timeout_ms } => {
                AppError::new(ErrorKind::Timeout, "Remote call timed out")
                    .with_context("timeout_ms", timeout_ms.to_string())
            }
        }
    }
}

impl From<TimerError> for AppError {
    fn from(e: TimerError) -> Self {
        let retryable = e.is_retryable();
        match e {
            TimerError::InvalidInterval { input } => AppError::new(
                ErrorKind::InvalidInput,
                "Enter a positive number of minutes",
            )
            .with_context("input", input),
            TimerError::Persist(r) => AppError::new(ErrorKind::Write, "Couldn't save the timer")
                .with_internal(r.to_string())
                .retryable_if(retryable),
            TimerError::Notification(n) => n.into(),
            TimerError::Timeout { timeout_ms } => {
                AppError::new(ErrorKind::Timeout, "Remote call timed out")
                    .with_context("timeout_ms", timeout_ms.to_string())
            }
        }
    }
}

impl From<SummaryError> for AppError {
    fn from(e: SummaryError) -> Self {
        match e {
            SummaryError::InvalidInput(message) => AppError::new(ErrorKind::InvalidInput, message),
            SummaryError::Http(h) => h.into(),
            SummaryError::Encode(message) => {
                AppError::new(ErrorKind::Internal, "Couldn't prepare the summary request")
                    .with_internal(message)
            }
        }
    }
}

impl From<RelayError> for AppError {
    fn from(e: RelayError) -> Self {
        let retryable = e.is_retryable();
        match e {
            RelayError::Unauthenticated => {
                AppError::new(ErrorKind::Unauthenticated, "Not signed in")
            }
            RelayError::Invalid(v) => v.into(),
            RelayError::PatientNotFound { phone } => {
                AppError::new(ErrorKind::NotFound, "patient not found").with_context("phone", phone)
            }
            RelayError::Remote(r) => r.into(),
            RelayError::Sms(s) => AppError::new(ErrorKind::Write, "Couldn't send the SMS")
                .with_internal(s.message)
                .retryable_if(retryable),
        }
    }
}

impl From<BillingError> for AppError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::Unauthenticated => {
                AppError::new(ErrorKind::Unauthenticated, "Sign in to subscribe")
            }
            BillingError::Http(h) => h.into(),
            BillingError::IncompleteSheet { field } => {
                AppError::new(ErrorKind::Parse, "Payment setup failed")
                    .with_context("missing", field)
            }
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::new(ErrorKind::Internal, "Configuration error").with_internal(e.to_string())
    }
}

impl From<CapabilityError> for AppError {
    fn from(e: CapabilityError) -> Self {
        match e {
            CapabilityError::Http(h) => h.into(),
            CapabilityError::Remote(r) => r.into(),
            CapabilityError::Notification(n) => n.into(),
        }
    }
}

pub mod app {
    use std::sync::Arc;

    use secrecy::SecretString;
    use tracing::{info, instrument, warn};

    use super::AppResult;
    use crate::billing::Billing;
    use crate::capabilities::Capabilities;
    use crate::config::{secret_from_env, Config};
    use crate::journal::Journal;
    use crate::listener::SyncListener;
    use crate::model::Session;
    use crate::offline_store::LocalStore;
    use crate::relay::{CaregiverChat, CaregiverRelay, PhoneNumber, SmsGateway};
    use crate::schedule::BladderSchedule;
    use crate::summary::{CompletionClient, Summarizer};
    use crate::timer::{parse_interval, PressureReliefTimer};

    /// Composition root the shell holds for the lifetime of the process.
    /// Session-scoped services are rebuilt by [`App::set_session`].
    pub struct App {
        config: Config,
        caps: Capabilities,
        session: Session,
        local: Arc<LocalStore>,
        journal: Arc<Journal>,
        timer: PressureReliefTimer,
        schedule: BladderSchedule,
    }

    impl App {
        pub fn new(config: Config, caps: Capabilities, session: Session) -> Self {
            let local = Arc::new(LocalStore::new(config.data_dir.clone(), caps.clock.clone()));
            let (journal, timer, schedule) = Self::session_services(&config, &caps, &session, &local);
            Self {
                config,
                caps,
                session,
                local,
                journal,
                timer,
                schedule,
            }
        }

        fn session_services(
            config: &Config,
            caps: &Capabilities,
            session: &Session,
            local: &Arc<LocalStore>,
        ) -> (Arc<Journal>, PressureReliefTimer, BladderSchedule) {
            let listener = SyncListener::new(
                caps.remote.clone(),
                session.clone(),
                config.retry.clone(),
                config.request_timeout(),
            );
            let journal = Arc::new(Journal::new(listener, local.clone()));
            let timer = PressureReliefTimer::new(
                caps,
                session.clone(),
                config.timer.clone(),
                config.request_timeout(),
            );
            let schedule = BladderSchedule::new(
                journal.clone(),
                caps.notifications.clone(),
                config.relay.bladder_channel.clone(),
            );
            (journal, timer, schedule)
        }

        /// Restores launch-time state. Returns the resumed countdown, if any.
        #[instrument(skip_all, fields(signed_in = self.session.is_signed_in()))]
        pub async fn launch(&self) -> Option<u64> {
            let remaining = self.timer.resume_on_launch().await;
            info!(resumed = remaining.is_some(), "App launched");
            remaining
        }

        /// Swaps the identity every service runs under. When the owner
        /// changes the running timer is stopped first, since the new
        /// session cannot reach the old owner's notification or state.
        /// Subscriptions stop with the services that owned them.
        #[instrument(skip_all, fields(signed_in = session.is_signed_in()))]
        pub async fn set_session(&mut self, session: Session) {
            if self.session.owner() != session.owner() {
                if let Err(e) = self.timer.stop().await {
                    warn!(error = %e, "Failed to stop timer of previous session");
                }
            }

            let (journal, timer, schedule) =
                Self::session_services(&self.config, &self.caps, &session, &self.local);
            self.journal = journal;
            self.timer = timer;
            self.schedule = schedule;
            self.session = session;
            info!(signed_in = self.session.is_signed_in(), "Session changed");
        }

        pub fn session(&self) -> &Session {
            &self.session
        }

        pub fn config(&self) -> &Config {
            &self.config
        }

        pub fn local(&self) -> &LocalStore {
            &self.local
        }

        pub fn journal(&self) -> &Journal {
            &self.journal
        }

        pub fn timer(&self) -> &PressureReliefTimer {
            &self.timer
        }

        pub fn schedule(&self) -> &BladderSchedule {
            &self.schedule
        }

        /// Starts the timer from the interval text field.
        pub async fn start_timer(&self, input: &str) -> AppResult<()> {
            let minutes = parse_interval(input)?;
            Ok(self.timer.start(minutes).await?)
        }

        /// Builds a summarizer with the key named by the config.
        pub fn summarizer(&self) -> AppResult<Summarizer> {
            let key = self.config.completion.api_key()?;
            self.summarizer_with_key(key)
        }

        pub fn summarizer_with_key(&self, api_key: SecretString) -> AppResult<Summarizer> {
            let client = CompletionClient::new(
                self.caps.http.clone(),
                self.config.completion.clone(),
                api_key,
            )?;
            Ok(Summarizer::new(client))
        }

        pub fn billing(&self) -> AppResult<Billing> {
            let key = self
                .config
                .billing
                .api_key_env
                .as_deref()
                .map(secret_from_env)
                .transpose()?;
            Ok(Billing::new(
                self.caps.http.clone(),
                self.session.clone(),
                &self.config.billing,
                key,
            )?)
        }

        pub fn caregiver_chat(&self, caregiver_phone: &str) -> AppResult<CaregiverChat> {
            Ok(CaregiverChat::new(
                self.caps.remote.clone(),
                self.session.clone(),
                PhoneNumber::parse(caregiver_phone)?,
                self.config.retry.clone(),
                self.config.request_timeout(),
            ))
        }

        /// Backend-side relay bridging chat documents and SMS.
        pub fn relay(&self, sms: Arc<dyn SmsGateway>) -> AppResult<CaregiverRelay> {
            Ok(CaregiverRelay::new(
                self.caps.remote.clone(),
                sms,
                PhoneNumber::parse(&self.config.relay.from_number)?,
                self.config.request_timeout(),
            ))
        }
    }
}
