use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{
    CollectionPath, Direction, DocumentPath, NewDocument, Query, RemoteError, RemoteStore,
    USERS_COLLECTION,
};
use crate::config::RetryPolicy;
use crate::listener::{remote_call, spawn_live_query, Subscription};
use crate::model::{EntryId, Fields, OwnerId, Session, UnixTimeMs, ValidationError};

pub const CHATS_COLLECTION: &str = "caregiverChats";
pub const MESSAGES_COLLECTION: &str = "messages";
pub const PROFILE_GROUP: &str = "profile";
pub const CAREGIVER_PHONE_FIELD: &str = "caregiverPhone";
pub const TS_FIELD: &str = "ts";
/// Empty TwiML reply acknowledging an inbound SMS webhook.
pub const TWIML_ACK: &str = "<Response></Response>";

const MAX_MESSAGE_LENGTH: usize = 1600;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RelayError {
    #[error("no signed-in session")]
    Unauthenticated,

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("no patient has caregiver phone {phone}")]
    PatientNotFound { phone: String },

    #[error("remote store error: {0}")]
    Remote(#[from] RemoteError),

    #[error("SMS delivery failed: {0}")]
    Sms(#[from] SmsError),
}

impl RelayError {
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::Remote(e) => e.is_retryable(),
            RelayError::Sms(e) => e.retryable,
            _ => false,
        }
    }
}

/// E.164 phone number: `+` followed by 2-15 digits, no leading zero.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhoneNumber(String);

impl PhoneNumber {
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let value = input.trim();
        let invalid = || ValidationError::Invalid {
            field: "phone",
            reason: format!("'{value}' is not an E.164 number"),
        };

        let digits = value.strip_prefix('+').ok_or_else(invalid)?;
        if !(2..=15).contains(&digits.len())
            || !digits.bytes().all(|b| b.is_ascii_digit())
            || digits.starts_with('0')
        {
            return Err(invalid());
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PhoneNumber {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PhoneNumber> for String {
    fn from(phone: PhoneNumber) -> Self {
        phone.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Patient,
    Caregiver,
}

/// One message of a patient/caregiver thread.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaregiverMessage {
    pub id: EntryId,
    pub from: Sender,
    pub text: String,
    pub ts: UnixTimeMs,
}

impl CaregiverMessage {
    fn from_fields(id: &str, fields: &Fields) -> Option<Self> {
        Some(Self {
            id: EntryId::new(id).ok()?,
            from: serde_json::from_value(fields.get("from")?.clone()).ok()?,
            text: fields.get("text")?.as_str()?.to_string(),
            ts: UnixTimeMs::from_value(fields.get(TS_FIELD)?)?,
        })
    }
}

fn message_fields(from: Sender, text: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert("from".into(), serde_json::json!(from));
    fields.insert("text".into(), Value::from(text));
    fields
}

fn thread(owner: &OwnerId, caregiver: &PhoneNumber) -> Result<CollectionPath, RemoteError> {
    CollectionPath::user(owner, CHATS_COLLECTION)?
        .doc(caregiver.as_str())?
        .collection(MESSAGES_COLLECTION)
}

fn validate_text(text: &str) -> Result<&str, ValidationError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ValidationError::Missing { field: "text" });
    }
    if text.len() > MAX_MESSAGE_LENGTH {
        return Err(ValidationError::TooLong {
            field: "text",
            len: text.len(),
            max: MAX_MESSAGE_LENGTH,
        });
    }
    Ok(text)
}

// ============================================================================
// Patient side
// ============================================================================

/// The signed-in patient's thread with one caregiver.
pub struct CaregiverChat {
    remote: Arc<dyn RemoteStore>,
    session: Session,
    caregiver: PhoneNumber,
    retry: RetryPolicy,
    timeout: Duration,
}

impl std::fmt::Debug for CaregiverChat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaregiverChat").finish_non_exhaustive()
    }
}

impl CaregiverChat {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        session: Session,
        caregiver: PhoneNumber,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            remote,
            session,
            caregiver,
            retry,
            timeout,
        }
    }

    pub fn caregiver(&self) -> &PhoneNumber {
        &self.caregiver
    }

    fn thread(&self) -> Result<CollectionPath, RelayError> {
        let owner = self.session.owner().ok_or(RelayError::Unauthenticated)?;
        Ok(thread(owner, &self.caregiver)?)
    }

    #[instrument(skip_all, fields(caregiver = %self.caregiver))]
    pub async fn send(&self, text: &str) -> Result<EntryId, RelayError> {
        let thread = self.thread()?;
        let text = validate_text(text)?;

        let document = NewDocument::new(message_fields(Sender::Patient, text)).stamped(TS_FIELD);
        let path = remote_call(self.timeout, self.remote.add(&thread, document)).await?;

        debug!(id = path.id(), "Message sent");
        Ok(EntryId::new(path.id())?)
    }

    /// Thread messages, oldest first. Messages without a timestamp yet are
    /// left out until the server fills it.
    pub fn subscribe(&self) -> Result<Subscription<Vec<CaregiverMessage>>, RelayError> {
        let query = Query::new(self.thread()?).order_by(TS_FIELD, Direction::Ascending);
        Ok(spawn_live_query(
            self.remote.clone(),
            query,
            self.retry.clone(),
            self.timeout,
            |snapshot| {
                snapshot
                    .documents
                    .iter()
                    .filter_map(|doc| CaregiverMessage::from_fields(doc.id(), &doc.fields))
                    .collect()
            },
        ))
    }
}

// ============================================================================
// SMS gateway
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct SmsError {
    pub message: String,
    pub retryable: bool,
}

#[async_trait::async_trait]
pub trait SmsGateway: Send + Sync {
    async fn send_sms(&self, to: &PhoneNumber, from: &PhoneNumber, body: &str)
        -> Result<(), SmsError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundSms {
    pub to: PhoneNumber,
    pub from: PhoneNumber,
    pub body: String,
}

#[derive(Debug, Default)]
pub struct RecordingSmsGateway {
    sent: Mutex<Vec<OutboundSms>>,
    fail: Mutex<Option<SmsError>>,
}

impl RecordingSmsGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, error: Option<SmsError>) {
        *self.fail.lock().unwrap_or_else(|p| p.into_inner()) = error;
    }

    pub fn sent(&self) -> Vec<OutboundSms> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait::async_trait]
impl SmsGateway for RecordingSmsGateway {
    async fn send_sms(
        &self,
        to: &PhoneNumber,
        from: &PhoneNumber,
        body: &str,
    ) -> Result<(), SmsError> {
        if let Some(error) = self.fail.lock().unwrap_or_else(|p| p.into_inner()).clone() {
            return Err(error);
        }
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(OutboundSms {
                to: to.clone(),
                from: from.clone(),
                body: body.to_string(),
            });
        Ok(())
    }
}

// ============================================================================
// Backend side
// ============================================================================

/// Form fields of an inbound SMS webhook.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundSms {
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "Body")]
    pub body: String,
}

/// Bridges chat documents and SMS in both directions.
pub struct CaregiverRelay {
    remote: Arc<dyn RemoteStore>,
    sms: Arc<dyn SmsGateway>,
    from_number: PhoneNumber,
    timeout: Duration,
}

impl CaregiverRelay {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        sms: Arc<dyn SmsGateway>,
        from_number: PhoneNumber,
        timeout: Duration,
    ) -> Self {
        Self {
            remote,
            sms,
            from_number,
            timeout,
        }
    }

    /// Handles a newly created message document. Patient messages are sent
    /// to the caregiver phone taken from the path; anything else is ignored.
    /// Returns whether an SMS went out.
    #[instrument(skip_all, fields(path = %path))]
    pub async fn on_message_created(
        &self,
        path: &DocumentPath,
        fields: &Fields,
    ) -> Result<bool, RelayError> {
        let segments = path.segments();
        let is_message = segments.len() == 6
            && segments[0] == USERS_COLLECTION
            && segments[2] == CHATS_COLLECTION
            && segments[4] == MESSAGES_COLLECTION;
        if !is_message {
            debug!("Not a caregiver message, ignoring");
            return Ok(false);
        }

        if fields.get("from").and_then(Value::as_str) != Some("patient") {
            return Ok(false);
        }

        let Some(text) = fields.get("text").and_then(Value::as_str) else {
            warn!("Patient message without text");
            return Ok(false);
        };

        let to = PhoneNumber::parse(&segments[3])?;
        self.sms.send_sms(&to, &self.from_number, text).await?;
        info!("Relayed patient message by SMS");
        Ok(true)
    }

    /// Stores a caregiver's SMS reply in the matching patient's thread and
    /// returns the webhook acknowledgement body.
    #[instrument(skip_all)]
    pub async fn receive_sms(&self, sms: &InboundSms) -> Result<&'static str, RelayError> {
        let from = PhoneNumber::parse(&sms.from)?;
        let text = validate_text(&sms.body)?;

        let profile = remote_call(
            self.timeout,
            self.remote
                .find_in_group(PROFILE_GROUP, CAREGIVER_PHONE_FIELD, &Value::from(from.as_str())),
        )
        .await?
        .ok_or_else(|| RelayError::PatientNotFound {
            phone: from.to_string(),
        })?;

        // users/{uid}/profile/{doc}
        let owner = profile
            .path
            .segments()
            .get(1)
            .map(|uid| OwnerId::new(uid.as_str()))
            .transpose()?
            .ok_or_else(|| RelayError::PatientNotFound {
                phone: from.to_string(),
            })?;

        let thread = thread(&owner, &from)?;
        let document =
            NewDocument::new(message_fields(Sender::Caregiver, text)).stamped(TS_FIELD);
        remote_call(self.timeout, self.remote.add(&thread, document)).await?;

        info!(owner = %owner, "Stored caregiver SMS reply");
        Ok(TWIML_ACK)
    }
}
