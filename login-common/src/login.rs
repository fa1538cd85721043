//! # Login
//!
//! Types for login events as they arrive from the queue and as they are persisted, and the
//! normalization that turns one into the other.
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::mask::mask;

/// Enumeration of reasons a raw payload cannot be turned into a login record.
/// All of these are permanent: redelivering the same payload will fail the same way.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("payload is not a JSON object")]
    MalformedPayload,
    #[error("required field {0} is missing")]
    MissingField(&'static str),
    #[error("field {0} has a type or value that cannot be stored")]
    InvalidType(&'static str),
}

impl ValidationError {
    /// A short label for the error, suitable for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::MalformedPayload => "malformed_payload",
            ValidationError::MissingField(_) => "missing_field",
            ValidationError::InvalidType(_) => "invalid_type",
        }
    }
}

/// A login event as produced upstream, after required fields have been extracted.
/// Still holds PII: it should never leave this crate's normalization step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLoginEvent {
    pub user_id: String,
    pub device_type: String,
    pub ip: String,
    pub device_id: String,
    pub locale: String,
    /// Always text, even if the producer sent a number.
    pub app_version: String,
}

impl RawLoginEvent {
    /// Parse a queue message body into a `RawLoginEvent`.
    /// Fields are checked in order, and the first one missing or of the wrong type is reported.
    pub fn from_payload(payload: &[u8]) -> Result<Self, ValidationError> {
        let body: Map<String, Value> =
            serde_json::from_slice(payload).map_err(|_| ValidationError::MalformedPayload)?;

        Ok(Self {
            user_id: required_string(&body, "user_id")?,
            device_type: required_string(&body, "device_type")?,
            ip: required_string(&body, "ip")?,
            device_id: required_string(&body, "device_id")?,
            locale: required_string(&body, "locale")?,
            app_version: required_version(&body, "app_version")?,
        })
    }
}

fn required<'a>(
    body: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a Value, ValidationError> {
    match body.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field)),
        Some(value) => Ok(value),
    }
}

fn required_string(
    body: &Map<String, Value>,
    field: &'static str,
) -> Result<String, ValidationError> {
    match required(body, field)? {
        Value::String(s) => text(s, field),
        _ => Err(ValidationError::InvalidType(field)),
    }
}

/// Versions are sent both as strings ("2.3.0") and as bare numbers (3), we store text either way.
fn required_version(
    body: &Map<String, Value>,
    field: &'static str,
) -> Result<String, ValidationError> {
    match required(body, field)? {
        Value::String(s) => text(s, field),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(ValidationError::InvalidType(field)),
    }
}

/// PostgreSQL TEXT can't hold NUL characters, so no retry would ever store them.
fn text(s: &str, field: &'static str) -> Result<String, ValidationError> {
    if s.contains('\0') {
        return Err(ValidationError::InvalidType(field));
    }
    Ok(s.to_owned())
}

/// A login event with its PII fields masked, waiting to be stamped and written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskedLogin {
    pub user_id: String,
    pub device_type: String,
    pub masked_ip: String,
    pub masked_device_id: String,
    pub locale: String,
    pub app_version: String,
}

impl From<RawLoginEvent> for MaskedLogin {
    fn from(event: RawLoginEvent) -> Self {
        Self {
            masked_ip: mask(&event.ip),
            masked_device_id: mask(&event.device_id),
            user_id: event.user_id,
            device_type: event.device_type,
            locale: event.locale,
            app_version: event.app_version,
        }
    }
}

impl MaskedLogin {
    /// Produce the record to persist.
    ///
    /// # Arguments
    ///
    /// * `message_id`: The identifier the source assigned to the message. Stable across
    ///   redeliveries, so it doubles as the idempotency key of the write.
    /// * `create_date`: When processing happened. Producers' timestamps are never trusted.
    pub fn into_record(
        self,
        message_id: &str,
        create_date: DateTime<Utc>,
    ) -> NormalizedLoginRecord {
        NormalizedLoginRecord {
            message_id: message_id.to_owned(),
            user_id: self.user_id,
            device_type: self.device_type,
            masked_ip: self.masked_ip,
            masked_device_id: self.masked_device_id,
            locale: self.locale,
            app_version: self.app_version,
            create_date,
        }
    }
}

/// A row of the `user_logins` table. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct NormalizedLoginRecord {
    pub message_id: String,
    pub user_id: String,
    pub device_type: String,
    pub masked_ip: String,
    pub masked_device_id: String,
    pub locale: String,
    pub app_version: String,
    pub create_date: DateTime<Utc>,
}

/// Validate a raw payload and mask its PII fields.
pub fn normalize(payload: &[u8]) -> Result<MaskedLogin, ValidationError> {
    RawLoginEvent::from_payload(payload).map(MaskedLogin::from)
}
