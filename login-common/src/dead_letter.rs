//! # Dead letters
//!
//! Messages we will never be able to process are kept here, with the reason why, before they are
//! removed from the queue. Nothing is dropped without leaving a trace for operators.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use thiserror::Error;

/// A message that was given up on.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DeadLetter {
    pub message_id: String,
    /// The message body exactly as it was received.
    pub payload: Vec<u8>,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(message_id: &str, payload: &[u8], reason: &str) -> Self {
        Self {
            message_id: message_id.to_owned(),
            payload: payload.to_vec(),
            reason: reason.to_owned(),
            failed_at: Utc::now(),
        }
    }
}

/// Enumeration of errors when storing a dead letter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterError {
    #[error("dead letter sink unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Store a dead letter. Sending the same message id twice keeps the first one.
    async fn send(&self, letter: &DeadLetter) -> Result<(), DeadLetterError>;
}

/// The `login_dead_letters` table in PostgreSQL.
pub struct PgDeadLetterSink {
    pool: PgPool,
}

impl PgDeadLetterSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterSink for PgDeadLetterSink {
    async fn send(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        sqlx::query(
            r#"
INSERT INTO login_dead_letters
    (message_id, payload, reason, failed_at)
VALUES
    ($1, $2, $3, $4)
ON CONFLICT (message_id) DO NOTHING
            "#,
        )
        .bind(&letter.message_id)
        .bind(&letter.payload)
        .bind(&letter.reason)
        .bind(letter.failed_at)
        .execute(&self.pool)
        .await
        .map_err(|error| DeadLetterError::Unavailable(error.to_string()))?;

        Ok(())
    }
}
