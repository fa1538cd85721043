//! # Store
//!
//! Persistence of `NormalizedLoginRecord`s.
//!
//! Writes are idempotent: the source's message id is unique in the destination table and a
//! conflicting insert is reported as a duplicate instead of an error. This is what makes
//! at-least-once delivery safe, whether the duplicate comes from a redelivery to this process
//! or from another process that got the same message.
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tracing::warn;

use crate::login::NormalizedLoginRecord;
use crate::retry::RetryPolicy;

/// What happened to a single insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with the same message id already exists.
    Duplicate,
}

/// Enumeration of errors for a single insert.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store is temporarily unavailable: {0}")]
    Transient(String),
    #[error("store rejected the record: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait LoginStore: Send + Sync {
    async fn insert(&self, record: &NormalizedLoginRecord) -> Result<InsertOutcome, StoreError>;
}

/// The `user_logins` table in PostgreSQL.
pub struct PgLoginStore {
    pool: PgPool,
}

impl PgLoginStore {
    /// Initialize a new PgLoginStore with its own connection pool.
    pub async fn new(
        url: &str,
        max_connections: u32,
        acquire_timeout: time::Duration,
    ) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .test_before_acquire(true)
            .connect(url)
            .await?;

        Ok(Self { pool })
    }

    /// Initialize a new PgLoginStore from an existing pool.
    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LoginStore for PgLoginStore {
    async fn insert(&self, record: &NormalizedLoginRecord) -> Result<InsertOutcome, StoreError> {
        // The connection goes back to the pool when `conn` is dropped, whichever way we return.
        let mut conn = self.pool.acquire().await.map_err(classify)?;

        let result = sqlx::query(
            r#"
INSERT INTO user_logins
    (message_id, user_id, device_type, masked_ip, masked_device_id, locale, app_version, create_date)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8)
ON CONFLICT (message_id) DO NOTHING
            "#,
        )
        .bind(&record.message_id)
        .bind(&record.user_id)
        .bind(&record.device_type)
        .bind(&record.masked_ip)
        .bind(&record.masked_device_id)
        .bind(&record.locale)
        .bind(&record.app_version)
        .bind(record.create_date)
        .execute(&mut *conn)
        .await
        .map_err(classify)?;

        match result.rows_affected() {
            0 => Ok(InsertOutcome::Duplicate),
            _ => Ok(InsertOutcome::Inserted),
        }
    }
}

fn classify(error: sqlx::Error) -> StoreError {
    if is_transient_error(&error) {
        StoreError::Transient(error.to_string())
    } else {
        StoreError::Rejected(error.to_string())
    }
}

/// Determines if a sqlx::Error represents a transient failure that should be retried.
pub fn is_transient_error(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Tls(_) => true,

        sqlx::Error::Database(db_error) => match db_error.code() {
            // See: PostgreSQL SQLSTATE appendix
            // 08***  Connection Exception
            // 53***  Insufficient Resources
            // 57***  Operator Intervention
            // 58***  System Error
            // 40001  Serialization Failure
            // 40P01  Deadlock Detected
            Some(code) => {
                let code = code.as_ref();
                code.starts_with("08")
                    || code.starts_with("53")
                    || code.starts_with("57")
                    || code.starts_with("58")
                    || code == "40001"
                    || code == "40P01"
            }
            None => false,
        },

        sqlx::Error::Protocol(msg) => {
            let msg = msg.to_lowercase();
            msg.contains("connection") || msg.contains("timeout")
        }

        _ => false,
    }
}

/// What a successful `PersistenceWriter::write` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Persisted,
    /// The record had been written before, nothing changed.
    AlreadyApplied,
}

/// Enumeration of errors returned by `PersistenceWriter`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    #[error("store unavailable after {attempts} attempts: {reason}")]
    Unavailable { attempts: u32, reason: String },
    #[error("store rejected the record: {0}")]
    Rejected(String),
}

impl WriteError {
    /// A short label for the error, suitable for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            WriteError::Unavailable { .. } => "write_unavailable",
            WriteError::Rejected(_) => "write_rejected",
        }
    }
}

/// Writes records to a `LoginStore`, retrying transient failures with backoff.
#[derive(Clone)]
pub struct PersistenceWriter {
    store: Arc<dyn LoginStore>,
    retry_policy: RetryPolicy,
    /// Upper bound for a single insert, including waiting for a pooled connection.
    write_timeout: time::Duration,
}

impl PersistenceWriter {
    pub fn new(
        store: Arc<dyn LoginStore>,
        retry_policy: RetryPolicy,
        write_timeout: time::Duration,
    ) -> Self {
        Self {
            store,
            retry_policy,
            write_timeout,
        }
    }

    /// Write a record exactly once, however many times it is called.
    ///
    /// A timed out insert may or may not have committed. It is retried like any other transient
    /// failure: the uniqueness of the message id turns a second commit into a no-op.
    pub async fn write(&self, record: &NormalizedLoginRecord) -> Result<WriteOutcome, WriteError> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = tokio::time::timeout(self.write_timeout, self.store.insert(record))
                .await
                .unwrap_or_else(|_| Err(StoreError::Transient("insert timed out".to_owned())));

            match result {
                Ok(InsertOutcome::Inserted) => return Ok(WriteOutcome::Persisted),
                Ok(InsertOutcome::Duplicate) => return Ok(WriteOutcome::AlreadyApplied),
                Err(StoreError::Rejected(reason)) => return Err(WriteError::Rejected(reason)),
                Err(StoreError::Transient(reason)) => {
                    if !self.retry_policy.should_retry(attempt) {
                        return Err(WriteError::Unavailable {
                            attempts: attempt,
                            reason,
                        });
                    }

                    let interval = self.retry_policy.retry_interval(attempt);
                    warn!(
                        message_id = %record.message_id,
                        attempt,
                        ?interval,
                        error = %reason,
                        "failed to write login record, retrying"
                    );
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }
}
