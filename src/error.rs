//! Error taxonomy for the ride coordination core.
//!
//! Every core operation returns [`Result`]. Callers map variants onto their
//! own surface (HTTP status, CLI exit code) and decide on retries; the core
//! itself never retries except for the OTP fast-path → audit fallback.
//!
//! | Variant | Meaning | Retry? |
//! |---------|---------|--------|
//! | `Validation` | Bad coordinates, radius, empty fields | never |
//! | `NotFound` | Unknown ride | no, expected during matching |
//! | `Forbidden` | Principal does not own / may not act on the resource | never |
//! | `Conflict` | Illegal state transition, incl. losing an accept race | re-poll |
//! | `Revoked` | Session pin missing or replaced | re-authenticate |
//! | `Unauthenticated` | Bad signature, expired token | re-authenticate |
//! | `TransientStore` | Timeout or store unavailable | yes, with backoff |
//! | `Store` | Constraint violation, undecodable row | never |

use crate::ride::RideStatus;
use thiserror::Error;

/// Result alias used across the core.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("{}", conflict_message(*.ride_id, *.current, *.attempted))]
    Conflict {
        ride_id: i64,
        current: RideStatus,
        attempted: RideStatus,
    },

    #[error("session revoked")]
    Revoked,

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("transient store error: {0}")]
    TransientStore(String),

    /// The store answered but refused or returned something unusable.
    #[error("store error: {0}")]
    Store(String),
}

fn conflict_message(ride_id: i64, current: RideStatus, attempted: RideStatus) -> String {
    match attempted {
        RideStatus::Accepted => format!(
            "ride {} is not in requested or pending status (current: {})",
            ride_id, current
        ),
        _ => format!(
            "ride {} cannot move from {} to {}",
            ride_id, current, attempted
        ),
    }
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Error::Forbidden(msg.into())
    }

    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Error::Unauthenticated(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Error::TransientStore(msg.into())
    }

    /// Safe to retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientStore(_))
    }

    /// The ride is gone or already taken. Normal while matching.
    pub fn is_expected(&self) -> bool {
        matches!(self, Error::Conflict { .. } | Error::NotFound(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        let permanent = match &e {
            sqlx::Error::Database(db) => !matches!(db.kind(), sqlx::error::ErrorKind::Other),
            sqlx::Error::RowNotFound
            | sqlx::Error::TypeNotFound { .. }
            | sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::Encode(_) => true,
            _ => false,
        };
        if permanent {
            Error::Store(format!("postgres: {}", e))
        } else {
            Error::TransientStore(format!("postgres: {}", e))
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::TransientStore(format!("redis: {}", e))
    }
}
