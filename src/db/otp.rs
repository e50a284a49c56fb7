//! OTP audit records.

use super::Database;
use crate::error::Result;
use crate::otp::{NewOtpRecord, OtpRecord};
use crate::store::OtpAuditStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

const OTP_COLUMNS: &str =
    "id, phone, code, purpose, verified, expired, expires_at, verified_at, created_at";

#[derive(sqlx::FromRow)]
struct OtpRow {
    id: i64,
    phone: String,
    code: String,
    purpose: String,
    verified: bool,
    expired: bool,
    expires_at: DateTime<Utc>,
    verified_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<OtpRow> for OtpRecord {
    fn from(row: OtpRow) -> Self {
        OtpRecord {
            id: row.id,
            phone: row.phone,
            code: row.code,
            purpose: row.purpose,
            verified: row.verified,
            expired: row.expired,
            expires_at: row.expires_at,
            verified_at: row.verified_at,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl OtpAuditStore for Database {
    async fn insert_otp(&self, record: NewOtpRecord) -> Result<OtpRecord> {
        let sql = format!(
            "INSERT INTO otp_records (phone, code, purpose, expires_at, created_at)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {}",
            OTP_COLUMNS
        );
        let row = sqlx::query_as::<_, OtpRow>(&sql)
            .bind(&record.phone)
            .bind(&record.code)
            .bind(&record.purpose)
            .bind(record.expires_at)
            .bind(record.created_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }

    /// Single statement: the row lock taken by `FOR UPDATE` makes a second
    /// concurrent verifier re-check `NOT verified` and match nothing.
    async fn mark_otp_verified(&self, phone: &str, code: &str, now: DateTime<Utc>) -> Result<bool> {
        let id: Option<i64> = sqlx::query_scalar(
            "UPDATE otp_records SET verified = TRUE, verified_at = $3
             WHERE id = (
                 SELECT id FROM otp_records
                 WHERE phone = $1 AND code = $2
                   AND NOT verified AND NOT expired AND expires_at > $3
                 ORDER BY created_at DESC, id DESC
                 LIMIT 1
                 FOR UPDATE
             )
             AND NOT verified
             RETURNING id",
        )
        .bind(phone)
        .bind(code)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id.is_some())
    }

    async fn expire_outstanding_otps(&self, phone: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE otp_records SET expired = TRUE
             WHERE phone = $1 AND NOT verified AND NOT expired",
        )
        .bind(phone)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn otp_history(&self, phone: &str, limit: usize) -> Result<Vec<OtpRecord>> {
        let sql = format!(
            "SELECT {} FROM otp_records WHERE phone = $1
             ORDER BY created_at DESC, id DESC LIMIT $2",
            OTP_COLUMNS
        );
        let rows = sqlx::query_as::<_, OtpRow>(&sql)
            .bind(phone)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(OtpRecord::from).collect())
    }

    async fn purge_expired_otps(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM otp_records WHERE expires_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
