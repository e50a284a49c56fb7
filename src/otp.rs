//! # OTP — One-Time Passcode Issue and Verify
//!
//! Two copies of every code:
//!
//! - **Fast path**: `otp:{phone}` in [`FastKv`] with TTL = OTP window.
//!   Authoritative while present.
//! - **Audit copy**: a durable [`OtpRecord`] row. Consulted when the fast
//!   copy is missing (evicted, expired early) or the KV store is failing.
//!
//! ## Single use
//!
//! A matching fast-path verify first marks the audit record verified, then
//! deletes the key. Only the caller whose delete removed the key wins. Anyone
//! arriving after that delete falls back to the audit copy, which is already
//! marked, so the code cannot be redeemed twice. The audit fallback is itself
//! a single conditional update.
//!
//! If the KV store is down when a code is redeemed through the audit copy,
//! the fast key survives. A later fast-path match whose audit update finds
//! nothing checks the audit trail and refuses codes already verified.

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::error::{Error, Result};
use crate::kv::{otp_key, FastKv};
use crate::metrics::Metrics;
use crate::store::{bounded, OtpAuditStore};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Durable audit row for one issued code.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OtpRecord {
    pub id: i64,
    pub phone: String,
    pub code: String,
    pub purpose: String,
    pub verified: bool,
    /// Superseded by a newer code or explicitly invalidated.
    pub expired: bool,
    pub expires_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl OtpRecord {
    /// Still redeemable at `now`.
    pub fn is_outstanding(&self, now: DateTime<Utc>) -> bool {
        !self.verified && !self.expired && self.expires_at > now
    }
}

#[derive(Debug, Clone)]
pub struct NewOtpRecord {
    pub phone: String,
    pub code: String,
    pub purpose: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl NewOtpRecord {
    pub fn into_record(self, id: i64) -> OtpRecord {
        OtpRecord {
            id,
            phone: self.phone,
            code: self.code,
            purpose: self.purpose,
            verified: false,
            expired: false,
            expires_at: self.expires_at,
            verified_at: None,
            created_at: self.created_at,
        }
    }
}

/// Returned to the delivery layer, which sends `code` to the phone.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedOtp {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

/// Audit rows inspected when deciding whether a fast-path key is stale.
const REDEMPTION_LOOKBACK: usize = 5;

pub struct OtpAuthenticator {
    kv: Arc<dyn FastKv>,
    audit: Arc<dyn OtpAuditStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    ttl: Duration,
    code_length: usize,
    fixed_code: Option<String>,
    timeout: Duration,
}

impl OtpAuthenticator {
    pub fn new(
        kv: Arc<dyn FastKv>,
        audit: Arc<dyn OtpAuditStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        config: &CoreConfig,
    ) -> Self {
        OtpAuthenticator {
            kv,
            audit,
            clock,
            metrics,
            ttl: config.otp_ttl(),
            code_length: config.otp_code_length,
            fixed_code: config.otp_fixed_code.clone(),
            timeout: config.store_timeout(),
        }
    }

    fn generate_code(&self) -> Result<String> {
        if let Some(code) = &self.fixed_code {
            return Ok(code.clone());
        }
        let upper = u32::try_from(self.code_length)
            .ok()
            .and_then(|len| 10u64.checked_pow(len))
            .filter(|_| self.code_length > 0)
            .ok_or_else(|| {
                Error::validation(format!("unsupported otp code length {}", self.code_length))
            })?;
        let n = rand::thread_rng().gen_range(0..upper);
        Ok(format!("{:0width$}", n, width = self.code_length))
    }

    /// Issue a fresh code for `phone`, superseding any outstanding one.
    pub async fn issue(&self, phone: &str, purpose: &str) -> Result<IssuedOtp> {
        validate_phone(phone)?;
        if purpose.trim().is_empty() {
            return Err(Error::validation("purpose must not be empty"));
        }

        let code = self.generate_code()?;
        let now = self.clock.now();
        let expires_at = now + chrono::Duration::milliseconds(self.ttl.as_millis() as i64);

        if let Err(e) = bounded(
            self.timeout,
            "expire_outstanding_otps",
            self.audit.expire_outstanding_otps(phone),
        )
        .await
        {
            warn!(phone, error = %e, "failed to supersede outstanding otp records");
        }

        bounded(
            self.timeout,
            "kv_set",
            self.kv.set(&otp_key(phone), &code, self.ttl),
        )
        .await?;

        let record = NewOtpRecord {
            phone: phone.to_string(),
            code: code.clone(),
            purpose: purpose.to_string(),
            expires_at,
            created_at: now,
        };
        if let Err(e) = bounded(self.timeout, "insert_otp", self.audit.insert_otp(record)).await {
            warn!(phone, error = %e, "failed to write otp audit record");
        }

        info!(phone, purpose, %expires_at, "otp issued");
        Ok(IssuedOtp { code, expires_at })
    }

    /// Check `code` for `phone`. True at most once per issued code.
    pub async fn verify(&self, phone: &str, code: &str) -> Result<bool> {
        validate_phone(phone)?;
        if code.is_empty() {
            return Ok(false);
        }
        let key = otp_key(phone);
        let now = self.clock.now();

        match bounded(self.timeout, "kv_get", self.kv.get(&key)).await {
            Ok(Some(stored)) => {
                if stored != code {
                    self.metrics.otp("fast", "mismatch");
                    debug!(phone, "otp mismatch on fast path");
                    return Ok(false);
                }
                let audited = bounded(
                    self.timeout,
                    "mark_otp_verified",
                    self.audit.mark_otp_verified(phone, code, now),
                )
                .await;
                if let Err(e) = &audited {
                    warn!(phone, error = %e, "failed to mark otp audit record verified");
                }

                match bounded(self.timeout, "kv_delete", self.kv.delete(&key)).await {
                    Ok(true) if matches!(audited, Ok(false)) => {
                        // A key left behind by an audit-path redemption
                        // during a KV outage must not be honoured again.
                        if self.already_redeemed(phone, code, now).await {
                            self.metrics.otp("fast", "consumed");
                            warn!(phone, "stale otp key for an already redeemed code");
                            return Ok(false);
                        }
                        self.metrics.otp("fast", "verified");
                        info!(phone, "otp verified without audit copy");
                        Ok(true)
                    }
                    Ok(true) => {
                        self.metrics.otp("fast", "verified");
                        info!(phone, "otp verified");
                        Ok(true)
                    }
                    Ok(false) => {
                        self.metrics.otp("fast", "consumed");
                        Ok(false)
                    }
                    Err(e) => {
                        // The audit update above is the only remaining arbiter.
                        warn!(phone, error = %e, "otp key delete failed, deciding on audit copy");
                        let won = audited.unwrap_or(false);
                        self.metrics
                            .otp("audit", if won { "verified" } else { "rejected" });
                        Ok(won)
                    }
                }
            }
            Ok(None) => self.verify_from_audit(phone, code, now, &key).await,
            Err(e) => {
                warn!(phone, error = %e, "otp fast path unavailable, falling back to audit copy");
                self.verify_from_audit(phone, code, now, &key).await
            }
        }
    }

    async fn verify_from_audit(
        &self,
        phone: &str,
        code: &str,
        now: DateTime<Utc>,
        key: &str,
    ) -> Result<bool> {
        let won = bounded(
            self.timeout,
            "mark_otp_verified",
            self.audit.mark_otp_verified(phone, code, now),
        )
        .await?;
        if won {
            // A stale fast copy must not allow a second redemption.
            if let Err(e) = bounded(self.timeout, "kv_delete", self.kv.delete(key)).await {
                warn!(phone, error = %e, "failed to clear otp key after audit verify");
            }
            info!(phone, "otp verified from audit copy");
            self.metrics.otp("audit", "verified");
        } else {
            self.metrics.otp("audit", "rejected");
        }
        Ok(won)
    }

    /// Whether the newest unexpired audit record carrying `code` is already
    /// verified. Lookup failures count as redeemed.
    async fn already_redeemed(&self, phone: &str, code: &str, now: DateTime<Utc>) -> bool {
        let recent = bounded(
            self.timeout,
            "otp_history",
            self.audit.otp_history(phone, REDEMPTION_LOOKBACK),
        )
        .await;
        match recent {
            Ok(records) => records
                .iter()
                .find(|r| r.code == code && r.expires_at > now)
                .is_some_and(|r| r.verified),
            Err(e) => {
                warn!(phone, error = %e, "otp audit lookup failed, rejecting code");
                true
            }
        }
    }

    /// Drop the fast copy and mark every outstanding audit record expired.
    pub async fn invalidate(&self, phone: &str) -> Result<()> {
        validate_phone(phone)?;
        bounded(self.timeout, "kv_delete", self.kv.delete(&otp_key(phone))).await?;
        let expired = bounded(
            self.timeout,
            "expire_outstanding_otps",
            self.audit.expire_outstanding_otps(phone),
        )
        .await?;
        info!(phone, expired, "otp invalidated");
        Ok(())
    }

    /// Audit records for `phone`, newest first.
    pub async fn history(&self, phone: &str, limit: usize) -> Result<Vec<OtpRecord>> {
        validate_phone(phone)?;
        bounded(
            self.timeout,
            "otp_history",
            self.audit.otp_history(phone, limit.max(1)),
        )
        .await
    }

    pub async fn purge_expired(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let removed = bounded(
            self.timeout,
            "purge_expired_otps",
            self.audit.purge_expired_otps(older_than),
        )
        .await?;
        if removed > 0 {
            info!(removed, "purged expired otp records");
        }
        Ok(removed)
    }
}

fn validate_phone(phone: &str) -> Result<()> {
    if phone.trim().is_empty() {
        return Err(Error::validation("phone must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::{MemoryKv, MemoryStore};

    fn authenticator(config: CoreConfig) -> (OtpAuthenticator, Arc<MemoryKv>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let store = Arc::new(MemoryStore::new());
        let otp = OtpAuthenticator::new(
            kv.clone(),
            store,
            clock.clone(),
            Arc::new(Metrics::new()),
            &config,
        );
        (otp, kv, clock)
    }

    #[test]
    fn random_codes_have_configured_length() {
        let (otp, _, _) = authenticator(CoreConfig {
            otp_code_length: 8,
            ..CoreConfig::default()
        });
        for _ in 0..50 {
            let code = otp.generate_code().unwrap();
            assert_eq!(code.len(), 8);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn oversized_code_length_is_rejected_without_overflow() {
        let (otp, _, _) = authenticator(CoreConfig {
            otp_code_length: 20,
            ..CoreConfig::default()
        });
        assert!(matches!(
            otp.issue("0100", "login").await,
            Err(Error::Validation(_))
        ));

        let (otp, _, _) = authenticator(CoreConfig {
            otp_code_length: 19,
            ..CoreConfig::default()
        });
        assert_eq!(otp.issue("0100", "login").await.unwrap().code.len(), 19);
    }

    #[tokio::test]
    async fn fixed_code_is_issued_verbatim() {
        let (otp, _, _) = authenticator(CoreConfig {
            otp_fixed_code: Some("123456".into()),
            ..CoreConfig::default()
        });
        let issued = otp.issue("0100", "login").await.unwrap();
        assert_eq!(issued.code, "123456");
        assert!(otp.verify("0100", "123456").await.unwrap());
    }

    #[tokio::test]
    async fn code_is_single_use() {
        let (otp, _, _) = authenticator(CoreConfig::default());
        let issued = otp.issue("0100", "login").await.unwrap();
        assert!(otp.verify("0100", &issued.code).await.unwrap());
        assert!(!otp.verify("0100", &issued.code).await.unwrap());
    }

    #[tokio::test]
    async fn wrong_code_does_not_consume() {
        let (otp, _, _) = authenticator(CoreConfig::default());
        let issued = otp.issue("0100", "login").await.unwrap();
        let wrong = if issued.code == "000000" { "111111" } else { "000000" };
        assert!(!otp.verify("0100", wrong).await.unwrap());
        assert!(otp.verify("0100", &issued.code).await.unwrap());
    }

    #[tokio::test]
    async fn reissue_supersedes_previous_code() {
        let (otp, kv, _) = authenticator(CoreConfig::default());
        let first = otp.issue("0100", "login").await.unwrap();
        let second = otp.issue("0100", "login").await.unwrap();
        kv.evict(&otp_key("0100"));
        if first.code != second.code {
            assert!(!otp.verify("0100", &first.code).await.unwrap());
        }
        assert!(otp.verify("0100", &second.code).await.unwrap());
    }

    #[tokio::test]
    async fn audit_fallback_honors_expiry() {
        let (otp, kv, clock) = authenticator(CoreConfig::default());
        let issued = otp.issue("0100", "login").await.unwrap();
        kv.evict(&otp_key("0100"));
        clock.advance(chrono::Duration::seconds(60));
        assert!(otp.verify("0100", &issued.code).await.unwrap());

        let again = otp.issue("0100", "login").await.unwrap();
        kv.evict(&otp_key("0100"));
        clock.advance(chrono::Duration::seconds(121));
        assert!(!otp.verify("0100", &again.code).await.unwrap());
    }

    #[tokio::test]
    async fn invalidate_kills_both_copies() {
        let (otp, _, _) = authenticator(CoreConfig::default());
        let issued = otp.issue("0100", "login").await.unwrap();
        otp.invalidate("0100").await.unwrap();
        assert!(!otp.verify("0100", &issued.code).await.unwrap());

        let history = otp.history("0100", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].expired);
        assert!(!history[0].verified);
    }

    #[tokio::test]
    async fn history_is_newest_first_and_purge_removes_old_rows() {
        let (otp, _, clock) = authenticator(CoreConfig::default());
        otp.issue("0100", "login").await.unwrap();
        clock.advance(chrono::Duration::seconds(10));
        otp.issue("0100", "reset").await.unwrap();

        let history = otp.history("0100", 10).await.unwrap();
        assert_eq!(history[0].purpose, "reset");
        assert!(history[1].expired);

        clock.advance(chrono::Duration::hours(2));
        let removed = otp.purge_expired(clock.now()).await.unwrap();
        assert_eq!(removed, 2);
        assert!(otp.history("0100", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_empty_phone() {
        let (otp, _, _) = authenticator(CoreConfig::default());
        assert!(matches!(
            otp.issue("", "login").await,
            Err(Error::Validation(_))
        ));
        assert!(!otp.verify("0100", "").await.unwrap());
    }
}
