//! # Session — Signed Tokens Pinned in FastKV
//!
//! A session is an HS256 JWT plus a pin: the same token string stored under
//! `session:{role}:{principal_id}`. A token is valid only while its signature
//! and expiry check out *and* it is the pinned value, so issuing a new token
//! (fresh `jti`) or revoking displaces every older one immediately.
//!
//! Expiry is checked against the injected [`Clock`], not the signer's view of
//! wall time.

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::kv::{session_key, FastKv};
use crate::metrics::Metrics;
use crate::principal::{Principal, Role};
use crate::store::bounded;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub role: Role,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub jti: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Signature layer. Implementations check integrity only; time-based
/// checks happen in [`SessionRegistry::validate`].
pub trait TokenSigner: Send + Sync {
    fn sign(&self, claims: &SessionClaims) -> Result<String>;

    /// Decode and verify the signature. Any failure is `Unauthenticated`.
    fn verify(&self, token: &str) -> Result<SessionClaims>;
}

pub struct JwtSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtSigner {
    pub fn new(secret: &[u8]) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::validation("jwt secret must not be empty"));
        }
        Ok(JwtSigner {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        })
    }

    /// Signer with a fresh random secret; tokens die with the process.
    pub fn random() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        JwtSigner {
            encoding: EncodingKey::from_secret(&secret),
            decoding: DecodingKey::from_secret(&secret),
        }
    }
}

impl TokenSigner for JwtSigner {
    fn sign(&self, claims: &SessionClaims) -> Result<String> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| Error::unauthenticated(format!("failed to sign token: {}", e)))
    }

    fn verify(&self, token: &str) -> Result<SessionClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.set_required_spec_claims(&["exp", "nbf", "sub"]);
        jsonwebtoken::decode::<SessionClaims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| Error::unauthenticated(format!("invalid token: {}", e)))
    }
}

pub struct SessionRegistry {
    signer: Arc<dyn TokenSigner>,
    kv: Arc<dyn FastKv>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    timeout: Duration,
}

impl SessionRegistry {
    pub fn new(
        signer: Arc<dyn TokenSigner>,
        kv: Arc<dyn FastKv>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        timeout: Duration,
    ) -> Self {
        SessionRegistry {
            signer,
            kv,
            clock,
            metrics,
            timeout,
        }
    }

    /// Sign a token for the principal and pin it, replacing any previous pin.
    pub async fn issue(&self, principal_id: i64, role: Role, ttl: Duration) -> Result<SessionToken> {
        if ttl.as_secs() == 0 {
            return Err(Error::validation("session ttl must be at least one second"));
        }
        let now = self.clock.now();
        let exp = now.timestamp() + ttl.as_secs() as i64;
        let claims = SessionClaims {
            sub: principal_id.to_string(),
            role,
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp,
            jti: uuid::Uuid::new_v4().to_string(),
        };
        let token = self.signer.sign(&claims)?;

        bounded(
            self.timeout,
            "kv_set",
            self.kv.set(&session_key(role, principal_id), &token, ttl),
        )
        .await?;

        let expires_at = Utc
            .timestamp_opt(exp, 0)
            .single()
            .ok_or_else(|| Error::validation("session expiry out of range"))?;
        info!(principal_id, %role, %expires_at, "session issued");
        Ok(SessionToken { token, expires_at })
    }

    /// Resolve a token to its principal, or fail with `Unauthenticated`
    /// (bad signature, expired) or `Revoked` (not the pinned token).
    pub async fn validate(&self, token: &str) -> Result<Principal> {
        let result = self.validate_inner(token).await;
        let outcome = match &result {
            Ok(_) => "valid",
            Err(Error::Revoked) => "revoked",
            Err(Error::Unauthenticated(_)) => "unauthenticated",
            Err(_) => "error",
        };
        self.metrics.session(outcome);
        result
    }

    async fn validate_inner(&self, token: &str) -> Result<Principal> {
        let claims = self.signer.verify(token)?;
        let now = self.clock.now().timestamp();
        if now >= claims.exp {
            return Err(Error::unauthenticated("token expired"));
        }
        if now < claims.nbf {
            return Err(Error::unauthenticated("token not yet valid"));
        }
        let id: i64 = claims
            .sub
            .parse()
            .map_err(|_| Error::unauthenticated("token subject is not a principal id"))?;

        let pinned = bounded(
            self.timeout,
            "kv_get",
            self.kv.get(&session_key(claims.role, id)),
        )
        .await?;
        match pinned {
            Some(pin) if pin == token => Ok(Principal {
                id,
                role: claims.role,
            }),
            _ => {
                debug!(principal_id = id, role = %claims.role, "session pin missing or replaced");
                Err(Error::Revoked)
            }
        }
    }

    /// Drop the pin; every outstanding token for the principal stops validating.
    pub async fn revoke(&self, principal_id: i64, role: Role) -> Result<()> {
        bounded(
            self.timeout,
            "kv_delete",
            self.kv.delete(&session_key(role, principal_id)),
        )
        .await?;
        info!(principal_id, %role, "session revoked");
        Ok(())
    }
}
