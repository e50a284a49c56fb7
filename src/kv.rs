//! # FastKV — Expiring Key-Value Cache
//!
//! Short-lived state with per-key TTL: OTP fast-path codes and session pins.
//! Redis provides expiry natively; every operation is a single command so no
//! client-side coordination is needed.
//!
//! ## Key Patterns
//!
//! ```text
//! otp:{phone}                       → current OTP code (TTL = OTP window)
//! session:{role}:{principal_id}     → the one valid session token (TTL = session TTL)
//! ```

use crate::error::Result;
use crate::principal::Role;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::time::Duration;

#[async_trait]
pub trait FastKv: Send + Sync {
    /// Set `key` to `value`, expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete `key`. Returns true only if this call removed a live key, so
    /// concurrent deleters can tell which one won.
    async fn delete(&self, key: &str) -> Result<bool>;
}

pub fn otp_key(phone: &str) -> String {
    format!("otp:{}", phone)
}

pub fn session_key(role: Role, principal_id: i64) -> String {
    format!("session:{}:{}", role, principal_id)
}

/// Redis-backed [`FastKv`] over a reconnecting connection manager.
#[derive(Clone)]
pub struct RedisKv {
    conn: redis::aio::ConnectionManager,
}

impl RedisKv {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(RedisKv { conn })
    }

    /// Health check: `PING` round trip.
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl FastKv for RedisKv {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        // PSETEX keeps sub-second TTLs exact; Redis rejects a zero expiry.
        let millis = (ttl.as_millis() as u64).max(1);
        let _: () = conn.pset_ex(key, value, millis).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_patterns() {
        assert_eq!(otp_key("0100"), "otp:0100");
        assert_eq!(session_key(Role::Driver, 42), "session:driver:42");
        assert_eq!(session_key(Role::Customer, 7), "session:customer:7");
    }
}
