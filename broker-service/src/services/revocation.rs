//! Revocation index - jti lookups for issued tokens.
//!
//! Append/lookup only; entries carry a TTL matching the token's remaining
//! lifetime, so the index never outgrows the set of still-live tokens.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::{Client, aio::ConnectionManager};
use std::collections::HashMap;
use std::sync::Mutex;

#[async_trait]
pub trait RevocationIndex: Send + Sync {
    /// Mark a jti revoked for `ttl_seconds`. Revoking an already-revoked jti
    /// is a no-op, not an error.
    async fn revoke(&self, jti: &str, ttl_seconds: i64) -> Result<(), anyhow::Error>;
    async fn is_revoked(&self, jti: &str) -> Result<bool, anyhow::Error>;
    /// Drop entries whose TTL elapsed. Redis handles this natively; the
    /// in-memory index relies on the periodic sweep.
    async fn purge_expired(&self) -> Result<u64, anyhow::Error>;
    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

#[derive(Clone)]
pub struct RedisRevocationIndex {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisRevocationIndex {
    pub async fn new(url: &str) -> Result<Self, anyhow::Error> {
        tracing::info!(url = %url, "Connecting to Redis revocation index");
        let client = Client::open(url.to_string())?;

        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }
}

#[async_trait]
impl RevocationIndex for RedisRevocationIndex {
    async fn revoke(&self, jti: &str, ttl_seconds: i64) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        let key = format!("revoked:{}", jti);

        redis::cmd("SET")
            .arg(&key)
            .arg("revoked")
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to revoke token: {}", e))
    }

    async fn is_revoked(&self, jti: &str) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let key = format!("revoked:{}", jti);

        let exists: bool = redis::cmd("EXISTS")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to check revocation: {}", e))?;

        Ok(exists)
    }

    async fn purge_expired(&self) -> Result<u64, anyhow::Error> {
        // Redis expires keys itself.
        Ok(0)
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }
}

/// In-memory revocation index, used when no Redis URL is configured and in
/// tests.
#[derive(Default)]
pub struct MemoryRevocationIndex {
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryRevocationIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RevocationIndex for MemoryRevocationIndex {
    async fn revoke(&self, jti: &str, ttl_seconds: i64) -> Result<(), anyhow::Error> {
        let expiry = Utc::now() + Duration::seconds(ttl_seconds.max(1));
        self.entries
            .lock()
            .map_err(|e| anyhow::anyhow!("revocation index mutex poisoned: {}", e))?
            .entry(jti.to_string())
            .or_insert(expiry);
        Ok(())
    }

    async fn is_revoked(&self, jti: &str) -> Result<bool, anyhow::Error> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("revocation index mutex poisoned: {}", e))?;
        Ok(entries
            .get(jti)
            .map(|expiry| *expiry > Utc::now())
            .unwrap_or(false))
    }

    async fn purge_expired(&self) -> Result<u64, anyhow::Error> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("revocation index mutex poisoned: {}", e))?;
        let before = entries.len();
        let now = Utc::now();
        entries.retain(|_, expiry| *expiry > now);
        Ok((before - entries.len()) as u64)
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}
