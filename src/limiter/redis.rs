//! Distributed counter backed by a shared redis store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;

use super::counter::Counter;
use crate::error::{AdmissionError, Result};

/// The whole get-or-init-then-conditionally-increment step runs server
/// side in one round trip, so independent server processes sharing the
/// store observe a single consistent count per key. Counts saturate at
/// limit + 1, matching [`Counter`]'s contract.
const COUNT_SCRIPT: &str = r#"
local count = tonumber(redis.call('GET', KEYS[1]) or '0')
if count == 0 then
    redis.call('SET', KEYS[1], 1, 'EX', ARGV[2])
    return 1
end
if count <= tonumber(ARGV[1]) then
    return redis.call('INCR', KEYS[1])
end
return count
"#;

/// Counter backend for multi-process deployments.
///
/// State lives entirely in the store; no client-side read-modify-write
/// ever touches it. A failed round trip surfaces as
/// [`AdmissionError::BackendUnavailable`].
pub struct RedisCounter {
    conn: ConnectionManager,
    script: Script,
    key_prefix: String,
}

impl std::fmt::Debug for RedisCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounter")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisCounter {
    /// Connect to the store and prepare the counting script.
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| AdmissionError::InvalidConfiguration(format!("redis url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| AdmissionError::BackendUnavailable(e.to_string()))?;
        Ok(Self::from_connection(conn, key_prefix))
    }

    /// Reuse an existing managed connection.
    pub fn from_connection(conn: ConnectionManager, key_prefix: impl Into<String>) -> Self {
        Self {
            conn,
            script: Script::new(COUNT_SCRIPT),
            key_prefix: key_prefix.into(),
        }
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl Counter for RedisCounter {
    async fn count(&self, key: &str, limit: u64, window: Duration) -> Result<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = self
            .script
            .key(self.storage_key(key))
            .arg(limit)
            // EX rejects 0; a sub-second window still expires after 1s.
            .arg(window.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| AdmissionError::BackendUnavailable(e.to_string()))?;
        Ok(count)
    }
}
