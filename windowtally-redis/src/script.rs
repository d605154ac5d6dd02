//! The server-side add-and-get script.
//!
//! The whole read, cap, write and TTL refresh runs inside one `EVALSHA`, so no
//! other client can interleave between reading a bucket and writing it back.

use redis::aio::ConnectionLike;
use redis::{RedisResult, Script};
use windowtally::StoreError;

pub(crate) const SCRIPT_NAME: &str = "counter.lua";
const SOURCE: &str = include_str!("counter.lua");

/// Sentinel passed for "no ceiling".
const NO_CEILING: i64 = -1;

#[derive(Debug, Clone)]
pub(crate) struct CounterScript {
    script: Script,
}

impl CounterScript {
    /// Register the script with the server.
    ///
    /// # Errors
    /// `ResourceLoad` if the server rejects the script or reports a different
    /// digest. There is no non-atomic fallback.
    pub(crate) async fn load<C: ConnectionLike>(conn: &mut C) -> Result<Self, StoreError> {
        let script = Script::new(SOURCE);
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(SOURCE)
            .query_async(conn)
            .await
            .map_err(|e| StoreError::ResourceLoad { name: SCRIPT_NAME.into(), reason: e.to_string() })?;
        if sha != script.get_hash() {
            return Err(StoreError::ResourceLoad {
                name: SCRIPT_NAME.into(),
                reason: format!("server digest {sha} does not match {}", script.get_hash()),
            });
        }
        Ok(Self { script })
    }

    /// Add `cost` to `key`, capped at `ceiling - counted` when a ceiling is given,
    /// and refresh the key's TTL. Returns the bucket's new value.
    pub(crate) async fn add_and_get<C: ConnectionLike>(
        &self,
        conn: &mut C,
        key: &str,
        cost: u64,
        ceiling: Option<u64>,
        counted: u64,
        ttl_secs: u64,
    ) -> RedisResult<i64> {
        let ceiling = ceiling.map_or(NO_CEILING, |c| i64::try_from(c).unwrap_or(i64::MAX));
        self.script
            .key(key)
            .arg(cost)
            .arg(ceiling)
            .arg(counted)
            .arg(ttl_secs)
            .invoke_async(conn)
            .await
    }
}
