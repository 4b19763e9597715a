//! Redis rebuild lock.
//!
//! For workers spread over several hosts. Acquisition is a single
//! `SET key value NX PX ttl`; release runs a compare-and-delete script so a
//! holder whose TTL ran out cannot drop a lock someone else has since taken.
//!
//! The stored value is `"{token}:{holder}"`. Tokens are UUIDs and never
//! contain `:`, so the holder is everything after the first colon.

#[cfg(feature = "redis")]
mod implementation {
    use crate::storage::traits::{LockService, LockToken};
    use crate::{Error, Result};
    use redis::{Client, Connection};
    use std::sync::Mutex;
    use std::time::Duration;
    use tracing::debug;

    /// Response timeout for Redis commands.
    const REDIS_TIMEOUT: Duration = Duration::from_secs(5);

    const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

    /// Redis-backed [`LockService`].
    pub struct RedisLockService {
        client: Client,
        key_prefix: String,
        connection: Mutex<Option<Connection>>,
    }

    impl RedisLockService {
        /// Creates a lock service for the server at `connection_url`.
        ///
        /// # Errors
        ///
        /// Returns an error if the URL is invalid.
        pub fn new(connection_url: &str, key_prefix: impl Into<String>) -> Result<Self> {
            let client = Client::open(connection_url)
                .map_err(|e| Error::operation("redis_connect", e))?;
            Ok(Self {
                client,
                key_prefix: key_prefix.into(),
                connection: Mutex::new(None),
            })
        }

        fn key(&self, name: &str) -> String {
            format!("{}:lock:{name}", self.key_prefix)
        }

        fn get_connection(&self) -> Result<Connection> {
            if let Ok(mut guard) = self.connection.lock()
                && let Some(conn) = guard.take()
            {
                return Ok(conn);
            }

            let conn = self
                .client
                .get_connection()
                .map_err(|e| Error::operation("redis_get_connection", e))?;
            conn.set_read_timeout(Some(REDIS_TIMEOUT))
                .map_err(|e| Error::operation("redis_set_read_timeout", e))?;
            conn.set_write_timeout(Some(REDIS_TIMEOUT))
                .map_err(|e| Error::operation("redis_set_write_timeout", e))?;
            Ok(conn)
        }

        fn return_connection(&self, conn: Connection) {
            if let Ok(mut guard) = self.connection.lock() {
                *guard = Some(conn);
            }
        }

        /// Runs `op` on a pooled connection; the connection is dropped on
        /// error so the next call reconnects.
        fn with_connection<T>(
            &self,
            operation: &'static str,
            op: impl FnOnce(&mut Connection) -> redis::RedisResult<T>,
        ) -> Result<T> {
            let mut conn = self.get_connection()?;
            match op(&mut conn) {
                Ok(value) => {
                    self.return_connection(conn);
                    Ok(value)
                },
                Err(e) => Err(Error::operation(operation, e)),
            }
        }
    }

    impl LockService for RedisLockService {
        fn try_acquire(
            &self,
            name: &str,
            holder: &str,
            ttl: Duration,
        ) -> Result<Option<LockToken>> {
            let token = LockToken::new(name, holder, ttl);
            let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
            let value = format!("{}:{holder}", token.token);
            let key = self.key(name);

            let reply: Option<String> = self.with_connection("redis_lock_acquire", |conn| {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(&value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query(conn)
            })?;

            if reply.is_none() {
                debug!(lock = name, "rebuild lock held elsewhere");
                return Ok(None);
            }
            Ok(Some(token))
        }

        fn release(&self, token: &LockToken) -> Result<bool> {
            let key = self.key(&token.name);
            let value = format!("{}:{}", token.token, token.holder);
            let removed: i64 = self.with_connection("redis_lock_release", |conn| {
                redis::Script::new(RELEASE_SCRIPT)
                    .key(&key)
                    .arg(&value)
                    .invoke(conn)
            })?;
            Ok(removed > 0)
        }

        fn holder(&self, name: &str) -> Result<Option<String>> {
            let key = self.key(name);
            let value: Option<String> = self.with_connection("redis_lock_holder", |conn| {
                redis::cmd("GET").arg(&key).query(conn)
            })?;
            Ok(value.and_then(|v| v.split_once(':').map(|(_, holder)| holder.to_string())))
        }
    }
}

#[cfg(feature = "redis")]
pub use implementation::RedisLockService;

#[cfg(not(feature = "redis"))]
mod stub {
    use crate::storage::traits::{LockService, LockToken};
    use crate::{Error, Result};
    use std::time::Duration;

    /// Stub Redis lock service when the feature is not enabled.
    pub struct RedisLockService;

    impl RedisLockService {
        /// Creates a Redis lock service (stub).
        ///
        /// # Errors
        ///
        /// Always returns an error because the feature is not enabled.
        pub fn new(_connection_url: &str, _key_prefix: impl Into<String>) -> Result<Self> {
            Err(Error::FeatureNotEnabled("redis".to_string()))
        }
    }

    impl LockService for RedisLockService {
        fn try_acquire(
            &self,
            _name: &str,
            _holder: &str,
            _ttl: Duration,
        ) -> Result<Option<LockToken>> {
            Err(Error::FeatureNotEnabled("redis".to_string()))
        }

        fn release(&self, _token: &LockToken) -> Result<bool> {
            Err(Error::FeatureNotEnabled("redis".to_string()))
        }

        fn holder(&self, _name: &str) -> Result<Option<String>> {
            Err(Error::FeatureNotEnabled("redis".to_string()))
        }
    }
}

#[cfg(not(feature = "redis"))]
pub use stub::RedisLockService;
