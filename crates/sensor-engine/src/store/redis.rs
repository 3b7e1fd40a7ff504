//! Redis-backed key/value store
//!
//! Each key is a hash `{v: value, r: revision}` under `sensor:<sensor>:`.
//! Conditional updates run as a Lua script so the revision check and the
//! write are atomic.

use super::{KeyValueStore, KvEntry, StoreError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;

const UPDATE_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'r')
local expected = tonumber(ARGV[2])
if current == false then
    if expected ~= 0 then
        return -1
    end
    current = 0
else
    current = tonumber(current)
    if current ~= expected then
        return -1
    end
end
local next = current + 1
redis.call('HSET', KEYS[1], 'v', ARGV[1], 'r', next)
return next
"#;

const PUT_SCRIPT: &str = r#"
local next = redis.call('HINCRBY', KEYS[1], 'r', 1)
redis.call('HSET', KEYS[1], 'v', ARGV[1])
return next
"#;

/// Redis key/value store scoped to one sensor
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    update_script: Script,
    put_script: Script,
}

impl RedisStore {
    /// Create a store for the given sensor
    ///
    /// # Arguments
    ///
    /// * `conn` - Redis connection manager
    /// * `sensor_name` - Sensor name, used as key prefix
    pub fn new(conn: ConnectionManager, sensor_name: &str) -> Self {
        Self {
            conn,
            prefix: format!("sensor:{}:", sensor_name),
            update_script: Script::new(UPDATE_SCRIPT),
            put_script: Script::new(PUT_SCRIPT),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

fn backend(e: redis::RedisError) -> StoreError {
    StoreError::backend(e.to_string())
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let (value, revision): (Option<Vec<u8>>, Option<u64>) = redis::cmd("HMGET")
            .arg(self.key(key))
            .arg("v")
            .arg("r")
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        Ok(match (value, revision) {
            (Some(value), Some(revision)) => Some(KvEntry { value, revision }),
            _ => None,
        })
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let revision: u64 = self
            .put_script
            .key(self.key(key))
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(revision)
    }

    async fn update(&self, key: &str, value: Vec<u8>, revision: u64) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let result: i64 = self
            .update_script
            .key(self.key(key))
            .arg(value)
            .arg(revision)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;

        if result < 0 {
            tracing::debug!(key = %key, expected_revision = revision, "Redis conditional update rejected");
            return Err(StoreError::RevisionMismatch { key: key.to_string() });
        }
        Ok(result as u64)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }
}
