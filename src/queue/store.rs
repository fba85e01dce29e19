//! Pluggable result store.
//!
//! The queue service keeps every process record in a [`ResultStore`]. The
//! default is the in-process [`MemoryStore`]; with the `redis` feature the
//! records can live in an external cache instead ([`RedisStore`]), so the
//! service process itself holds no state worth losing.

use super::types::{ProcessId, ProcessRecord};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Writes every `(key, record)` pair, overwriting existing keys.
    async fn update(&self, batch: Vec<ProcessRecord>) -> Result<()>;

    async fn get(&self, key: &ProcessId) -> Result<Option<ProcessRecord>>;

    /// Removes and returns the record, `None` if it was not there.
    async fn pop(&self, key: &ProcessId) -> Result<Option<ProcessRecord>>;

    async fn len(&self) -> Result<usize>;

    /// Inserts the record only if the key is absent. Returns whether it was inserted.
    async fn insert_new(&self, record: ProcessRecord) -> Result<bool> {
        if self.get(&record.process_id).await?.is_some() {
            return Ok(false);
        }
        self.update(vec![record]).await?;
        Ok(true)
    }
}

/// In-process store backed by a `DashMap`.
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<ProcessId, ProcessRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn update(&self, batch: Vec<ProcessRecord>) -> Result<()> {
        for record in batch {
            self.records.insert(record.process_id.clone(), record);
        }
        Ok(())
    }

    async fn get(&self, key: &ProcessId) -> Result<Option<ProcessRecord>> {
        Ok(self.records.get(key).map(|entry| entry.value().clone()))
    }

    async fn pop(&self, key: &ProcessId) -> Result<Option<ProcessRecord>> {
        Ok(self.records.remove(key).map(|(_, record)| record))
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.records.len())
    }

    async fn insert_new(&self, record: ProcessRecord) -> Result<bool> {
        use dashmap::mapref::entry::Entry;

        match self.records.entry(record.process_id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(true)
            }
        }
    }
}

#[cfg(feature = "redis")]
pub use self::redis_store::RedisStore;

#[cfg(feature = "redis")]
mod redis_store {
    //! Redis-backed store.
    //!
    //! Records are JSON strings under `{prefix}:rec:{processId}`. A set at
    //! `{prefix}:ids` indexes live keys so `len()` is a single `SCARD`.
    //! Writes and pops run as Lua scripts to keep record and index in step.

    use super::*;
    use ::redis::aio::MultiplexedConnection;
    use ::redis::{AsyncCommands, Script};

    /// KEYS[1] = record key, KEYS[2] = index set. ARGV[1] = json, ARGV[2] = id.
    const LUA_SET: &str = r#"
redis.call('SET', KEYS[1], ARGV[1])
redis.call('SADD', KEYS[2], ARGV[2])
return 1
"#;

    /// Same keys as LUA_SET; only writes when the record key is absent.
    const LUA_SET_NX: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('SET', KEYS[1], ARGV[1])
redis.call('SADD', KEYS[2], ARGV[2])
return 1
"#;

    /// KEYS[1] = record key, KEYS[2] = index set. ARGV[1] = id.
    const LUA_POP: &str = r#"
local value = redis.call('GET', KEYS[1])
if value then
    redis.call('DEL', KEYS[1])
    redis.call('SREM', KEYS[2], ARGV[1])
end
return value
"#;

    #[derive(Clone)]
    pub struct RedisStore {
        conn: MultiplexedConnection,
        key_prefix: String,
    }

    impl RedisStore {
        /// Connects to `redis://host:port[/db]`.
        pub async fn connect(url: &str) -> Result<Self> {
            let client = ::redis::Client::open(url)
                .map_err(|e| anyhow::anyhow!("failed to create Redis client: {}", e))?;
            let conn = client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| anyhow::anyhow!("failed to connect to Redis: {}", e))?;
            tracing::info!("Connected result store to {}", url);
            Ok(Self {
                conn,
                key_prefix: "task_cluster".to_string(),
            })
        }

        pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
            self.key_prefix = prefix.into();
            self
        }

        fn record_key(&self, key: &ProcessId) -> String {
            format!("{}:rec:{}", self.key_prefix, key)
        }

        fn index_key(&self) -> String {
            format!("{}:ids", self.key_prefix)
        }
    }

    #[async_trait]
    impl ResultStore for RedisStore {
        async fn update(&self, batch: Vec<ProcessRecord>) -> Result<()> {
            let mut conn = self.conn.clone();
            let script = Script::new(LUA_SET);
            for record in batch {
                let json = serde_json::to_string(&record)?;
                let _: i64 = script
                    .key(self.record_key(&record.process_id))
                    .key(self.index_key())
                    .arg(json)
                    .arg(record.process_id.to_string())
                    .invoke_async(&mut conn)
                    .await?;
            }
            Ok(())
        }

        async fn get(&self, key: &ProcessId) -> Result<Option<ProcessRecord>> {
            let mut conn = self.conn.clone();
            let raw: Option<String> = conn.get(self.record_key(key)).await?;
            raw.map(|json| serde_json::from_str(&json).map_err(anyhow::Error::from))
                .transpose()
        }

        async fn pop(&self, key: &ProcessId) -> Result<Option<ProcessRecord>> {
            let mut conn = self.conn.clone();
            let raw: Option<String> = Script::new(LUA_POP)
                .key(self.record_key(key))
                .key(self.index_key())
                .arg(key.to_string())
                .invoke_async(&mut conn)
                .await?;
            raw.map(|json| serde_json::from_str(&json).map_err(anyhow::Error::from))
                .transpose()
        }

        async fn len(&self) -> Result<usize> {
            let mut conn = self.conn.clone();
            let count: usize = conn.scard(self.index_key()).await?;
            Ok(count)
        }

        async fn insert_new(&self, record: ProcessRecord) -> Result<bool> {
            let mut conn = self.conn.clone();
            let json = serde_json::to_string(&record)?;
            let inserted: i64 = Script::new(LUA_SET_NX)
                .key(self.record_key(&record.process_id))
                .key(self.index_key())
                .arg(json)
                .arg(record.process_id.to_string())
                .invoke_async(&mut conn)
                .await?;
            Ok(inserted == 1)
        }
    }
}
