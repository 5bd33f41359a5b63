//! C5 — the cursor & dedup `Store` trait, plus its two concrete adapters.
//!
//! `RedisStore` (A6) wraps an async multiplexed `redis` connection;
//! `InMemoryStore` (A7, test-only) is a `DashMap`-backed stand-in modeled
//! directly on `cache::MemoryCache` — lazy TTL expiry on read, no
//! background sweep.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::errors::SyncError;

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, SyncError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), SyncError>;
    async fn setex(&self, key: &str, ttl_seconds: u64, value: &str) -> Result<(), SyncError>;
    async fn delete(&self, key: &str) -> Result<(), SyncError>;
    async fn exists(&self, key: &str) -> Result<bool, SyncError>;
    /// Glob-style match (`*`, `?`) against stored keys, per §4.5.
    async fn keys(&self, glob_pattern: &str) -> Result<Vec<String>, SyncError>;
}

/// A6 — the production Store, backed by Redis.
pub struct RedisStore {
    connection: ConnectionManager,
    prefix: Option<String>,
}

impl RedisStore {
    pub async fn connect(url: &str, prefix: Option<String>) -> Result<Self, SyncError> {
        let client = redis::Client::open(url)
            .map_err(|e| SyncError::Store(format!("invalid redis url: {e}")))?;
        let connection = client
            .get_connection_manager()
            .await
            .map_err(|e| SyncError::Store(format!("could not connect to redis: {e}")))?;
        Ok(Self { connection, prefix })
    }

    fn prefixed(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}{key}"),
            None => key.to_string(),
        }
    }

    /// Whether `pattern` names exactly one key (no glob metacharacters) —
    /// in that case a direct `EXISTS`/single-key `KEYS` is safe; anything
    /// broader goes through the non-blocking `SCAN` cursor instead.
    fn is_anchored(pattern: &str) -> bool {
        !pattern.contains(['*', '?', '['])
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        let mut conn = self.connection.clone();
        conn.get(self.prefixed(key))
            .await
            .map_err(|e| SyncError::Store(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), SyncError> {
        let mut conn = self.connection.clone();
        conn.set(self.prefixed(key), value)
            .await
            .map_err(|e| SyncError::Store(e.to_string()))
    }

    async fn setex(&self, key: &str, ttl_seconds: u64, value: &str) -> Result<(), SyncError> {
        let mut conn = self.connection.clone();
        conn.set_ex(self.prefixed(key), value, ttl_seconds)
            .await
            .map_err(|e| SyncError::Store(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), SyncError> {
        let mut conn = self.connection.clone();
        conn.del(self.prefixed(key))
            .await
            .map_err(|e| SyncError::Store(e.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool, SyncError> {
        let mut conn = self.connection.clone();
        conn.exists(self.prefixed(key))
            .await
            .map_err(|e| SyncError::Store(e.to_string()))
    }

    async fn keys(&self, glob_pattern: &str) -> Result<Vec<String>, SyncError> {
        let pattern = self.prefixed(glob_pattern);
        let mut conn = self.connection.clone();

        if Self::is_anchored(glob_pattern) {
            let matched: Vec<String> = conn
                .keys(&pattern)
                .await
                .map_err(|e| SyncError::Store(e.to_string()))?;
            return Ok(strip_prefix(matched, self.prefix.as_deref()));
        }

        let mut cursor: u64 = 0;
        let mut found = Vec::new();
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
                .map_err(|e| SyncError::Store(e.to_string()))?;
            found.extend(batch);
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }
        Ok(strip_prefix(found, self.prefix.as_deref()))
    }
}

fn strip_prefix(keys: Vec<String>, prefix: Option<&str>) -> Vec<String> {
    match prefix {
        None => keys,
        Some(prefix) => keys
            .into_iter()
            .map(|k| k.strip_prefix(prefix).unwrap_or(&k).to_string())
            .collect(),
    }
}

/// A7 — test-only in-memory Store.
#[derive(Default)]
pub struct InMemoryStore {
    entries: DashMap<String, (String, Option<Instant>)>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let entry = self.entries.get(key)?;
        let (value, expires_at) = &*entry;
        match expires_at {
            Some(deadline) if Instant::now() > *deadline => None,
            _ => Some(value.clone()),
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        Ok(self.live_value(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), SyncError> {
        self.entries.insert(key.to_string(), (value.to_string(), None));
        Ok(())
    }

    async fn setex(&self, key: &str, ttl_seconds: u64, value: &str) -> Result<(), SyncError> {
        let deadline = Instant::now() + Duration::from_secs(ttl_seconds);
        self.entries
            .insert(key.to_string(), (value.to_string(), Some(deadline)));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SyncError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, SyncError> {
        Ok(self.live_value(key).is_some())
    }

    async fn keys(&self, glob_pattern: &str) -> Result<Vec<String>, SyncError> {
        let regex = glob_to_regex(glob_pattern);
        Ok(self
            .entries
            .iter()
            .filter(|entry| self.live_value(entry.key()).is_some())
            .map(|entry| entry.key().clone())
            .filter(|key| regex.is_match(key))
            .collect())
    }
}

fn glob_to_regex(pattern: &str) -> regex::Regex {
    let mut escaped = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => escaped.push_str(".*"),
            '?' => escaped.push('.'),
            c => escaped.push_str(&regex::escape(&c.to_string())),
        }
    }
    escaped.push('$');
    regex::Regex::new(&escaped).expect("glob_to_regex always builds a valid pattern")
}

pub type SharedStore = Arc<dyn Store>;
