//! Namespaced Redis caching layer
//!
//! Provides get/set/delete with TTLs, batched multi-get/multi-set, and a
//! cache-aside helper, all keyed as `{prefix}:{namespace}:{key}`.
//!
//! # Cache Strategy
//!
//! - **TTL**: per call, falling back to the configured default; zero means no expiry
//! - **Graceful degradation**: store and decode failures are logged and counted,
//!   reads then behave as misses and writes report `false`
//! - **Statistics**: hits, misses, sets, deletes and errors since start (or last reset)
//!
//! The storage itself sits behind [`CacheStore`] so the service can run against
//! Redis in production and [`InMemoryCacheStore`] in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::Result;

/// Number of keys requested per SCAN round-trip
const SCAN_BATCH: usize = 100;

/// Raw key/value storage used by [`CacheService`]
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value; `ttl = None` stores without expiry
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    /// Delete keys, returning how many existed
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// Fetch several keys; the result has one slot per key, in order
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    async fn mset(&self, entries: Vec<(String, String)>, ttl: Option<Duration>) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete every key matching a glob pattern (`*` and `?`)
    async fn delete_matching(&self, pattern: &str) -> Result<u64>;
}

/// Redis-backed cache store
#[derive(Clone)]
pub struct RedisCacheStore {
    redis: ConnectionManager,
}

impl RedisCacheStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

/// Expiry in whole milliseconds, never below 1 (`PX 0` is rejected by Redis)
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.redis.clone();
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.redis.clone();
        match ttl {
            Some(ttl) => {
                conn.pset_ex::<_, _, ()>(key, value, ttl_millis(ttl))
                    .await?
            }
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.redis.clone();
        Ok(conn.del::<_, u64>(keys).await?)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        // Explicit MGET so a single key still decodes as a list
        let values = redis::cmd("MGET")
            .arg(keys)
            .query_async::<Vec<Option<String>>>(&mut conn)
            .await?;
        Ok(values)
    }

    async fn mset(&self, entries: Vec<(String, String)>, ttl: Option<Duration>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        // MSET has no expiry option, so pipeline one SET per entry
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            let cmd = pipe.cmd("SET").arg(key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl_millis(ttl));
            }
            cmd.ignore();
        }

        let mut conn = self.redis.clone();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.redis.clone();
        Ok(conn.exists::<_, bool>(key).await?)
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        let mut conn = self.redis.clone();
        let mut cursor: u64 = 0;
        let mut deleted = 0;

        // SCAN instead of KEYS so large keyspaces don't block the server
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                deleted += conn.del::<_, u64>(&keys).await?;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(deleted)
    }
}

/// In-memory cache store with per-entry expiry
#[derive(Default)]
pub struct InMemoryCacheStore {
    entries: DashMap<String, (String, Option<Instant>)>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| e.value().1.map(|exp| exp > now).unwrap_or(true))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) => match entry.value().1 {
                Some(expires_at) if expires_at <= now => true,
                _ => return Some(entry.value().0.clone()),
            },
            None => return None,
        };

        if expired {
            self.entries.remove(key);
        }
        None
    }

    fn write(&self, key: String, value: String, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.insert(key, (value, expires_at));
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read(key))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        self.write(key.to_string(), value, ttl);
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        let mut deleted = 0;
        for key in keys {
            if self.read(key).is_some() && self.entries.remove(key).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        Ok(keys.iter().map(|k| self.read(k)).collect())
    }

    async fn mset(&self, entries: Vec<(String, String)>, ttl: Option<Duration>) -> Result<()> {
        for (key, value) in entries {
            self.write(key, value, ttl);
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.read(key).is_some())
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        let matching: Vec<String> = self
            .entries
            .iter()
            .filter(|e| glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();

        self.delete(&matching).await
    }
}

/// Minimal glob matcher supporting `*` and `?`, as used by Redis `MATCH`
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Per-call cache options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheOptions {
    /// Namespace inserted between the global prefix and the key
    pub namespace: Option<String>,
    /// Expiry; `None` uses the service default, zero disables expiry
    pub ttl: Option<Duration>,
}

impl CacheOptions {
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
}

impl CacheStats {
    /// Fraction of lookups that hit, 0.0 when nothing was looked up
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn hit(&self, n: u64) {
        self.hits.fetch_add(n, Ordering::Relaxed);
        metrics::counter!("cache_hits_total").increment(n);
    }

    fn miss(&self, n: u64) {
        self.misses.fetch_add(n, Ordering::Relaxed);
        metrics::counter!("cache_misses_total").increment(n);
    }

    fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("cache_errors_total").increment(1);
    }
}

/// Namespaced cache with TTLs and statistics
#[derive(Clone)]
pub struct CacheService {
    store: Arc<dyn CacheStore>,
    prefix: String,
    default_ttl: Duration,
    enabled: bool,
    counters: Arc<Counters>,
}

impl CacheService {
    /// Create a cache service over any store
    ///
    /// # Arguments
    ///
    /// * `store` - Backing key/value store
    /// * `config` - Enable flag and default TTL
    /// * `prefix` - Global key prefix (empty for none)
    pub fn new(store: Arc<dyn CacheStore>, config: &CacheConfig, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();

        debug!(
            prefix = %prefix,
            default_ttl_secs = config.default_ttl_secs,
            enabled = config.enabled,
            "Initializing CacheService"
        );

        Self {
            store,
            prefix,
            default_ttl: config.default_ttl(),
            enabled: config.enabled,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Create a cache service backed by Redis
    pub fn redis(redis: ConnectionManager, config: &CacheConfig, prefix: impl Into<String>) -> Self {
        Self::new(Arc::new(RedisCacheStore::new(redis)), config, prefix)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Build the full storage key for `key` under the options' namespace
    pub fn build_key(&self, key: &str, opts: &CacheOptions) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(3);
        if !self.prefix.is_empty() {
            parts.push(&self.prefix);
        }
        if let Some(ns) = opts.namespace.as_deref().filter(|ns| !ns.is_empty()) {
            parts.push(ns);
        }
        parts.push(key);
        parts.join(":")
    }

    fn resolve_ttl(&self, opts: &CacheOptions) -> Option<Duration> {
        let ttl = opts.ttl.unwrap_or(self.default_ttl);
        if ttl.is_zero() {
            None
        } else {
            Some(ttl)
        }
    }

    fn decode<T: DeserializeOwned>(&self, key: &str, raw: &str) -> Option<T> {
        match serde_json::from_str(raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = key, error = %e, "Failed to deserialize cached value");
                self.counters.error();
                None
            }
        }
    }

    /// Get a value; `None` on miss, decode failure or store error
    pub async fn get<T: DeserializeOwned>(&self, key: &str, opts: &CacheOptions) -> Option<T> {
        if !self.enabled {
            return None;
        }

        let full_key = self.build_key(key, opts);

        match self.store.get(&full_key).await {
            Ok(Some(raw)) => {
                let value = self.decode(&full_key, &raw);
                if value.is_some() {
                    debug!(key = %full_key, "Cache HIT");
                    self.counters.hit(1);
                } else {
                    self.counters.miss(1);
                }
                value
            }
            Ok(None) => {
                debug!(key = %full_key, "Cache MISS");
                self.counters.miss(1);
                None
            }
            Err(e) => {
                warn!(key = %full_key, error = %e, "Cache read failed");
                self.counters.error();
                None
            }
        }
    }

    /// Store a value; returns whether it was written
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, opts: &CacheOptions) -> bool {
        if !self.enabled {
            return false;
        }

        let full_key = self.build_key(key, opts);

        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %full_key, error = %e, "Failed to serialize value for cache");
                self.counters.error();
                return false;
            }
        };

        match self.store.set(&full_key, raw, self.resolve_ttl(opts)).await {
            Ok(()) => {
                self.counters.sets.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                warn!(key = %full_key, error = %e, "Cache write failed");
                self.counters.error();
                false
            }
        }
    }

    /// Delete a key; returns whether it existed
    pub async fn delete(&self, key: &str, opts: &CacheOptions) -> bool {
        if !self.enabled {
            return false;
        }

        let full_key = self.build_key(key, opts);

        match self.store.delete(&[full_key.clone()]).await {
            Ok(n) => {
                self.counters.deletes.fetch_add(n, Ordering::Relaxed);
                n > 0
            }
            Err(e) => {
                warn!(key = %full_key, error = %e, "Cache delete failed");
                self.counters.error();
                false
            }
        }
    }

    pub async fn exists(&self, key: &str, opts: &CacheOptions) -> bool {
        if !self.enabled {
            return false;
        }

        let full_key = self.build_key(key, opts);
        match self.store.exists(&full_key).await {
            Ok(found) => found,
            Err(e) => {
                warn!(key = %full_key, error = %e, "Cache exists check failed");
                self.counters.error();
                false
            }
        }
    }

    /// Get several values in one round-trip
    ///
    /// The result has one slot per requested key, in the same order.
    pub async fn mget<T: DeserializeOwned>(
        &self,
        keys: &[&str],
        opts: &CacheOptions,
    ) -> Vec<Option<T>> {
        if !self.enabled || keys.is_empty() {
            return keys.iter().map(|_| None).collect();
        }

        let full_keys: Vec<String> = keys.iter().map(|k| self.build_key(k, opts)).collect();

        let raws = match self.store.mget(&full_keys).await {
            Ok(raws) => raws,
            Err(e) => {
                warn!(keys = full_keys.len(), error = %e, "Cache batch read failed");
                self.counters.error();
                return keys.iter().map(|_| None).collect();
            }
        };

        let values: Vec<Option<T>> = full_keys
            .iter()
            .zip(raws)
            .map(|(key, raw)| raw.and_then(|raw| self.decode(key, &raw)))
            .collect();

        let hits = values.iter().filter(|v| v.is_some()).count() as u64;
        self.counters.hit(hits);
        self.counters.miss(values.len() as u64 - hits);

        values
    }

    /// Store several values with the same options
    pub async fn mset<K, T>(&self, entries: &[(K, T)], opts: &CacheOptions) -> bool
    where
        K: AsRef<str>,
        T: Serialize,
    {
        if !self.enabled {
            return false;
        }
        if entries.is_empty() {
            return true;
        }

        let mut encoded = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let full_key = self.build_key(key.as_ref(), opts);
            match serde_json::to_string(value) {
                Ok(raw) => encoded.push((full_key, raw)),
                Err(e) => {
                    warn!(key = %full_key, error = %e, "Failed to serialize value for cache");
                    self.counters.error();
                    return false;
                }
            }
        }

        let count = encoded.len() as u64;
        match self.store.mset(encoded, self.resolve_ttl(opts)).await {
            Ok(()) => {
                self.counters.sets.fetch_add(count, Ordering::Relaxed);
                true
            }
            Err(e) => {
                warn!(entries = count, error = %e, "Cache batch write failed");
                self.counters.error();
                false
            }
        }
    }

    /// Get from cache or run `fetch` and cache what it returns
    ///
    /// Fetch errors propagate; cache failures never do.
    pub async fn get_or_set<T, F, Fut>(
        &self,
        key: &str,
        opts: &CacheOptions,
        fetch: F,
    ) -> anyhow::Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut + Send,
        Fut: std::future::Future<Output = anyhow::Result<Option<T>>> + Send,
    {
        if let Some(cached) = self.get::<T>(key, opts).await {
            return Ok(Some(cached));
        }

        let fetched = fetch().await?;

        if let Some(ref value) = fetched {
            self.set(key, value, opts).await;
        }

        Ok(fetched)
    }

    /// Delete every key in a namespace; returns how many were removed
    pub async fn invalidate_namespace(&self, namespace: &str) -> u64 {
        if !self.enabled {
            return 0;
        }

        let pattern = self.build_key("*", &CacheOptions::namespace(namespace));

        match self.store.delete_matching(&pattern).await {
            Ok(n) => {
                debug!(namespace = namespace, deleted = n, "Invalidated cache namespace");
                self.counters.deletes.fetch_add(n, Ordering::Relaxed);
                n
            }
            Err(e) => {
                warn!(namespace = namespace, error = %e, "Cache namespace invalidation failed");
                self.counters.error();
                0
            }
        }
    }

    /// Current counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.counters.hits.store(0, Ordering::Relaxed);
        self.counters.misses.store(0, Ordering::Relaxed);
        self.counters.sets.store(0, Ordering::Relaxed);
        self.counters.deletes.store(0, Ordering::Relaxed);
        self.counters.errors.store(0, Ordering::Relaxed);
    }
}
