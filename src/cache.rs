//! Query result cache.
//!
//! The builder talks to a [`CacheStore`]: plain get/set of serialized values
//! with a TTL. Invalidation is indirect: each table has a version stamp under
//! `table_version:<name>`, writes replace the stamp, and readers mix the
//! current stamps into their cache key, so a write makes every dependent key
//! unreachable without deleting anything.

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::binding::Binding;
use crate::config::CacheConfig;
use crate::error::DbResult;
use crate::paging::{PaginationSpec, SortSpec};

pub const TABLE_VERSION_PREFIX: &str = "table_version:";

/// Stamp reported for a table that has never been written.
pub const INITIAL_VERSION: &str = "0";

/// Key/value store with per-entry TTL.
pub trait CacheStore: Send + Sync {
    /// Readiness flag; callers skip the store entirely while it is false.
    fn is_ready(&self) -> bool;

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, DbResult<Option<String>>>;

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'a, DbResult<()>>;

    /// Hit/miss counters, for stores that keep them.
    fn stats(&self) -> Option<CacheStats> {
        None
    }
}

/// Cache intent attached to one query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheSpec {
    /// Entry TTL; the configured default when `None`.
    pub ttl: Option<Duration>,
    /// Tables read (for SELECT) or written (otherwise).
    pub tables: Vec<String>,
    /// Explicit key namespace; the key still varies with the statement.
    pub key: Option<String>,
}

impl CacheSpec {
    pub fn new<S: Into<String>>(tables: impl IntoIterator<Item = S>) -> Self {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Everything a cached SELECT result depends on.
#[derive(Debug)]
pub struct KeyMaterial<'a> {
    pub sql: &'a str,
    pub binding: &'a Binding,
    pub filter: &'a Binding,
    pub pagination: Option<&'a PaginationSpec>,
    pub sort: Option<&'a SortSpec>,
    pub table_versions: &'a BTreeMap<String, String>,
}

/// Key-sorted view of [`KeyMaterial`] so insertion order never changes the hash.
#[derive(Serialize)]
struct CanonicalMaterial<'a> {
    sql: &'a str,
    binding: BTreeMap<&'a str, &'a Value>,
    filter: BTreeMap<&'a str, &'a Value>,
    pagination: Option<&'a PaginationSpec>,
    sort: Option<&'a SortSpec>,
    table_versions: &'a BTreeMap<String, String>,
}

fn sorted(binding: &Binding) -> BTreeMap<&str, &Value> {
    binding.iter().map(|(k, v)| (k.as_str(), v)).collect()
}

/// `<namespace>:<sha256 of the key material>`.
pub fn cache_key(namespace: Option<&str>, material: &KeyMaterial<'_>) -> DbResult<String> {
    let canonical = CanonicalMaterial {
        sql: material.sql,
        binding: sorted(material.binding),
        filter: sorted(material.filter),
        pagination: material.pagination,
        sort: material.sort,
        table_versions: material.table_versions,
    };
    let digest = Sha256::digest(serde_json::to_vec(&canonical)?);
    Ok(format!("{}:{:x}", namespace.unwrap_or("query"), digest))
}

pub fn table_version_key(table: &str) -> String {
    format!("{}{}", TABLE_VERSION_PREFIX, table)
}

/// Fresh, time-ordered version stamp.
pub fn new_version_stamp() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Current stamp of every table, `INITIAL_VERSION` for unknown tables.
pub async fn table_versions(
    store: &dyn CacheStore,
    tables: &[String],
) -> DbResult<BTreeMap<String, String>> {
    let mut versions = BTreeMap::new();
    for table in tables {
        let stamp = store
            .get(&table_version_key(table))
            .await?
            .unwrap_or_else(|| INITIAL_VERSION.to_string());
        versions.insert(table.clone(), stamp);
    }
    Ok(versions)
}

/// Replace the stamp of every table concurrently. Returns the tables whose
/// bump failed.
pub async fn bump_table_versions(
    store: &dyn CacheStore,
    tables: &[String],
    ttl: Duration,
) -> Vec<(String, String)> {
    let bumps = tables.iter().map(|table| async move {
        let key = table_version_key(table);
        let result = store.set(&key, new_version_stamp(), ttl).await;
        (table, result)
    });

    join_all(bumps)
        .await
        .into_iter()
        .filter_map(|(table, result)| result.err().map(|e| (table.clone(), e.to_string())))
        .collect()
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Instant,
}

/// In-process [`CacheStore`] with TTL and an entry cap.
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    max_entries: usize,
    ready: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: DashMap::with_capacity(config.max_entries.min(4096)),
            max_entries: config.max_entries,
            ready: AtomicBool::new(config.enabled),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    fn get_sync(&self, key: &str) -> Option<String> {
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > Instant::now() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            drop(entry);
            self.entries.remove(key);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn set_sync(&self, key: &str, value: String, ttl: Duration) {
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(key) {
            self.evict_expired();

            if self.entries.len() >= self.max_entries {
                tracing::debug!("Cache full ({} entries), skipping '{}'", self.max_entries, key);
                return;
            }
        }

        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn evict_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl CacheStore for MemoryCache {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, DbResult<Option<String>>> {
        futures::future::ready(Ok(self.get_sync(key))).boxed()
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'a, DbResult<()>> {
        self.set_sync(key, value, ttl);
        futures::future::ready(Ok(())).boxed()
    }

    fn stats(&self) -> Option<CacheStats> {
        Some(MemoryCache::stats(self))
    }
}

/// Counters reported by [`MemoryCache`]. Table-version reads count as
/// lookups too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Percentage of lookups answered, 0 before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        match self.hits + self.misses {
            0 => 0.0,
            lookups => self.hits as f64 * 100.0 / lookups as f64,
        }
    }
}
