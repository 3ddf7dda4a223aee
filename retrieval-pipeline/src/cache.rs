use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use common::utils::{config::CacheSettings, similarity::cosine_similarity};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// A stored response keyed by the embedding of the query that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub id: Uuid,
    pub query_text: String,
    #[serde(skip)]
    pub query_embedding: Vec<f32>,
    pub response: Value,
    pub scope_id: String,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub hit_count: u64,
    pub last_hit_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn age_seconds_at(&self, now: DateTime<Utc>) -> f64 {
        ((now - self.created_at).num_milliseconds().max(0) as f64) / 1000.0
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.age_seconds_at(now) >= self.ttl_seconds as f64
    }

    /// Eviction value: rarely hit, old entries score lowest.
    pub fn value_at(&self, now: DateTime<Utc>) -> f64 {
        self.hit_count as f64 / (self.age_seconds_at(now) + 1.0)
    }

    fn record_hit(&mut self, now: DateTime<Utc>) {
        self.hit_count += 1;
        self.last_hit_at = Some(now);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheLookup {
    pub found: bool,
    pub entry: Option<CacheEntry>,
    /// Best similarity seen in the scope, reported on misses too.
    pub similarity: f32,
    pub age_seconds: f64,
}

impl CacheLookup {
    const fn miss(similarity: f32, age_seconds: f64) -> Self {
        Self {
            found: false,
            entry: None,
            similarity,
            age_seconds,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub scopes: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

/// Response cache matched by embedding similarity instead of exact query text.
///
/// Entries are partitioned by scope. Storage is bounded per scope and in total; when
/// a bound is reached, expired entries go first and then the least valuable ones.
pub struct SemanticCache {
    settings: CacheSettings,
    scopes: RwLock<HashMap<String, Vec<CacheEntry>>>,
    counters: Counters,
}

impl SemanticCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            scopes: RwLock::default(),
            counters: Counters::default(),
        }
    }

    pub const fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub async fn lookup(&self, query_embedding: &[f32], scope_id: &str) -> CacheLookup {
        self.lookup_at(query_embedding, scope_id, Utc::now()).await
    }

    /// Finds the most similar live entry in `scope_id`. It is a hit when its
    /// similarity is at least the configured threshold.
    pub async fn lookup_at(
        &self,
        query_embedding: &[f32],
        scope_id: &str,
        now: DateTime<Utc>,
    ) -> CacheLookup {
        if !self.settings.enabled || query_embedding.is_empty() {
            return CacheLookup::miss(0.0, 0.0);
        }

        let mut scopes = self.scopes.write().await;
        let Some(entries) = scopes.get_mut(scope_id) else {
            Counters::bump(&self.counters.misses, 1);
            debug!(scope_id, "Cache miss; scope empty");
            return CacheLookup::miss(0.0, 0.0);
        };

        let before = entries.len();
        entries.retain(|entry| !entry.is_expired_at(now));
        Counters::bump(&self.counters.expirations, (before - entries.len()) as u64);

        let mut best: Option<(usize, f32)> = None;
        for (position, entry) in entries.iter().enumerate() {
            let similarity = cosine_similarity(query_embedding, &entry.query_embedding);
            if best.map_or(true, |(_, current)| similarity > current) {
                best = Some((position, similarity));
            }
        }

        let outcome = match best.and_then(|(position, similarity)| {
            entries.get_mut(position).map(|entry| (entry, similarity))
        }) {
            Some((entry, similarity)) if similarity >= self.settings.similarity_threshold => {
                entry.record_hit(now);
                Counters::bump(&self.counters.hits, 1);
                debug!(scope_id, similarity, hits = entry.hit_count, "Cache hit");
                CacheLookup {
                    found: true,
                    entry: Some(entry.clone()),
                    similarity,
                    age_seconds: entry.age_seconds_at(now),
                }
            }
            Some((entry, similarity)) => {
                Counters::bump(&self.counters.misses, 1);
                debug!(scope_id, similarity, "Cache miss; below threshold");
                CacheLookup::miss(similarity, entry.age_seconds_at(now))
            }
            None => {
                Counters::bump(&self.counters.misses, 1);
                debug!(scope_id, "Cache miss; no live entries");
                CacheLookup::miss(0.0, 0.0)
            }
        };

        if entries.is_empty() {
            scopes.remove(scope_id);
        }
        outcome
    }

    pub async fn store(
        &self,
        query_text: &str,
        query_embedding: Vec<f32>,
        response: Value,
        scope_id: &str,
        ttl_override: Option<u64>,
    ) -> bool {
        self.store_at(
            query_text,
            query_embedding,
            response,
            scope_id,
            ttl_override,
            Utc::now(),
        )
        .await
    }

    /// Inserts a new entry after making room for it. Returns `false` when caching is
    /// disabled or the embedding is empty.
    pub async fn store_at(
        &self,
        query_text: &str,
        query_embedding: Vec<f32>,
        response: Value,
        scope_id: &str,
        ttl_override: Option<u64>,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.settings.enabled || query_embedding.is_empty() {
            return false;
        }

        let mut scopes = self.scopes.write().await;
        self.make_room_in_scope(&mut scopes, scope_id, now);
        self.make_room_globally(&mut scopes, now);

        let entry = CacheEntry {
            id: Uuid::new_v4(),
            query_text: query_text.to_owned(),
            query_embedding,
            response,
            scope_id: scope_id.to_owned(),
            created_at: now,
            ttl_seconds: ttl_override.unwrap_or(self.settings.default_ttl_seconds),
            hit_count: 0,
            last_hit_at: None,
        };
        scopes.entry(scope_id.to_owned()).or_default().push(entry);
        Counters::bump(&self.counters.stores, 1);
        debug!(scope_id, "Stored cache entry");
        true
    }

    fn make_room_in_scope(
        &self,
        scopes: &mut HashMap<String, Vec<CacheEntry>>,
        scope_id: &str,
        now: DateTime<Utc>,
    ) {
        let cap = self.settings.max_entries_per_scope.max(1);
        let Some(entries) = scopes.get_mut(scope_id) else {
            return;
        };
        if entries.len() < cap {
            return;
        }

        let before = entries.len();
        entries.retain(|entry| !entry.is_expired_at(now));
        Counters::bump(&self.counters.expirations, (before - entries.len()) as u64);

        while entries.len() >= cap {
            let Some(position) = least_valuable(entries.iter().enumerate(), now) else {
                break;
            };
            let evicted = entries.remove(position);
            Counters::bump(&self.counters.evictions, 1);
            debug!(scope_id, hits = evicted.hit_count, "Evicted cache entry from full scope");
        }
    }

    fn make_room_globally(&self, scopes: &mut HashMap<String, Vec<CacheEntry>>, now: DateTime<Utc>) {
        let cap = self.settings.max_total_entries.max(1);
        let total = |scopes: &HashMap<String, Vec<CacheEntry>>| {
            scopes.values().map(Vec::len).sum::<usize>()
        };
        if total(scopes) < cap {
            return;
        }

        for entries in scopes.values_mut() {
            let before = entries.len();
            entries.retain(|entry| !entry.is_expired_at(now));
            Counters::bump(&self.counters.expirations, (before - entries.len()) as u64);
        }

        while total(scopes) >= cap {
            let victim = scopes
                .iter()
                .flat_map(|(scope, entries)| {
                    entries
                        .iter()
                        .enumerate()
                        .map(move |(position, entry)| (scope.as_str(), position, entry))
                })
                .fold(None::<(&str, usize, f64)>, |lowest, (scope, position, entry)| {
                    let value = entry.value_at(now);
                    match lowest {
                        Some((_, _, current)) if current <= value => lowest,
                        _ => Some((scope, position, value)),
                    }
                })
                .map(|(scope, position, _)| (scope.to_owned(), position));

            let Some((scope, position)) = victim else {
                break;
            };
            if let Some(entries) = scopes.get_mut(&scope) {
                entries.remove(position);
                Counters::bump(&self.counters.evictions, 1);
                debug!(scope_id = %scope, "Evicted cache entry to respect global cap");
            }
        }

        scopes.retain(|_, entries| !entries.is_empty());
    }

    /// Removes every entry for `scope_id`, returning how many were dropped.
    pub async fn clear_scope(&self, scope_id: &str) -> usize {
        self.scopes
            .write()
            .await
            .remove(scope_id)
            .map_or(0, |entries| entries.len())
    }

    pub async fn len(&self) -> usize {
        self.scopes.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn scope_len(&self, scope_id: &str) -> usize {
        self.scopes.read().await.get(scope_id).map_or(0, Vec::len)
    }

    pub async fn stats(&self) -> CacheStats {
        let scopes = self.scopes.read().await;
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stores: self.counters.stores.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            entries: scopes.values().map(Vec::len).sum(),
            scopes: scopes.len(),
        }
    }
}

/// Position of the lowest-value entry. Ties go to the earliest entry.
fn least_valuable<'a>(
    entries: impl Iterator<Item = (usize, &'a CacheEntry)>,
    now: DateTime<Utc>,
) -> Option<usize> {
    entries
        .map(|(position, entry)| (position, entry.value_at(now)))
        .fold(None::<(usize, f64)>, |lowest, (position, value)| match lowest {
            Some((_, current)) if current <= value => lowest,
            _ => Some((position, value)),
        })
        .map(|(position, _)| position)
}
