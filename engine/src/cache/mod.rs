//! Semantic response cache
//!
//! Approximate key-value cache for generated answers. A lookup embeds the
//! query, finds the nearest previously answered query in the similarity index
//! and returns its record if the two are similar enough and the record has not
//! expired. Exact-text keys (a fingerprint of the normalised query) address
//! the value store.
//!
//! The cache never fails its caller: lookups that cannot complete are misses
//! and inserts that cannot complete are reported as `InsertOutcome::Failed`.

pub mod index;
pub mod store;

pub use index::{IndexEntry, Neighbor, SimilarityIndex};
pub use store::{CacheEntry, SqliteValueStore, StoreCounts, ValueStore};

use crate::llm::EmbeddingProvider;
use chrono::{DateTime, Duration, TimeZone, Utc};
use sdk::errors::EngineError;
use sdk::types::Source;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Source of "now" for expiry decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        self.millis.store(now.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.millis.load(Ordering::SeqCst))
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Value-store key for a query: SHA-256 of the trimmed, lowercased text
pub fn fingerprint(query: &str) -> String {
    let normalized = query.trim().to_lowercase();
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub entry: CacheEntry,
    pub similarity: f32,
    /// The previously answered query that matched
    pub matched_query: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheMiss {
    EmptyIndex,
    BelowThreshold { similarity: f32 },
    /// Index pointed at a key the value store no longer has
    Dangling,
    Expired,
    /// Embedding, index or store failed; the lookup failed open
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(CacheHit),
    Miss(CacheMiss),
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Stored { key: String },
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub index_entries: usize,
    pub dimension: Option<usize>,
    pub live_records: u64,
    pub expired_records: u64,
    pub similarity_threshold: f32,
    pub ttl_hours: i64,
}

pub struct SemanticCache {
    embedder: Arc<dyn EmbeddingProvider>,
    index: SimilarityIndex,
    store: Arc<dyn ValueStore>,
    clock: Arc<dyn Clock>,
    threshold: f32,
    ttl: Duration,
    // Serializes index mutation + persistence
    write_lock: Mutex<()>,
}

impl SemanticCache {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        index: SimilarityIndex,
        store: Arc<dyn ValueStore>,
        threshold: f32,
        ttl: Duration,
    ) -> Self {
        Self {
            embedder,
            index,
            store,
            clock: Arc::new(SystemClock),
            threshold,
            ttl,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Find a cached answer for a query similar to `query`
    pub async fn lookup(&self, query: &str) -> CacheLookup {
        match self.try_lookup(query).await {
            Ok(lookup) => lookup,
            Err(e) => {
                warn!("Cache lookup failed, treating as miss: {}", e);
                CacheLookup::Miss(CacheMiss::Unavailable(e.to_string()))
            }
        }
    }

    async fn try_lookup(&self, query: &str) -> Result<CacheLookup, EngineError> {
        if self.index.is_empty().await {
            debug!("CACHE MISS | index is empty");
            return Ok(CacheLookup::Miss(CacheMiss::EmptyIndex));
        }

        let vector = self.embed(query).await?;
        let Some(neighbor) = self.index.nearest(&vector).await? else {
            return Ok(CacheLookup::Miss(CacheMiss::EmptyIndex));
        };

        let similarity = neighbor.similarity();
        if similarity < self.threshold {
            debug!(
                "CACHE MISS | similarity={:.3} below threshold={:.2}",
                similarity, self.threshold
            );
            return Ok(CacheLookup::Miss(CacheMiss::BelowThreshold { similarity }));
        }

        let Some(entry) = self.store.get(&neighbor.key).await? else {
            warn!("Index entry {} has no stored record, pruning", neighbor.key);
            self.evict(&neighbor.key).await;
            return Ok(CacheLookup::Miss(CacheMiss::Dangling));
        };

        if entry.is_expired(self.clock.now()) {
            info!("CACHE MISS | record for '{}' expired, pruning", neighbor.query);
            self.evict(&neighbor.key).await;
            return Ok(CacheLookup::Miss(CacheMiss::Expired));
        }

        info!(
            "CACHE HIT | similarity={:.3} | similar_query={}",
            similarity, neighbor.query
        );
        Ok(CacheLookup::Hit(CacheHit {
            entry,
            similarity,
            matched_query: neighbor.query,
        }))
    }

    /// Store an answer for `query` with a fresh expiry
    pub async fn insert(
        &self,
        query: &str,
        answer: &str,
        contexts: Vec<String>,
        sources: Vec<Source>,
    ) -> InsertOutcome {
        match self.try_insert(query, answer, contexts, sources).await {
            Ok(key) => {
                debug!("Cached answer under {}", key);
                InsertOutcome::Stored { key }
            }
            Err(e) => {
                warn!("Failed to cache answer: {}", e);
                InsertOutcome::Failed(e.to_string())
            }
        }
    }

    async fn try_insert(
        &self,
        query: &str,
        answer: &str,
        contexts: Vec<String>,
        sources: Vec<Source>,
    ) -> Result<String, EngineError> {
        let key = fingerprint(query);
        let vector = self.embed(query).await?;
        let now = self.clock.now();

        let entry = CacheEntry {
            key: key.clone(),
            query: query.to_string(),
            answer: answer.to_string(),
            contexts,
            sources,
            created_at: now,
            expires_at: now + self.ttl,
        };

        let _guard = self.write_lock.lock().await;
        self.store.put(&entry).await?;
        self.index.add(&key, query, &vector).await?;
        self.index.persist().await?;

        Ok(key)
    }

    /// Delete every expired record and its index entry; returns how many
    pub async fn prune_expired(&self) -> Result<usize, EngineError> {
        let _guard = self.write_lock.lock().await;
        let keys = self.store.purge_expired(self.clock.now()).await?;

        let mut removed_from_index = 0;
        for key in &keys {
            if self.index.remove(key).await {
                removed_from_index += 1;
            }
        }
        if removed_from_index > 0 {
            self.index.persist().await?;
        }

        info!(
            "Pruned {} expired cache records ({} index entries)",
            keys.len(),
            removed_from_index
        );
        Ok(keys.len())
    }

    pub async fn stats(&self) -> Result<CacheStats, EngineError> {
        let counts = self.store.counts(self.clock.now()).await?;
        Ok(CacheStats {
            index_entries: self.index.len().await,
            dimension: self.index.dimension().await,
            live_records: counts.live,
            expired_records: counts.expired,
            similarity_threshold: self.threshold,
            ttl_hours: self.ttl.num_hours(),
        })
    }

    async fn embed(&self, query: &str) -> Result<Vec<f32>, EngineError> {
        self.embedder
            .embed(query)
            .await
            .map_err(|e| EngineError::Embedding(e.to_string()))
    }

    /// Drop a dangling or expired record and its index entry
    ///
    /// The record is re-read under the write lock: a concurrent insert may
    /// have refreshed it since the caller looked.
    async fn evict(&self, key: &str) {
        let _guard = self.write_lock.lock().await;
        match self.store.get(key).await {
            Ok(Some(entry)) if !entry.is_expired(self.clock.now()) => {
                debug!("Cache record {} was refreshed, keeping it", key);
                return;
            }
            Ok(Some(_)) => {
                if let Err(e) = self.store.delete(key).await {
                    warn!("Failed to delete cache record {}: {}", key, e);
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Failed to re-read cache record {}: {}", key, e);
                return;
            }
        }
        if self.index.remove(key).await {
            if let Err(e) = self.index.persist().await {
                warn!("Failed to persist index after eviction: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::llm::{self, LLMError};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// Embeds known strings to fixed vectors, everything else fails
    struct TableEmbedder {
        vectors: HashMap<String, Vec<f32>>,
    }

    impl TableEmbedder {
        fn new(pairs: &[(&str, Vec<f32>)]) -> Self {
            Self {
                vectors: pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for TableEmbedder {
        fn name(&self) -> &str {
            "table"
        }

        async fn embed(&self, text: &str) -> llm::Result<Vec<f32>> {
            self.vectors
                .get(text)
                .cloned()
                .ok_or_else(|| LLMError::ProviderUnavailable("embedder offline".to_string()))
        }
    }

    const STORED: &str = "What is NET_500?";
    const NEAR: &str = "what does NET_500 mean";
    const FAR: &str = "How many tickets next week?";

    fn embedder() -> Arc<TableEmbedder> {
        Arc::new(TableEmbedder::new(&[
            (STORED, vec![1.0, 0.0]),
            (NEAR, vec![0.95, (1.0f32 - 0.95 * 0.95).sqrt()]),
            (FAR, vec![0.8, 0.6]),
        ]))
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    struct Fixture {
        cache: SemanticCache,
        store: Arc<SqliteValueStore>,
        clock: Arc<ManualClock>,
        index_path: std::path::PathBuf,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("test.db")).await.unwrap();
        let store = Arc::new(SqliteValueStore::new(db.pool().clone()));
        let index_path = dir.path().join("cache_index").join("index.json");
        let index = SimilarityIndex::open(&index_path).await.unwrap();
        let clock = Arc::new(ManualClock::new(t0()));

        let cache = SemanticCache::new(embedder(), index, store.clone(), 0.92, Duration::hours(24))
            .with_clock(clock.clone());

        Fixture {
            cache,
            store,
            clock,
            index_path,
            _dir: dir,
        }
    }

    async fn seed(f: &Fixture) {
        let outcome = f
            .cache
            .insert(
                STORED,
                "NET_500 is an upstream gateway failure.",
                vec!["NET_500: gateway failed".to_string()],
                vec![Source::new("runbook.pdf", "3")],
            )
            .await;
        assert_eq!(
            outcome,
            InsertOutcome::Stored {
                key: fingerprint(STORED)
            }
        );
    }

    #[test]
    fn test_fingerprint_normalizes() {
        assert_eq!(fingerprint("  What is NET_500? "), fingerprint("what is net_500?"));
        assert_ne!(fingerprint("a"), fingerprint("b"));
        assert_eq!(fingerprint("x").len(), 64);
    }

    #[tokio::test]
    async fn test_empty_index_is_miss() {
        let f = fixture().await;
        assert_eq!(
            f.cache.lookup(STORED).await,
            CacheLookup::Miss(CacheMiss::EmptyIndex)
        );
    }

    #[tokio::test]
    async fn test_round_trip_hits_itself() {
        let f = fixture().await;
        seed(&f).await;

        match f.cache.lookup(STORED).await {
            CacheLookup::Hit(hit) => {
                assert!((hit.similarity - 1.0).abs() < 1e-5);
                assert_eq!(hit.matched_query, STORED);
                assert_eq!(hit.entry.answer, "NET_500 is an upstream gateway failure.");
                assert_eq!(hit.entry.sources, vec![Source::new("runbook.pdf", "3")]);
            }
            other => panic!("expected hit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_similar_query_above_threshold_hits() {
        let f = fixture().await;
        seed(&f).await;

        match f.cache.lookup(NEAR).await {
            CacheLookup::Hit(hit) => {
                assert!((hit.similarity - 0.95).abs() < 1e-4);
                assert_eq!(hit.matched_query, STORED);
            }
            other => panic!("expected hit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dissimilar_query_misses() {
        let f = fixture().await;
        seed(&f).await;

        match f.cache.lookup(FAR).await {
            CacheLookup::Miss(CacheMiss::BelowThreshold { similarity }) => {
                assert!((similarity - 0.8).abs() < 1e-4);
            }
            other => panic!("expected below-threshold miss, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lookup_is_idempotent() {
        let f = fixture().await;
        seed(&f).await;

        let first = f.cache.lookup(NEAR).await;
        let second = f.cache.lookup(NEAR).await;
        assert_eq!(first, second);
        assert_eq!(f.cache.index.len().await, 1);
    }

    #[tokio::test]
    async fn test_expired_record_is_miss_and_pruned() {
        let f = fixture().await;
        seed(&f).await;

        f.clock.set(t0() + Duration::hours(24) - Duration::seconds(1));
        assert!(f.cache.lookup(STORED).await.is_hit());

        f.clock.set(t0() + Duration::hours(24));
        assert_eq!(
            f.cache.lookup(STORED).await,
            CacheLookup::Miss(CacheMiss::Expired)
        );
        assert!(f.cache.index.is_empty().await);
        assert!(f.store.get(&fingerprint(STORED)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dangling_index_entry_is_miss() {
        let f = fixture().await;
        seed(&f).await;
        f.store.delete(&fingerprint(STORED)).await.unwrap();

        assert_eq!(
            f.cache.lookup(STORED).await,
            CacheLookup::Miss(CacheMiss::Dangling)
        );
        assert!(f.cache.index.is_empty().await);
    }

    #[tokio::test]
    async fn test_embedding_failure_fails_open() {
        let f = fixture().await;
        seed(&f).await;

        assert!(matches!(
            f.cache.lookup("unknown to the embedder").await,
            CacheLookup::Miss(CacheMiss::Unavailable(_))
        ));
        assert!(matches!(
            f.cache
                .insert("unknown to the embedder", "a", vec![], vec![])
                .await,
            InsertOutcome::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_insert_refreshes_expiry() {
        let f = fixture().await;
        seed(&f).await;

        f.clock.advance(Duration::hours(20));
        seed(&f).await;

        f.clock.advance(Duration::hours(20));
        assert!(f.cache.lookup(STORED).await.is_hit());
    }

    #[tokio::test]
    async fn test_index_survives_reload() {
        let f = fixture().await;
        seed(&f).await;

        let reopened = SimilarityIndex::open(&f.index_path).await.unwrap();
        let cache = SemanticCache::new(
            embedder(),
            reopened,
            f.store.clone(),
            0.92,
            Duration::hours(24),
        )
        .with_clock(f.clock.clone());

        assert!(cache.lookup(NEAR).await.is_hit());
    }

    /// Store that can hold one `get` after it has read its row
    struct PausingStore {
        inner: Arc<SqliteValueStore>,
        pause_next_get: std::sync::atomic::AtomicBool,
        reached: tokio::sync::Notify,
        resume: tokio::sync::Notify,
    }

    #[async_trait]
    impl ValueStore for PausingStore {
        async fn get(&self, key: &str) -> Result<Option<CacheEntry>, EngineError> {
            let entry = self.inner.get(key).await?;
            if self.pause_next_get.swap(false, Ordering::SeqCst) {
                self.reached.notify_one();
                self.resume.notified().await;
            }
            Ok(entry)
        }

        async fn put(&self, entry: &CacheEntry) -> Result<(), EngineError> {
            self.inner.put(entry).await
        }

        async fn delete(&self, key: &str) -> Result<bool, EngineError> {
            self.inner.delete(key).await
        }

        async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, EngineError> {
            self.inner.purge_expired(now).await
        }

        async fn counts(&self, now: DateTime<Utc>) -> Result<StoreCounts, EngineError> {
            self.inner.counts(now).await
        }
    }

    #[tokio::test]
    async fn test_eviction_keeps_record_refreshed_mid_lookup() {
        let f = fixture().await;
        seed(&f).await;
        f.clock.advance(Duration::hours(25));

        let pausing = Arc::new(PausingStore {
            inner: f.store.clone(),
            pause_next_get: std::sync::atomic::AtomicBool::new(true),
            reached: tokio::sync::Notify::new(),
            resume: tokio::sync::Notify::new(),
        });
        let index = SimilarityIndex::open(&f.index_path).await.unwrap();
        let cache = SemanticCache::new(embedder(), index, pausing.clone(), 0.92, Duration::hours(24))
            .with_clock(f.clock.clone());

        // The lookup reads the stale record, then a fresh insert lands before it evicts
        let (stale, stored) = tokio::join!(cache.lookup(STORED), async {
            pausing.reached.notified().await;
            let outcome = cache.insert(STORED, "fresh", vec![], vec![]).await;
            pausing.resume.notify_one();
            outcome
        });

        assert_eq!(stale, CacheLookup::Miss(CacheMiss::Expired));
        assert!(matches!(stored, InsertOutcome::Stored { .. }));
        match cache.lookup(STORED).await {
            CacheLookup::Hit(hit) => assert_eq!(hit.entry.answer, "fresh"),
            other => panic!("expected the fresh record, got {:?}", other),
        }
        assert_eq!(cache.index.len().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_inserts_and_lookups_keep_index_consistent() {
        const N: usize = 8;
        let dir = TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("test.db")).await.unwrap();
        let store = Arc::new(SqliteValueStore::new(db.pool().clone()));
        let index_path = dir.path().join("cache_index").join("index.json");

        let queries: Vec<String> = (0..N).map(|i| format!("question {}", i)).collect();
        let pairs: Vec<(&str, Vec<f32>)> = queries
            .iter()
            .enumerate()
            .map(|(i, q)| {
                let angle = i as f32 * std::f32::consts::TAU / N as f32;
                (q.as_str(), vec![angle.cos(), angle.sin()])
            })
            .collect();

        let cache = Arc::new(
            SemanticCache::new(
                Arc::new(TableEmbedder::new(&pairs)),
                SimilarityIndex::open(&index_path).await.unwrap(),
                store.clone(),
                0.92,
                Duration::hours(24),
            )
            .with_clock(Arc::new(ManualClock::new(t0()))),
        );

        let mut tasks = Vec::new();
        for query in &queries {
            let writer = Arc::clone(&cache);
            let q = query.clone();
            tasks.push(tokio::spawn(async move {
                let outcome = writer.insert(&q, &format!("answer to {}", q), vec![], vec![]).await;
                assert!(matches!(outcome, InsertOutcome::Stored { .. }));
            }));
            let reader = Arc::clone(&cache);
            let q = query.clone();
            tasks.push(tokio::spawn(async move {
                // Either outcome is fine while writes are in flight; it must not fail
                let lookup = reader.lookup(&q).await;
                assert!(!matches!(lookup, CacheLookup::Miss(CacheMiss::Unavailable(_))));
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(cache.index.len().await, N);
        assert_eq!(store.counts(t0()).await.unwrap().live, N as u64);
        for query in &queries {
            match cache.lookup(query).await {
                CacheLookup::Hit(hit) => assert_eq!(&hit.matched_query, query),
                other => panic!("expected hit for {}, got {:?}", query, other),
            }
        }

        let reloaded = SimilarityIndex::open(&index_path).await.unwrap();
        assert_eq!(reloaded.len().await, N);
    }

    #[tokio::test]
    async fn test_prune_and_stats() {
        let f = fixture().await;
        seed(&f).await;

        let stats = f.cache.stats().await.unwrap();
        assert_eq!(stats.index_entries, 1);
        assert_eq!(stats.live_records, 1);
        assert_eq!(stats.dimension, Some(2));

        f.clock.advance(Duration::hours(25));
        assert_eq!(f.cache.stats().await.unwrap().expired_records, 1);

        assert_eq!(f.cache.prune_expired().await.unwrap(), 1);
        let stats = f.cache.stats().await.unwrap();
        assert_eq!(stats.index_entries, 0);
        assert_eq!(stats.expired_records, 0);
    }
}
