//! The cache backend contract and the variant store that wraps it.

use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    future::Future,
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::{
    cache::key::{CacheVariantKey, KeyPattern},
    error::ArborError,
    tree::Tree,
};

/// Key/value storage with per-entry TTL and pattern-scoped removal. Implementations must make
/// each operation atomic on their own; callers add no locking around them.
pub trait CacheBackend<V>: Send + Sync {
    fn get(
        &self,
        key: &CacheVariantKey,
    ) -> impl Future<Output = Result<Option<V>, ArborError>> + Send;

    fn put(
        &self,
        key: &CacheVariantKey,
        value: V,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), ArborError>> + Send;

    fn remove(&self, key: &CacheVariantKey) -> impl Future<Output = Result<bool, ArborError>> + Send;

    /// Returns the number of removed entries.
    fn remove_by_pattern(
        &self,
        pattern: &KeyPattern,
    ) -> impl Future<Output = Result<usize, ArborError>> + Send;

    fn keys(
        &self,
        pattern: &KeyPattern,
    ) -> impl Future<Output = Result<Vec<CacheVariantKey>, ArborError>> + Send;
}

/// In-process backend. Expired entries read as misses and are purged on the next write.
#[derive(Debug)]
pub struct MemoryCacheBackend<V> {
    entries: RwLock<HashMap<CacheVariantKey, (V, Instant)>>,
    available: AtomicBool,
}

impl<V> Default for MemoryCacheBackend<V> {
    fn default() -> Self {
        MemoryCacheBackend {
            entries: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl<V> MemoryCacheBackend<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while unavailable every operation fails with [`ArborError::Cache`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.read().values().filter(|(_, exp)| *exp > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), ArborError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ArborError::Cache("memory cache backend unavailable".to_string()))
        }
    }
}

impl<V: Clone + Send + Sync> CacheBackend<V> for MemoryCacheBackend<V> {
    async fn get(&self, key: &CacheVariantKey) -> Result<Option<V>, ArborError> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .entries
            .read()
            .get(key)
            .filter(|(_, exp)| *exp > now)
            .map(|(value, _)| value.clone()))
    }

    async fn put(&self, key: &CacheVariantKey, value: V, ttl: Duration) -> Result<(), ArborError> {
        self.check()?;
        let now = Instant::now();
        let mut entries = self.entries.write();
        entries.retain(|_, (_, exp)| *exp > now);
        entries.insert(key.clone(), (value, now + ttl));
        Ok(())
    }

    async fn remove(&self, key: &CacheVariantKey) -> Result<bool, ArborError> {
        self.check()?;
        Ok(self.entries.write().remove(key).is_some())
    }

    async fn remove_by_pattern(&self, pattern: &KeyPattern) -> Result<usize, ArborError> {
        self.check()?;
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| !pattern.matches(key));
        Ok(before - entries.len())
    }

    async fn keys(&self, pattern: &KeyPattern) -> Result<Vec<CacheVariantKey>, ArborError> {
        self.check()?;
        let now = Instant::now();
        let mut keys = self
            .entries
            .read()
            .iter()
            .filter(|(key, (_, exp))| *exp > now && pattern.matches(key))
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        keys.sort();
        Ok(keys)
    }
}

/// A cached variant together with the TTL it was stored under.
#[derive(Debug)]
pub struct CachedTree<T> {
    pub tree: Arc<Tree<T>>,
    pub ttl: Duration,
}

impl<T> Clone for CachedTree<T> {
    fn clone(&self) -> Self {
        CachedTree {
            tree: self.tree.clone(),
            ttl: self.ttl,
        }
    }
}

/// Constructor-injected access to cached tree variants.
///
/// Backend failures never propagate: they are logged, reads degrade to misses and writes to
/// no-ops, so callers fall back to building from persistence.
///
/// Every removal bumps an eviction generation for the affected tree before it reaches the
/// backend. A writer that read a variant at generation `g` republishes it with
/// [`put_unless_evicted`](Self::put_unless_evicted), which drops its own write again if an
/// eviction started in between.
#[derive(Debug)]
pub struct CacheVariantStore<T, B> {
    backend: B,
    degraded: AtomicBool,
    /// Bumped by removals that span every tree.
    global_evictions: AtomicU64,
    tree_evictions: Mutex<HashMap<String, u64>>,
    _payload: PhantomData<fn() -> T>,
}

impl<T, B> CacheVariantStore<T, B>
where
    T: Send + Sync + 'static,
    B: CacheBackend<CachedTree<T>>,
{
    pub fn new(backend: B) -> Self {
        CacheVariantStore {
            backend,
            degraded: AtomicBool::new(false),
            global_evictions: AtomicU64::new(0),
            tree_evictions: Mutex::new(HashMap::new()),
            _payload: PhantomData,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Whether the most recent backend operation failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Monotonic counter of removals that may have touched variants of `tree`.
    pub fn eviction_generation(&self, tree: &str) -> u64 {
        let global = self.global_evictions.load(Ordering::SeqCst);
        global + self.tree_evictions.lock().get(tree).copied().unwrap_or_default()
    }

    fn bump_generation(&self, tree: Option<&str>) {
        match tree {
            Some(tree) => *self.tree_evictions.lock().entry(tree.to_string()).or_default() += 1,
            None => {
                self.global_evictions.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn settle<R>(&self, op: &str, res: Result<R, ArborError>, fallback: R) -> R {
        match res {
            Ok(value) => {
                if self.degraded.swap(false, Ordering::SeqCst) {
                    tracing::info!("Cache backend recovered");
                }
                value
            }
            Err(e) => {
                self.degraded.store(true, Ordering::SeqCst);
                tracing::warn!("Cache {} failed, degrading: {}", op, e);
                fallback
            }
        }
    }

    pub async fn get(&self, key: &CacheVariantKey) -> Option<CachedTree<T>> {
        let res = self.backend.get(key).await;
        self.settle("get", res, None)
    }

    pub async fn put(&self, key: &CacheVariantKey, tree: Arc<Tree<T>>, ttl: Duration) {
        let res = self.backend.put(key, CachedTree { tree, ttl }, ttl).await;
        self.settle("put", res, ())
    }

    /// Store `tree` under `key` unless a removal touching `key.tree` began after
    /// `generation` was read. Returns whether the write survived.
    pub async fn put_unless_evicted(
        &self,
        key: &CacheVariantKey,
        tree: Arc<Tree<T>>,
        ttl: Duration,
        generation: u64,
    ) -> bool {
        if self.eviction_generation(&key.tree) != generation {
            tracing::debug!("Skipping write of {}: evicted since read", key);
            return false;
        }
        self.put(key, tree, ttl).await;
        if self.eviction_generation(&key.tree) != generation {
            tracing::debug!("Dropping write of {}: evicted while writing", key);
            self.remove(key).await;
            return false;
        }
        true
    }

    pub async fn remove(&self, key: &CacheVariantKey) -> bool {
        self.bump_generation(Some(&key.tree));
        let res = self.backend.remove(key).await;
        self.settle("remove", res, false)
    }

    pub async fn remove_by_pattern(&self, pattern: &KeyPattern) -> usize {
        self.bump_generation(pattern.tree.as_deref());
        let res = self.backend.remove_by_pattern(pattern).await;
        let removed = self.settle("remove_by_pattern", res, 0);
        tracing::debug!("Evicted {} variants matching {}", removed, pattern.to_glob());
        removed
    }

    pub async fn keys(&self, pattern: &KeyPattern) -> Vec<CacheVariantKey> {
        let res = self.backend.keys(pattern).await;
        self.settle("keys", res, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::DimToken;
    use test_log::test;

    fn key(store: u32) -> CacheVariantKey {
        CacheVariantKey::new("main", 1, DimToken::ids([store]), DimToken::Agnostic)
    }

    #[test(tokio::test)]
    async fn expired_entries_are_misses() {
        let backend = MemoryCacheBackend::<u32>::new();
        backend.put(&key(1), 10, Duration::ZERO).await.unwrap();
        backend.put(&key(2), 20, Duration::from_secs(60)).await.unwrap();
        assert_eq!(backend.get(&key(1)).await.unwrap(), None);
        assert_eq!(backend.get(&key(2)).await.unwrap(), Some(20));
        assert_eq!(backend.keys(&KeyPattern::all()).await.unwrap(), vec![key(2)]);
    }

    #[test(tokio::test)]
    async fn write_after_eviction_is_dropped() {
        let store = CacheVariantStore::<u32, _>::new(MemoryCacheBackend::new());
        let tree = Arc::new(Tree::<u32>::default());
        let ttl = Duration::from_secs(60);
        let seen = store.eviction_generation("main");
        assert!(store.put_unless_evicted(&key(1), tree.clone(), ttl, seen).await);

        let seen = store.eviction_generation("main");
        store.remove_by_pattern(&KeyPattern::tree("main")).await;
        assert!(!store.put_unless_evicted(&key(1), tree.clone(), ttl, seen).await);
        assert!(store.get(&key(1)).await.is_none());

        // Removals in other trees leave the generation alone.
        let seen = store.eviction_generation("main");
        store.remove_by_pattern(&KeyPattern::tree("footer")).await;
        assert!(store.put_unless_evicted(&key(1), tree, ttl, seen).await);
    }

    #[test(tokio::test)]
    async fn store_degrades_when_backend_is_down() {
        let store = CacheVariantStore::<u32, _>::new(MemoryCacheBackend::new());
        let tree = Arc::new(Tree::<u32>::default());
        store.put(&key(3), tree.clone(), Duration::from_secs(60)).await;
        assert!(store.get(&key(3)).await.is_some());

        store.backend().set_available(false);
        assert!(store.get(&key(3)).await.is_none());
        assert!(store.is_degraded());
        assert_eq!(store.remove_by_pattern(&KeyPattern::all()).await, 0);

        store.backend().set_available(true);
        let cached = store.get(&key(3)).await.unwrap();
        assert!(!store.is_degraded());
        assert_eq!(cached.ttl, Duration::from_secs(60));
    }
}
