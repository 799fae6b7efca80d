use rhai::AST;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Validity key of a cached artifact. Inline code is keyed by a content
/// signature; code fetched from the document store by the document's
/// modification timestamp. Exactly one applies per entry.
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactOrigin {
    Signature(String),
    ModifiedAt(Value),
}

/// A compiled script held in the cache.
#[derive(Clone)]
pub struct CacheEntry {
    pub origin: ArtifactOrigin,
    pub artifact: Arc<AST>,
}

impl CacheEntry {
    pub fn signature(&self) -> Option<&str> {
        match &self.origin {
            ArtifactOrigin::Signature(sig) => Some(sig),
            ArtifactOrigin::ModifiedAt(_) => None,
        }
    }

    pub fn modified_at(&self) -> Option<&Value> {
        match &self.origin {
            ArtifactOrigin::Signature(_) => None,
            ArtifactOrigin::ModifiedAt(ts) => Some(ts),
        }
    }
}

/// Bounded LRU cache of compiled script artifacts, keyed by script name.
///
/// Callers are concurrent query tasks, so every operation takes the one
/// coarse lock.
pub struct CodeCache {
    inner: Mutex<Inner>,
}

struct Inner {
    capacity: usize,
    map: HashMap<String, CacheEntry>,
    /// Key access order (front = least recently used, back = most recent).
    order: VecDeque<String>,
}

impl Inner {
    fn touch(&mut self, key: &str) {
        self.order.retain(|k| k != key);
        self.order.push_back(key.to_string());
    }

    fn evict_over_capacity(&mut self) {
        while self.map.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.map.remove(&evicted);
            } else {
                break;
            }
        }
    }
}

impl CodeCache {
    pub fn new(capacity: usize) -> Self {
        CodeCache {
            inner: Mutex::new(Inner {
                capacity,
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.map.is_empty()
    }

    pub async fn capacity(&self) -> usize {
        self.inner.lock().await.capacity
    }

    /// Shrinks (or grows) the bound, evicting least-recently-used entries
    /// until the cache fits.
    pub async fn set_capacity(&self, capacity: usize) {
        let mut inner = self.inner.lock().await;
        inner.capacity = capacity;
        inner.evict_over_capacity();
    }

    /// Clears the cache and installs a new bound. Used when a source
    /// renegotiates its configuration.
    pub async fn reset(&self, capacity: usize) {
        let mut inner = self.inner.lock().await;
        inner.capacity = capacity;
        inner.map.clear();
        inner.order.clear();
    }

    /// Looks up an entry; a hit counts as a use for LRU purposes.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut inner = self.inner.lock().await;
        if inner.map.contains_key(key) {
            inner.touch(key);
            inner.map.get(key).cloned()
        } else {
            None
        }
    }

    /// Inserts or overwrites an entry, marking it most recently used, and
    /// evicts the least-recently-used entry when over capacity.
    pub async fn put(&self, key: String, entry: CacheEntry) {
        let mut inner = self.inner.lock().await;
        inner.map.insert(key.clone(), entry);
        inner.touch(&key);
        inner.evict_over_capacity();
    }

    /// Removes an entry; absent keys are considered removed.
    pub async fn remove(&self, key: &str) {
        let mut inner = self.inner.lock().await;
        inner.map.remove(key);
        inner.order.retain(|k| k != key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(sig: &str) -> CacheEntry {
        CacheEntry {
            origin: ArtifactOrigin::Signature(sig.to_string()),
            artifact: Arc::new(AST::empty()),
        }
    }

    #[tokio::test]
    async fn get_returns_stored_entry() {
        let cache = CodeCache::new(4);
        assert!(cache.get("a").await.is_none());

        cache.put("a".to_string(), entry("sig-a")).await;
        let found = cache.get("a").await.expect("entry should be present");
        assert_eq!(found.signature(), Some("sig-a"));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn put_evicts_least_recently_used() {
        let cache = CodeCache::new(2);
        cache.put("a".to_string(), entry("sa")).await;
        cache.put("b".to_string(), entry("sb")).await;
        cache.put("c".to_string(), entry("sc")).await;

        // a is the oldest and must be gone.
        assert!(cache.get("a").await.is_none());
        assert_eq!(cache.len().await, 2);

        // Touching b makes c the LRU entry; d then evicts c.
        assert!(cache.get("b").await.is_some());
        cache.put("d".to_string(), entry("sd")).await;
        assert!(cache.get("c").await.is_none());
        assert!(cache.get("b").await.is_some());
        assert!(cache.get("d").await.is_some());
    }

    #[tokio::test]
    async fn overwrite_keeps_size() {
        let cache = CodeCache::new(2);
        cache.put("a".to_string(), entry("v1")).await;
        cache.put("a".to_string(), entry("v2")).await;
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get("a").await.unwrap().signature(), Some("v2"));
    }

    #[tokio::test]
    async fn set_capacity_shrinks_from_lru_end() {
        let cache = CodeCache::new(3);
        cache.put("a".to_string(), entry("sa")).await;
        cache.put("b".to_string(), entry("sb")).await;
        cache.put("c".to_string(), entry("sc")).await;

        cache.set_capacity(1).await;
        assert_eq!(cache.len().await, 1);
        assert!(cache.get("c").await.is_some());
        assert_eq!(cache.capacity().await, 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let cache = CodeCache::new(2);
        cache.put("a".to_string(), entry("sa")).await;
        cache.remove("a").await;
        cache.remove("a").await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn reset_clears_entries() {
        let cache = CodeCache::new(2);
        cache.put("a".to_string(), entry("sa")).await;
        cache.reset(8).await;
        assert!(cache.is_empty().await);
        assert_eq!(cache.capacity().await, 8);
    }

    #[test]
    fn origin_accessors_are_exclusive() {
        let signed = entry("sig");
        assert_eq!(signed.signature(), Some("sig"));
        assert!(signed.modified_at().is_none());

        let dated = CacheEntry {
            origin: ArtifactOrigin::ModifiedAt(json!("2024-05-01T00:00:00Z")),
            artifact: Arc::new(AST::empty()),
        };
        assert!(dated.signature().is_none());
        assert_eq!(dated.modified_at(), Some(&json!("2024-05-01T00:00:00Z")));
    }
}
