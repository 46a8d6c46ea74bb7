// Keywatch Engine — Subscription Cache
//
// Popular groups see hundreds of messages per minute; hitting SQLite per
// message is unacceptable. Each group's active subscription list is cached
// for a TTL and re-queried on expiry. Any external surface that alters
// subscriptions calls `invalidate()` to clear every entry.

use crate::atoms::constants::SUBSCRIPTION_CACHE_TTL_SECS;
use crate::atoms::error::EngineResult;
use crate::atoms::types::Subscription;
use crate::engine::store::EngineStore;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct CacheEntry {
    subscriptions: Arc<Vec<Subscription>>,
    refreshed_at: Instant,
}

pub struct SubscriptionCache {
    store: Arc<EngineStore>,
    entries: Mutex<HashMap<i64, CacheEntry>>,
    ttl: Duration,
}

impl SubscriptionCache {
    pub fn new(store: Arc<EngineStore>) -> Self {
        Self::with_ttl(store, Duration::from_secs(SUBSCRIPTION_CACHE_TTL_SECS))
    }

    pub fn with_ttl(store: Arc<EngineStore>, ttl: Duration) -> Self {
        SubscriptionCache { store, entries: Mutex::new(HashMap::new()), ttl }
    }

    /// Subscriptions for a group: cached if fresh, re-queried otherwise.
    pub fn get(&self, group_id: i64) -> EngineResult<Arc<Vec<Subscription>>> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(&group_id) {
            if entry.refreshed_at.elapsed() < self.ttl {
                return Ok(Arc::clone(&entry.subscriptions));
            }
        }

        let fresh = Arc::new(self.store.subscriptions_for_group(group_id)?);
        debug!("[subs] Refreshed group {}: {} subscriptions", group_id, fresh.len());
        entries.insert(
            group_id,
            CacheEntry { subscriptions: Arc::clone(&fresh), refreshed_at: Instant::now() },
        );
        Ok(fresh)
    }

    /// Drop every cached entry. The next lookup per group re-queries.
    pub fn invalidate(&self) {
        let mut entries = self.entries.lock();
        let dropped = entries.len();
        entries.clear();
        debug!("[subs] Invalidated {} cached groups", dropped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(id: i64, group_id: i64) -> Subscription {
        Subscription {
            id,
            user_id: 10,
            query: "q".into(),
            keywords: vec!["iphone".into()],
            negative_keywords: vec![],
            description: String::new(),
            embeddings: vec![],
            active: true,
            group_ids: vec![group_id],
        }
    }

    #[test]
    fn caches_within_ttl() {
        let store = Arc::new(EngineStore::open_in_memory().unwrap());
        store.upsert_subscription(&sub(1, 100)).unwrap();
        let cache = SubscriptionCache::new(Arc::clone(&store));

        assert_eq!(cache.get(100).unwrap().len(), 1);

        // A store change is invisible until the TTL expires or an
        // invalidation lands.
        store.upsert_subscription(&sub(2, 100)).unwrap();
        assert_eq!(cache.get(100).unwrap().len(), 1);
    }

    #[test]
    fn invalidate_then_lookup_sees_store() {
        let store = Arc::new(EngineStore::open_in_memory().unwrap());
        store.upsert_subscription(&sub(1, 100)).unwrap();
        let cache = SubscriptionCache::new(Arc::clone(&store));
        assert_eq!(cache.get(100).unwrap().len(), 1);

        store.upsert_subscription(&sub(2, 100)).unwrap();
        cache.invalidate();
        assert_eq!(cache.get(100).unwrap().len(), 2);
    }

    #[test]
    fn zero_ttl_always_requeries() {
        let store = Arc::new(EngineStore::open_in_memory().unwrap());
        store.upsert_subscription(&sub(1, 100)).unwrap();
        let cache = SubscriptionCache::with_ttl(Arc::clone(&store), Duration::from_secs(0));
        assert_eq!(cache.get(100).unwrap().len(), 1);
        store.upsert_subscription(&sub(2, 100)).unwrap();
        assert_eq!(cache.get(100).unwrap().len(), 2);
    }

    #[test]
    fn empty_group_caches_empty_list() {
        let store = Arc::new(EngineStore::open_in_memory().unwrap());
        let cache = SubscriptionCache::new(store);
        assert!(cache.get(999).unwrap().is_empty());
    }
}
