//! Transparent result caching around any collaborator.

use crate::collaborator::{Capability, Collaborator, CollaboratorId, Invocation};
use crate::config::CacheSettings;
use crate::error::DispatchError;
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub size: usize,
    /// Percentage 0-100
    pub hit_rate: f64,
}

#[derive(Debug, Clone)]
struct CachedValue {
    value: Value,
    expires_at: Instant,
}

type CacheKey = (Capability, String);

/// Wraps a collaborator with an LRU + TTL cache keyed by `(capability, payload)`.
///
/// Only successful results are stored. The wrapper reports the inner
/// collaborator's id, so breakers and the ledger see one collaborator.
/// Hits are flagged through [`Collaborator::invoke_tracked`] and fresh
/// invocations skip the lookup, so a cached answer never stands in for a
/// recovery probe.
pub struct CachedInvoker {
    inner: Arc<dyn Collaborator>,
    entries: Mutex<LruCache<CacheKey, CachedValue>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
}

impl std::fmt::Debug for CachedInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedInvoker")
            .field("collaborator", self.inner.id())
            .field("ttl", &self.ttl)
            .field("stats", &self.stats())
            .finish()
    }
}

impl CachedInvoker {
    pub fn new(inner: Arc<dyn Collaborator>, max_entries: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            inner,
            entries: Mutex::new(LruCache::new(max_entries)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
        }
    }

    pub fn from_settings(inner: Arc<dyn Collaborator>, settings: &CacheSettings) -> Self {
        let max_entries = NonZeroUsize::new(settings.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self::new(inner, max_entries, settings.ttl())
    }

    fn key(capability: &Capability, payload: &Value) -> CacheKey {
        (capability.clone(), payload.to_string())
    }

    fn lookup(&self, key: &CacheKey) -> Option<Value> {
        let mut entries = self.entries.lock();
        let fresh = match entries.get(key) {
            Some(cached) if cached.expires_at > Instant::now() => Some(cached.value.clone()),
            Some(_) => None,
            None => return None,
        };
        if fresh.is_none() {
            entries.pop(key);
        }
        fresh
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Drop expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, cached)| cached.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            inserts: self.inserts.load(Ordering::Relaxed),
            size: self.entries.lock().len(),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 * 100.0 / total as f64
            },
        }
    }
}

#[async_trait]
impl Collaborator for CachedInvoker {
    fn id(&self) -> &CollaboratorId {
        self.inner.id()
    }

    async fn invoke(
        &self,
        capability: &Capability,
        payload: Value,
    ) -> Result<Value, DispatchError> {
        self.invoke_tracked(capability, payload, false)
            .await
            .map(|invocation| invocation.value)
    }

    async fn invoke_tracked(
        &self,
        capability: &Capability,
        payload: Value,
        fresh: bool,
    ) -> Result<Invocation, DispatchError> {
        let key = Self::key(capability, &payload);
        if !fresh {
            if let Some(value) = self.lookup(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(collaborator = %self.inner.id(), capability = %capability, "Cache hit");
                return Ok(Invocation::cached(value));
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
        }

        let invocation = self.inner.invoke_tracked(capability, payload, fresh).await?;
        self.entries.lock().put(
            key,
            CachedValue {
                value: invocation.value.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        self.inserts.fetch_add(1, Ordering::Relaxed);
        Ok(invocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;
    use serde_json::json;

    mock! {
        pub Provider {}

        #[async_trait]
        impl Collaborator for Provider {
            fn id(&self) -> &CollaboratorId;
            async fn invoke(
                &self,
                capability: &Capability,
                payload: Value,
            ) -> Result<Value, DispatchError>;
        }
    }

    fn provider(expected_calls: usize) -> MockProvider {
        let mut mock = MockProvider::new();
        mock.expect_id().return_const(CollaboratorId::from("gemini"));
        mock.expect_invoke()
            .times(expected_calls)
            .returning(|_, payload| Ok(json!({ "answer": payload["q"] })));
        mock
    }

    fn invoker(mock: MockProvider, capacity: usize, ttl: Duration) -> CachedInvoker {
        CachedInvoker::new(
            Arc::new(mock),
            NonZeroUsize::new(capacity).expect("non-zero"),
            ttl,
        )
    }

    #[tokio::test]
    async fn test_repeated_payload_hits_cache() {
        let cached = invoker(provider(2), 10, Duration::from_secs(60));
        let cap = Capability::from("analysis");

        cached.invoke(&cap, json!({"q": 1})).await.expect("ok");
        let hit = cached.invoke(&cap, json!({"q": 1})).await.expect("ok");
        cached.invoke(&cap, json!({"q": 2})).await.expect("ok");

        assert_eq!(hit["answer"], 1);
        let stats = cached.stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (1, 2, 2));
        assert_eq!(cached.id(), &CollaboratorId::from("gemini"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cached = invoker(provider(2), 10, Duration::from_millis(100));
        let cap = Capability::from("analysis");

        cached.invoke(&cap, json!({"q": 1})).await.expect("ok");
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(cached.purge_expired(), 1);
        cached.invoke(&cap, json!({"q": 1})).await.expect("ok");
        assert_eq!(cached.stats().hits, 0);
    }

    #[tokio::test]
    async fn test_lru_eviction_and_clear() {
        let cached = invoker(provider(4), 1, Duration::from_secs(60));
        let cap = Capability::from("analysis");

        cached.invoke(&cap, json!({"q": 1})).await.expect("ok");
        cached.invoke(&cap, json!({"q": 2})).await.expect("ok");
        // q=1 was evicted by q=2
        cached.invoke(&cap, json!({"q": 1})).await.expect("ok");
        assert_eq!(cached.stats().size, 1);

        cached.clear();
        cached.invoke(&cap, json!({"q": 1})).await.expect("ok");
        assert_eq!(cached.stats().hits, 0);
    }

    #[tokio::test]
    async fn test_fresh_invocation_bypasses_lookup() {
        let mut mock = MockProvider::new();
        mock.expect_id().return_const(CollaboratorId::from("gemini"));
        let mut calls = 0;
        mock.expect_invoke().times(2).returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Ok(json!("stored"))
            } else {
                Err(DispatchError::Transport { reason: "down".into() })
            }
        });
        let cached = invoker(mock, 10, Duration::from_secs(60));
        let cap = Capability::from("analysis");

        let first = cached.invoke_tracked(&cap, json!({}), false).await.expect("ok");
        assert!(!first.cached);
        let hit = cached.invoke_tracked(&cap, json!({}), false).await.expect("hit");
        assert_eq!(hit, Invocation::cached(json!("stored")));

        assert!(cached.invoke_tracked(&cap, json!({}), true).await.is_err());
        assert_eq!(cached.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let mut mock = MockProvider::new();
        mock.expect_id().return_const(CollaboratorId::from("flaky"));
        mock.expect_invoke()
            .times(2)
            .returning(|_, _| Err(DispatchError::Transport { reason: "reset".into() }));
        let cached = invoker(mock, 10, Duration::from_secs(60));

        for _ in 0..2 {
            assert!(cached.invoke(&"x".into(), json!({})).await.is_err());
        }
        assert_eq!(cached.stats().size, 0);
    }
}
