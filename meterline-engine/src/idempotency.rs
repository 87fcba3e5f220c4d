//! Idempotency Filter (C4).
//!
//! Two-tier duplicate detection per `(organizationId, idempotencyKey)`:
//! fast-path cache first, store fallback for cache misses, with a
//! best-effort cache warm-up of anything found only in the store. The
//! store's unique constraint is the final backstop — see
//! [`crate::store::Store::insert_events`] for the race-losing branch.

use meterline_core::config::{CacheConfig, RateLimitConfig};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::cache::Cache;
use crate::store::Store;

#[derive(Clone)]
pub struct IdempotencyFilter {
    store: Store,
    cache: Cache,
    ttl_sec: u64,
    lookup_concurrency: Arc<Semaphore>,
}

impl IdempotencyFilter {
    pub fn new(store: Store, cache: Cache, cache_config: &CacheConfig, rate_limit_config: &RateLimitConfig) -> Self {
        Self {
            store,
            cache,
            ttl_sec: cache_config.idempotency_ttl_sec,
            lookup_concurrency: Arc::new(Semaphore::new(rate_limit_config.max_concurrent_lookups.max(1))),
        }
    }

    /// Returns, for each key that already has a persisted event, its
    /// event id. Keys absent from the result are free to be inserted as
    /// new events. Cache lookups fan out with a bounded concurrency cap
    /// (§5 "batch ingest may fan out concurrent lookups with a bounded
    /// concurrency cap") so one fat batch can't monopolize the cache
    /// connection.
    pub async fn classify(
        &self,
        organization_id: Uuid,
        keys: &[String],
    ) -> HashMap<String, Uuid> {
        if keys.is_empty() {
            return HashMap::new();
        }

        let mut set = tokio::task::JoinSet::new();
        for key in keys {
            let this = self.clone();
            let key = key.clone();
            let permit = self.lookup_concurrency.clone();
            set.spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore is never closed");
                let found = this.read_cache(organization_id, &key).await;
                (key, found)
            });
        }

        let mut resolved = HashMap::new();
        let mut misses = Vec::new();
        while let Some(result) = set.join_next().await {
            if let Ok((key, found)) = result {
                match found {
                    Some(id) => {
                        resolved.insert(key, id);
                    }
                    None => misses.push(key),
                }
            }
        }

        if !misses.is_empty() {
            if let Ok(found) = self.store.find_events_by_idempotency_keys(organization_id, &misses).await {
                for (key, id) in found {
                    self.write_cache(organization_id, &key, id).await;
                    resolved.insert(key, id);
                }
            }
        }

        resolved
    }

    async fn read_cache(&self, organization_id: Uuid, key: &str) -> Option<Uuid> {
        let cache_key = idempotency_key(organization_id, key);
        self.cache
            .with_fallback(
                move |mut conn| async move {
                    let value: Option<String> = conn.get(&cache_key).await?;
                    Ok(value)
                },
                || async { Ok(None) },
            )
            .await
            .ok()
            .flatten()
            .and_then(|s| s.parse().ok())
    }

    async fn write_cache(&self, organization_id: Uuid, key: &str, event_id: Uuid) {
        let cache_key = idempotency_key(organization_id, key);
        let ttl = self.ttl_sec;
        let value = event_id.to_string();
        let _ = self
            .cache
            .with_fallback(
                move |mut conn| async move { conn.set_ex::<_, _, ()>(&cache_key, value, ttl).await },
                || async { Ok(()) },
            )
            .await;
    }
}

fn idempotency_key(organization_id: Uuid, key: &str) -> String {
    format!("idempotency:{organization_id}:{key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_namespaced_per_organization() {
        let org_a = Uuid::new_v4();
        let org_b = Uuid::new_v4();
        assert_ne!(idempotency_key(org_a, "k1"), idempotency_key(org_b, "k1"));
    }
}
