//! Admission Controller (C2).
//!
//! Bucketed sliding-window rate limiting per organization, read-then-
//! increment so a rejected request never consumes capacity (§4.2).
//! Grounded on `aerolithdb_saas::quotas::QuotaManager`'s manager-struct
//! shape; the algorithm itself has no teacher counterpart (AerolithDB has
//! no request-rate limiter) so it is built directly from the spec,
//! expressed with the fast-path [`Cache`] helper already used elsewhere.

use meterline_core::errors::AdmissionError;
use meterline_core::types::RateLimitPolicy;
use redis::AsyncCommands;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::cache::Cache;
use crate::store::Store;

#[derive(Debug, Clone, Copy)]
enum Granularity {
    Second,
    Minute,
    Hour,
}

impl Granularity {
    fn seconds(self) -> i64 {
        match self {
            Granularity::Second => 1,
            Granularity::Minute => 60,
            Granularity::Hour => 3600,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Granularity::Second => "s",
            Granularity::Minute => "m",
            Granularity::Hour => "h",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Admission {
    pub allowed: bool,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_at_unix: i64,
    pub retry_after_sec: Option<i64>,
}

impl Admission {
    fn unlimited() -> Self {
        Self { allowed: true, limit: None, remaining: None, reset_at_unix: 0, retry_after_sec: None }
    }
}

pub struct AdmissionController {
    store: Store,
    cache: Cache,
}

impl AdmissionController {
    pub fn new(store: Store, cache: Cache) -> Self {
        Self { store, cache }
    }

    pub async fn admit(&self, organization_id: Uuid) -> Result<Admission, AdmissionError> {
        let policy = self.store.get_rate_limit_policy(organization_id).await.unwrap_or(None).unwrap_or_default();
        self.admit_with_policy(organization_id, &policy).await
    }

    async fn admit_with_policy(
        &self,
        organization_id: Uuid,
        policy: &RateLimitPolicy,
    ) -> Result<Admission, AdmissionError> {
        let windows: Vec<(Granularity, u32)> = [
            (Granularity::Second, policy.requests_per_second),
            (Granularity::Minute, policy.requests_per_minute),
            (Granularity::Hour, policy.requests_per_hour),
        ]
        .into_iter()
        .filter_map(|(g, limit)| limit.map(|l| (g, l)))
        .collect();

        if windows.is_empty() {
            return Ok(Admission::unlimited());
        }

        // §4.2: when the fast-path cache is down, admit returns
        // `allowed=true` with `limit=remaining=∞` rather than running the
        // algorithm off a fallback read of zero, which would silently
        // reset apparent capacity instead of signalling "unlimited".
        if !self.cache.is_healthy() {
            return Ok(Admission::unlimited());
        }

        let now = now_unix();

        // Check phase: read all bucket counts without incrementing.
        let mut most_restrictive: Option<(Granularity, u32, u32, i64)> = None;
        for (granularity, limit) in &windows {
            let window_start = floor_to(now, granularity.seconds());
            let key = bucket_key(organization_id, *granularity, window_start);
            let reset_at = window_start + granularity.seconds();

            let count = self.read_count(&key).await;
            if count >= *limit {
                let retry_after = (reset_at - now).max(0);
                return Ok(Admission {
                    allowed: false,
                    limit: Some(*limit),
                    remaining: Some(0),
                    reset_at_unix: reset_at,
                    retry_after_sec: Some(retry_after),
                });
            }

            let remaining = limit.saturating_sub(count);
            let replace = match &most_restrictive {
                None => true,
                Some((_, _, prev_remaining, _)) => remaining < *prev_remaining,
            };
            if replace {
                most_restrictive = Some((*granularity, *limit, remaining, reset_at));
            }
        }

        // All limits passed: increment every bucket, pipelined.
        for (granularity, _) in &windows {
            let window_start = floor_to(now, granularity.seconds());
            let key = bucket_key(organization_id, *granularity, window_start);
            self.increment(&key, granularity.seconds() * 2).await;
        }

        let (_, limit, remaining, reset_at) = most_restrictive.expect("windows is non-empty");
        Ok(Admission {
            allowed: true,
            limit: Some(limit),
            remaining: Some(remaining.saturating_sub(1)),
            reset_at_unix: reset_at,
            retry_after_sec: None,
        })
    }

    async fn read_count(&self, key: &str) -> u32 {
        let key = key.to_string();
        self.cache
            .with_fallback(
                move |mut conn| async move {
                    let value: Option<u32> = conn.get(&key).await?;
                    Ok(value.unwrap_or(0))
                },
                || async { Ok(0u32) },
            )
            .await
            .unwrap_or(0)
    }

    async fn increment(&self, key: &str, ttl_sec: i64) {
        let key = key.to_string();
        let _ = self
            .cache
            .with_fallback(
                move |mut conn| async move {
                    let mut pipe = redis::pipe();
                    pipe.atomic().incr(&key, 1).expire(&key, ttl_sec);
                    pipe.query_async::<_, ()>(&mut conn).await
                },
                || async { Ok(()) },
            )
            .await;
    }
}

fn bucket_key(organization_id: Uuid, granularity: Granularity, window_start: i64) -> String {
    format!("ratelimit:{organization_id}:{}:{window_start}", granularity.label())
}

fn floor_to(now: i64, granularity_sec: i64) -> i64 {
    now - (now % granularity_sec)
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_buckets_to_granularity_boundary() {
        assert_eq!(floor_to(125, 60), 120);
        assert_eq!(floor_to(3661, 3600), 3600);
        assert_eq!(floor_to(10, 1), 10);
    }

    #[test]
    fn bucket_keys_differ_by_granularity() {
        let org = Uuid::new_v4();
        let a = bucket_key(org, Granularity::Second, 100);
        let b = bucket_key(org, Granularity::Minute, 100);
        assert_ne!(a, b);
    }
}
