//! Quota Engine (C5).
//!
//! Per-`(tenant, eventType)` current-period accounting. The counter is a
//! fast-path cache value keyed by period. [`QuotaEngine::check`] is a
//! read-only projection used to pre-flight a whole batch without
//! touching any counter; [`QuotaEngine::reserve`] is the one that
//! actually consumes quota, and does so with a single atomic
//! read-compare-write Lua script (§4.5) so two concurrent requests
//! against the same counter can't both observe headroom and both write.
//! Grounded on the enforcement-mode matching style of
//! `aerolithdb_saas::quotas::QuotaManager::check_operation_allowed`,
//! generalized from AerolithDB's fixed `{storage, api_call, connection}`
//! set to the spec's open `eventType` and three-mode matrix.

use chrono::{DateTime, Utc};
use meterline_core::errors::QuotaViolationDetail;
use meterline_core::types::{EnforcementMode, QuotaLimit};
use redis::AsyncCommands;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::cache::Cache;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub warning: bool,
    pub enforcement_mode: EnforcementMode,
    pub current: Decimal,
    pub limit: Option<Decimal>,
    pub soft_limit: Option<Decimal>,
    pub reset_at: Option<DateTime<Utc>>,
    pub grace_period_end: Option<DateTime<Utc>>,
}

impl QuotaDecision {
    fn disabled() -> Self {
        Self {
            allowed: true,
            warning: false,
            enforcement_mode: EnforcementMode::Disabled,
            current: Decimal::ZERO,
            limit: None,
            soft_limit: None,
            reset_at: None,
            grace_period_end: None,
        }
    }
}

pub struct QuotaEngine {
    store: Store,
    cache: Cache,
}

impl QuotaEngine {
    pub fn new(store: Store, cache: Cache) -> Self {
        Self { store, cache }
    }

    /// Read-only projection of the decision `reserve` would make, without
    /// touching any counter. Used to pre-flight every pair in a batch
    /// before committing any of them (§4.6 step 6): a batch is
    /// all-or-nothing, so nothing may be consumed until every pair in it
    /// has been confirmed to pass.
    pub async fn check(
        &self,
        tenant_id: Uuid,
        event_type: &str,
        qty: Decimal,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, QuotaViolationDetail> {
        let Ok(Some(limit)) = self.store.get_quota_limit(tenant_id, event_type).await else {
            return Ok(QuotaDecision::disabled());
        };

        let period = period_key(limit.reset_at, now);
        let current = self.current_usage(tenant_id, event_type, &period, limit.reset_at).await;
        let ceiling = ceiling_for(&limit, now);
        let allowed = ceiling.is_none_or(|c| current + qty <= c);

        if !allowed {
            return Err(violation_detail(tenant_id, event_type, current, qty, &limit));
        }
        Ok(decision(&limit, current, qty))
    }

    /// `qty` is the pre-summed quantity for this `(tenant, eventType)`
    /// across the whole batch being admitted (§4.5). The read and the
    /// write happen inside one Lua script so the check and the
    /// increment are a single atomic cache round trip — two concurrent
    /// callers can never both observe headroom for the same counter and
    /// both write their increment.
    pub async fn reserve(
        &self,
        tenant_id: Uuid,
        event_type: &str,
        qty: Decimal,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, QuotaViolationDetail> {
        let Ok(Some(limit)) = self.store.get_quota_limit(tenant_id, event_type).await else {
            return Ok(QuotaDecision::disabled());
        };

        let period = period_key(limit.reset_at, now);
        let key = counter_key(tenant_id, event_type, &period);
        let ttl = counter_ttl(limit.reset_at);
        let ceiling = ceiling_for(&limit, now);
        let ceiling_arg = ceiling.map(|c| c.to_string()).unwrap_or_default();
        let qty_arg = qty.to_string();

        let store = self.store.clone();
        let event_type_owned = event_type.to_string();
        let reset_at = limit.reset_at;

        let (allowed, current) = self
            .cache
            .with_fallback(
                move |mut conn| async move {
                    let (allowed, current): (i64, String) = reserve_script()
                        .key(key)
                        .arg(qty_arg)
                        .arg(ceiling_arg)
                        .arg(ttl)
                        .invoke_async(&mut conn)
                        .await?;
                    Ok((allowed != 0, current.parse::<Decimal>().unwrap_or(Decimal::ZERO)))
                },
                move || async move {
                    // The atomic fast path is unavailable; fall back to
                    // the store's own aggregate as a best-effort read and
                    // always allow. This reopens the race the script
                    // closes, but only while the cache is down — billing
                    // never reads this counter, only raw/snapshotted
                    // events (see `InvoiceBuilder::aggregate_quantities`),
                    // so the hard invariant of §8 is preserved regardless.
                    let current = store
                        .sum_quantity_since(tenant_id, &event_type_owned, reset_at)
                        .await
                        .unwrap_or(Decimal::ZERO);
                    Ok((true, current))
                },
            )
            .await
            .unwrap_or((true, Decimal::ZERO));

        if !allowed {
            return Err(violation_detail(tenant_id, event_type, current, qty, &limit));
        }
        Ok(decision(&limit, current, qty))
    }

    async fn current_usage(&self, tenant_id: Uuid, event_type: &str, period: &str, reset_at: DateTime<Utc>) -> Decimal {
        let key = counter_key(tenant_id, event_type, period);
        let store = self.store.clone();
        let event_type_owned = event_type.to_string();
        self.cache
            .with_fallback(
                move |mut conn| async move {
                    let value: Option<String> = conn.get(&key).await?;
                    Ok(value.and_then(|s| s.parse().ok()).unwrap_or(Decimal::ZERO))
                },
                move || async move {
                    store
                        .sum_quantity_since(tenant_id, &event_type_owned, reset_at)
                        .await
                        .map_err(anyhow::Error::from)
                },
            )
            .await
            .unwrap_or(Decimal::ZERO)
    }
}

/// `None` means "no ceiling, always allow": DISABLED mode, or an active
/// grace period regardless of mode. Otherwise the HARD limit or the
/// SOFT limit plus its configured overage.
fn ceiling_for(limit: &QuotaLimit, now: DateTime<Utc>) -> Option<Decimal> {
    let grace = limit.grace_period_end.is_some_and(|end| now < end);
    if grace {
        return None;
    }
    match limit.enforcement_mode {
        EnforcementMode::Disabled => None,
        EnforcementMode::Hard => Some(limit.limit_value),
        EnforcementMode::Soft => Some(limit.limit_value + limit.overage_allowed.unwrap_or(Decimal::ZERO)),
    }
}

fn decision(limit: &QuotaLimit, current: Decimal, qty: Decimal) -> QuotaDecision {
    let projected = current + qty;
    let warning =
        limit.soft_limit_value.is_some_and(|soft| projected > soft) && !matches!(limit.enforcement_mode, EnforcementMode::Disabled);
    QuotaDecision {
        allowed: true,
        warning,
        enforcement_mode: limit.enforcement_mode,
        current: projected,
        limit: Some(limit.limit_value),
        soft_limit: limit.soft_limit_value,
        reset_at: Some(limit.reset_at),
        grace_period_end: limit.grace_period_end,
    }
}

fn violation_detail(tenant_id: Uuid, event_type: &str, current: Decimal, qty: Decimal, limit: &QuotaLimit) -> QuotaViolationDetail {
    QuotaViolationDetail {
        tenant_id,
        event_type: event_type.to_string(),
        current,
        requested: qty,
        limit: limit.limit_value,
        soft_limit: limit.soft_limit_value,
        enforcement_mode: limit.enforcement_mode,
        reset_at: limit.reset_at,
        grace_period_end: limit.grace_period_end,
    }
}

/// `KEYS[1]` the counter, `ARGV[1]` quantity to add, `ARGV[2]` ceiling
/// (empty string means unbounded), `ARGV[3]` the key's TTL in seconds.
/// Returns `{allowed, currentBeforeThisReservation}`. Runs entirely
/// inside Redis so the read and the conditional write are one
/// round-trip; arithmetic is double-precision (Lua's only numeric
/// type), which is adequate for an admission threshold — billed
/// quantities are always recomputed from the fixed-point events/
/// snapshots in the store, never from this counter.
fn reserve_script() -> &'static redis::Script {
    static SCRIPT: std::sync::OnceLock<redis::Script> = std::sync::OnceLock::new();
    SCRIPT.get_or_init(|| {
        redis::Script::new(
            r#"
            local current = tonumber(redis.call('GET', KEYS[1]) or '0')
            local qty = tonumber(ARGV[1])
            local projected = current + qty
            local ceiling = ARGV[2]
            local allowed = 1
            if ceiling ~= '' and projected > tonumber(ceiling) then
                allowed = 0
            end
            if allowed == 1 then
                redis.call('SET', KEYS[1], tostring(projected), 'EX', ARGV[3])
            end
            return {allowed, tostring(current)}
            "#,
        )
    })
}

/// One year of headroom past the reset boundary; the period is embedded
/// in the key so a rollover starts a fresh counter.
fn counter_ttl(reset_at: DateTime<Utc>) -> i64 {
    ((reset_at - Utc::now()).num_seconds() + 365 * 24 * 3600).max(3600)
}

fn period_key(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    // The period is identified by its reset boundary and the calendar
    // month containing `now`; a rollover (resetAt moved forward) yields
    // a new key automatically.
    format!("{}:{}", reset_at.format("%Y%m%d"), now.format("%Y-%m"))
}

fn counter_key(tenant_id: Uuid, event_type: &str, period: &str) -> String {
    format!("quota:{tenant_id}:{event_type}:{period}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn disabled_mode_never_warns() {
        let decision = QuotaDecision::disabled();
        assert!(!decision.warning);
        assert!(decision.allowed);
    }

    #[test]
    fn period_key_changes_across_months() {
        let reset_at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let jan = Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap();
        let feb = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        assert_ne!(period_key(reset_at, jan), period_key(reset_at, feb));
    }
}
