//! Event Recorder (C6), orchestrating the full ingest sequence of §4.6.
//! Tenant resolution (C3) is [`Store::resolve_tenants`]; everything else
//! in the pipeline is composed here in the order the spec numbers them.
//! Grounded on `aerolithdb_saas::usage_tracker::UsageTracker`'s
//! channel-based fire-and-forget pattern for the background counter
//! update in step 9.

use chrono::{DateTime, Utc};
use meterline_core::errors::{MeteringError, QuotaViolation, ValidationError};
use meterline_core::types::{Permission, UsageEvent};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::credential::{Credential, CredentialValidator};
use crate::idempotency::IdempotencyFilter;
use crate::quota::QuotaEngine;
use crate::store::Store;

pub const MAX_BATCH_SIZE: usize = 1000;

/// One incoming event, pre-parsing validation already applied by the
/// HTTP layer; this is the shape the pipeline actually operates on.
#[derive(Debug, Clone)]
pub struct IngestEvent {
    pub event_type: String,
    pub tenant_external_id: String,
    pub quantity: Decimal,
    pub metadata: serde_json::Value,
    pub timestamp: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub event_id: Uuid,
    pub tenant_id: Uuid,
    pub event_type: String,
    pub idempotency_key: Option<String>,
    pub deduplicated: bool,
}

pub struct RollingCounterUpdate {
    pub tenant_id: Uuid,
    pub event_type: String,
    pub quantity: Decimal,
    pub timestamp: DateTime<Utc>,
}

pub struct EventRecorder {
    store: Store,
    idempotency: IdempotencyFilter,
    quota: QuotaEngine,
    future_timestamp_tolerance: chrono::Duration,
    counter_tx: mpsc::UnboundedSender<RollingCounterUpdate>,
}

impl EventRecorder {
    pub fn new(store: Store, idempotency: IdempotencyFilter, quota: QuotaEngine, quota_config: &meterline_core::config::QuotaConfig) -> Self {
        let (counter_tx, mut counter_rx) = mpsc::unbounded_channel::<RollingCounterUpdate>();
        let snapshot_store = store.clone();
        tokio::spawn(async move {
            while let Some(update) = counter_rx.recv().await {
                let date = update.timestamp.date_naive();
                if let Err(err) = snapshot_store
                    .increment_snapshot(update.tenant_id, date, &update.event_type, update.quantity)
                    .await
                {
                    warn!(error = %err, "rolling counter update failed, will be covered by the next snapshot job run");
                }
            }
        });

        let future_timestamp_tolerance = chrono::Duration::seconds(quota_config.future_timestamp_tolerance_sec);
        Self { store, idempotency, quota, future_timestamp_tolerance, counter_tx }
    }

    /// Steps 1–2 (credential + admission) happen at the HTTP boundary via
    /// [`CredentialValidator`] and [`crate::admission::AdmissionController`]
    /// before this is called; `bearer` here is only re-validated for the
    /// `events:write` permission the caller already authenticated with.
    pub async fn ingest(
        &self,
        credential: &Credential,
        events: Vec<IngestEvent>,
        was_batch: bool,
    ) -> Result<Vec<IngestOutcome>, MeteringError> {
        CredentialValidator::require(credential, Permission::EventsWrite)?;

        if events.is_empty() {
            return Ok(Vec::new());
        }
        if events.len() > MAX_BATCH_SIZE {
            return Err(ValidationError::BatchTooLarge { actual: events.len(), max: MAX_BATCH_SIZE }.into());
        }
        validate_events(&events, self.future_timestamp_tolerance)?;

        let organization_id = credential.organization_id;
        let now = Utc::now();

        // Step 4: resolve all tenants in one batch.
        let external_ids: Vec<String> = events.iter().map(|e| e.tenant_external_id.clone()).collect();
        let tenant_map = self.store.resolve_tenants(organization_id, &external_ids).await?;

        // Step 5: classify for idempotency.
        let keys: Vec<String> = events.iter().filter_map(|e| e.idempotency_key.clone()).collect();
        let existing = self.idempotency.classify(organization_id, &keys).await;

        let mut fresh_indices = Vec::new();
        let mut outcomes: Vec<Option<IngestOutcome>> = vec![None; events.len()];
        for (i, event) in events.iter().enumerate() {
            let tenant_id = tenant_map[&event.tenant_external_id];
            if let Some(key) = &event.idempotency_key {
                if let Some(&event_id) = existing.get(key) {
                    outcomes[i] = Some(IngestOutcome {
                        event_id,
                        tenant_id,
                        event_type: event.event_type.clone(),
                        idempotency_key: Some(key.clone()),
                        deduplicated: true,
                    });
                    continue;
                }
            }
            fresh_indices.push(i);
        }

        // Step 6: batch quota check, pre-summed per (tenant, eventType).
        // First pass checks every pair without mutating any counter, so a
        // batch that fails anywhere leaves every tenant's quota exactly
        // where it was; only once the whole batch is confirmed to pass
        // does the second pass reserve (increment) each pair.
        let mut aggregated: HashMap<(Uuid, String), Decimal> = HashMap::new();
        for &i in &fresh_indices {
            let event = &events[i];
            let tenant_id = tenant_map[&event.tenant_external_id];
            *aggregated.entry((tenant_id, event.event_type.clone())).or_insert(Decimal::ZERO) += event.quantity;
        }

        let mut violations = Vec::new();
        for ((tenant_id, event_type), qty) in &aggregated {
            if let Err(detail) = self.quota.check(*tenant_id, event_type, *qty, now).await {
                violations.push(detail);
            }
        }
        if !violations.is_empty() {
            return Err(if was_batch {
                MeteringError::Quota(QuotaViolation::Batch(violations))
            } else {
                MeteringError::Quota(QuotaViolation::Exceeded(
                    violations.into_iter().next().expect("violations is non-empty"),
                ))
            });
        }
        for ((tenant_id, event_type), qty) in &aggregated {
            self.quota.reserve(*tenant_id, event_type, *qty, now).await?;
        }

        // Step 7: persist fresh events in one batched write.
        let mut to_insert = Vec::with_capacity(fresh_indices.len());
        for &i in &fresh_indices {
            let event = &events[i];
            let tenant_id = tenant_map[&event.tenant_external_id];
            to_insert.push(UsageEvent {
                id: Uuid::new_v4(),
                tenant_id,
                organization_id,
                event_type: event.event_type.clone(),
                quantity: event.quantity,
                metadata: event.metadata.clone(),
                timestamp: event.timestamp.unwrap_or(now),
                idempotency_key: event.idempotency_key.clone(),
                invoice_id: None,
                billed_at: None,
                created_at: now,
            });
        }

        let inserted = self.store.insert_events(to_insert).await?;
        for (pos, &i) in fresh_indices.iter().enumerate() {
            let (row, was_inserted) = &inserted[pos];
            outcomes[i] = Some(IngestOutcome {
                event_id: row.id,
                tenant_id: row.tenant_id,
                event_type: row.event_type.clone(),
                idempotency_key: row.idempotency_key.clone(),
                deduplicated: !was_inserted,
            });

            // Step 8: warm the idempotency cache for every persisted
            // event that carries a key.
            if *was_inserted {
                if let Some(key) = &row.idempotency_key {
                    debug!(event_id = %row.id, %key, "persisted fresh event");
                }
                // Step 9: fire-and-forget rolling counter update.
                let _ = self.counter_tx.send(RollingCounterUpdate {
                    tenant_id: row.tenant_id,
                    event_type: row.event_type.clone(),
                    quantity: row.quantity,
                    timestamp: row.timestamp,
                });
            }
        }

        // Step 10: respond in input order.
        Ok(outcomes.into_iter().map(|o| o.expect("every index was assigned an outcome")).collect())
    }
}

fn validate_events(events: &[IngestEvent], tolerance: chrono::Duration) -> Result<(), ValidationError> {
    let now = Utc::now();
    for event in events {
        if event.event_type.is_empty() || event.event_type.len() > 100 {
            return Err(ValidationError::Field {
                field: "event_type".into(),
                message: "must be 1-100 characters".into(),
            });
        }
        if event.tenant_external_id.is_empty() || event.tenant_external_id.len() > 100 {
            return Err(ValidationError::Field {
                field: "tenant_id".into(),
                message: "must be 1-100 characters".into(),
            });
        }
        if event.quantity <= Decimal::ZERO {
            return Err(ValidationError::Field { field: "quantity".into(), message: "must be > 0".into() });
        }
        if let Some(key) = &event.idempotency_key {
            if key.len() > 255 {
                return Err(ValidationError::Field {
                    field: "idempotency_key".into(),
                    message: "must be <= 255 characters".into(),
                });
            }
        }
        if let Some(timestamp) = event.timestamp {
            if timestamp > now + tolerance {
                return Err(ValidationError::TimestampInFuture {
                    timestamp: timestamp.to_rfc3339(),
                    tolerance_sec: tolerance.num_seconds(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(quantity: Decimal) -> IngestEvent {
        IngestEvent {
            event_type: "api_request".into(),
            tenant_external_id: "t1".into(),
            quantity,
            metadata: serde_json::json!({}),
            timestamp: None,
            idempotency_key: None,
        }
    }

    fn tolerance() -> chrono::Duration {
        chrono::Duration::minutes(5)
    }

    #[test]
    fn rejects_nonpositive_quantity() {
        let err = validate_events(&[sample(Decimal::ZERO)], tolerance()).unwrap_err();
        assert!(matches!(err, ValidationError::Field { field, .. } if field == "quantity"));
    }

    #[test]
    fn rejects_timestamp_beyond_skew_tolerance() {
        let mut event = sample(Decimal::ONE);
        event.timestamp = Some(Utc::now() + chrono::Duration::hours(1));
        let err = validate_events(&[event], tolerance()).unwrap_err();
        assert!(matches!(err, ValidationError::TimestampInFuture { .. }));
    }

    #[test]
    fn accepts_timestamp_within_skew_tolerance() {
        let mut event = sample(Decimal::ONE);
        event.timestamp = Some(Utc::now() + chrono::Duration::seconds(30));
        assert!(validate_events(&[event], tolerance()).is_ok());
    }
}
