//! Request/response bodies for the ingest API (§6.1), matching the wire
//! shapes exactly rather than reusing the domain types directly — keeps
//! a JSON-compatibility seam between the public contract and
//! [`meterline_core::types`].

use chrono::{DateTime, Utc};
use meterline_engine::ingest::{IngestEvent, IngestOutcome};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn default_quantity() -> Decimal {
    Decimal::ONE
}

#[derive(Debug, Deserialize)]
pub struct EventPayload {
    pub event_type: String,
    pub tenant_id: String,
    #[serde(default = "default_quantity")]
    pub quantity: Decimal,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub timestamp: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
}

impl From<EventPayload> for IngestEvent {
    fn from(p: EventPayload) -> Self {
        IngestEvent {
            event_type: p.event_type,
            tenant_external_id: p.tenant_id,
            quantity: p.quantity,
            metadata: if p.metadata.is_null() { serde_json::json!({}) } else { p.metadata },
            timestamp: p.timestamp,
            idempotency_key: p.idempotency_key,
        }
    }
}

/// Accepts either a bare event object or `{ "events": [...] }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum IngestRequest {
    Batch { events: Vec<EventPayload> },
    Single(Box<EventPayload>),
}

impl IngestRequest {
    pub fn into_events(self) -> (Vec<EventPayload>, bool) {
        match self {
            IngestRequest::Batch { events } => (events, true),
            IngestRequest::Single(event) => (vec![*event], false),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SingleIngestResponse {
    pub success: bool,
    pub event_id: Uuid,
    pub deduplicated: bool,
}

#[derive(Debug, Serialize)]
pub struct IngestedEvent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub deduplicated: bool,
}

impl From<&IngestOutcome> for IngestedEvent {
    fn from(o: &IngestOutcome) -> Self {
        Self {
            id: o.event_id,
            tenant_id: o.tenant_id,
            event_type: o.event_type.clone(),
            idempotency_key: o.idempotency_key.clone(),
            deduplicated: o.deduplicated,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchIngestResponse {
    pub success: bool,
    pub count: usize,
    pub new_events: usize,
    pub deduplicated: usize,
    pub event_ids: Vec<Uuid>,
    pub events: Vec<IngestedEvent>,
}

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    pub tenant_id: Option<Uuid>,
    pub event_type: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct EventDto {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub event_type: String,
    pub quantity: Decimal,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub idempotency_key: Option<String>,
}

impl From<meterline_core::types::UsageEvent> for EventDto {
    fn from(e: meterline_core::types::UsageEvent) -> Self {
        Self {
            id: e.id,
            tenant_id: e.tenant_id,
            event_type: e.event_type,
            quantity: e.quantity,
            metadata: e.metadata,
            timestamp: e.timestamp,
            idempotency_key: e.idempotency_key,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListEventsResponse {
    pub events: Vec<EventDto>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    #[default]
    EventType,
    Tenant,
    Day,
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub tenant_id: Option<Uuid>,
    #[serde(default)]
    pub group_by: GroupBy,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct UsageBucket {
    pub key: String,
    pub quantity: Decimal,
}

#[derive(Debug, Serialize)]
pub struct UsageResponse {
    pub group_by: &'static str,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub buckets: Vec<UsageBucket>,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotRequest {
    pub date: Option<chrono::NaiveDate>,
}

#[derive(Debug, Serialize)]
pub struct SnapshotResponse {
    pub success: bool,
    pub date: chrono::NaiveDate,
    pub tenants_processed: usize,
}

#[derive(Debug, Deserialize)]
pub struct BuildInvoiceRequest {
    pub tenant_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct PspWebhookPayload {
    pub organization_id: Uuid,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub success: bool,
}
