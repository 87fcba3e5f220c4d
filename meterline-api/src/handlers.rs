//! HTTP handlers for §6.1–6.3. Each one authenticates, admits, then
//! delegates straight into the engine; grounded on the thin-handler
//! style of `aerolithdb_api::rest`'s `RESTAPIv1` methods, which do the
//! same authenticate-then-delegate dance against the SaaS layer.

use std::collections::HashMap;
use std::str::FromStr;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json as AxumJson;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use meterline_core::errors::{AdmissionError, CredentialError, MeteringError, ValidationError};
use meterline_core::types::{Permission, SubscriptionStatus};
use meterline_engine::ingest::IngestEvent;
use rust_decimal::Decimal;

use crate::dto::*;
use crate::error::ApiError;
use crate::extract::Json;
use crate::state::AppState;

/// Wraps a handler future so §6.5's per-request deadline (`request_deadline_sec`
/// / `invoice_build_deadline_sec`) surfaces as `MeteringError::DeadlineExceeded`
/// instead of hanging the connection.
async fn with_deadline<T>(
    deadline: std::time::Duration,
    fut: impl std::future::Future<Output = Result<T, ApiError>>,
) -> Result<T, ApiError> {
    tokio::time::timeout(deadline, fut).await.unwrap_or_else(|_| Err(MeteringError::DeadlineExceeded.into()))
}

fn bearer(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::from(MeteringError::Credential(CredentialError::Invalid)))
}

/// Steps 1–2 of §4.6: authenticate, then admit. Shared by every
/// authenticated route since both must run before any handler-specific
/// work (§4.2, §4.1).
async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    required: Permission,
) -> Result<meterline_engine::credential::Credential, ApiError> {
    let credential = state.credentials.validate(bearer(headers)?).await.map_err(MeteringError::from)?;
    meterline_engine::credential::CredentialValidator::require(&credential, required).map_err(MeteringError::from)?;

    let admission = state
        .admission
        .admit(credential.organization_id)
        .await
        .map_err(MeteringError::from)?;
    if !admission.allowed {
        return Err(MeteringError::Admission(AdmissionError::RateLimited {
            limit: admission.limit.unwrap_or(0),
            remaining: admission.remaining.unwrap_or(0),
            reset_at_unix: admission.reset_at_unix,
            retry_after_sec: admission.retry_after_sec.unwrap_or(0),
        })
        .into());
    }
    Ok(credential)
}

pub async fn ingest_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<IngestRequest>,
) -> Result<Response, ApiError> {
    let deadline = state.config.pipeline.request_deadline();
    with_deadline(deadline, async {
        let credential = authenticate(&state, &headers, Permission::EventsWrite).await?;

        let (payloads, was_batch) = body.into_events();
        let events: Vec<_> = payloads.into_iter().map(IngestEvent::from).collect();

        let outcomes = state.recorder.ingest(&credential, events, was_batch).await?;

        if !was_batch {
            let outcome = outcomes.into_iter().next().ok_or_else(|| {
                ApiError::from(MeteringError::Validation(ValidationError::Field {
                    field: "events".into(),
                    message: "must contain at least one event".into(),
                }))
            })?;
            return Ok(AxumJson(SingleIngestResponse {
                success: true,
                event_id: outcome.event_id,
                deduplicated: outcome.deduplicated,
            })
            .into_response());
        }

        let new_events = outcomes.iter().filter(|o| !o.deduplicated).count();
        let deduplicated = outcomes.len() - new_events;
        Ok(AxumJson(BatchIngestResponse {
            success: true,
            count: outcomes.len(),
            new_events,
            deduplicated,
            event_ids: outcomes.iter().map(|o| o.event_id).collect(),
            events: outcomes.iter().map(IngestedEvent::from).collect(),
        })
        .into_response())
    })
    .await
}

pub async fn list_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListEventsQuery>,
) -> Result<AxumJson<ListEventsResponse>, ApiError> {
    authenticate(&state, &headers, Permission::UsageRead).await?;

    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let events = state
        .store
        .list_events(query.tenant_id, query.event_type.as_deref(), query.start_date, query.end_date, limit)
        .await
        .map_err(MeteringError::from)?;

    Ok(AxumJson(ListEventsResponse { events: events.into_iter().map(EventDto::from).collect() }))
}

pub async fn get_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UsageQuery>,
) -> Result<AxumJson<UsageResponse>, ApiError> {
    authenticate(&state, &headers, Permission::UsageRead).await?;

    let now = Utc::now();
    let period_start = query.start_date.unwrap_or_else(|| {
        Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0).single().unwrap_or(now)
    });
    let period_end = query.end_date.unwrap_or(now);

    let events = state
        .store
        .list_events(query.tenant_id, None, Some(period_start), Some(period_end), 1_000_000)
        .await
        .map_err(MeteringError::from)?;

    let mut totals: HashMap<String, Decimal> = HashMap::new();
    for event in &events {
        let key = match query.group_by {
            GroupBy::EventType => event.event_type.clone(),
            GroupBy::Tenant => event.tenant_id.to_string(),
            GroupBy::Day => event.timestamp.date_naive().to_string(),
        };
        *totals.entry(key).or_insert(Decimal::ZERO) += event.quantity;
    }

    let mut buckets: Vec<UsageBucket> = totals.into_iter().map(|(key, quantity)| UsageBucket { key, quantity }).collect();
    buckets.sort_by(|a, b| a.key.cmp(&b.key));

    let group_by = match query.group_by {
        GroupBy::EventType => "event_type",
        GroupBy::Tenant => "tenant",
        GroupBy::Day => "day",
    };

    Ok(AxumJson(UsageResponse { group_by, period_start, period_end, buckets }))
}

fn authorize_operator(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let token = bearer(headers)?;
    if token != state.config.cron_secret {
        return Err(MeteringError::Credential(CredentialError::Invalid).into());
    }
    Ok(())
}

/// §6.3 `/internal/snapshots`: builds the prior UTC day's rollups (or an
/// explicit `date`), iterating active tenants in batches of 50.
pub async fn build_snapshots(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SnapshotRequest>,
) -> Result<AxumJson<SnapshotResponse>, ApiError> {
    authorize_operator(&state, &headers)?;

    let date = body.date.unwrap_or_else(|| (Utc::now() - chrono::Duration::days(1)).date_naive());
    let day_start: DateTime<Utc> = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("valid midnight"));
    let day_end: DateTime<Utc> = Utc.from_utc_datetime(
        &date.and_hms_milli_opt(23, 59, 59, 999).expect("valid end-of-day"),
    );

    const BATCH: i64 = 50;
    let mut processed = 0usize;
    let mut offset = 0i64;
    loop {
        let tenants = state.store.list_active_tenants(BATCH, offset).await.map_err(MeteringError::from)?;
        if tenants.is_empty() {
            break;
        }
        for tenant in &tenants {
            let events = state
                .store
                .events_for_tenant_range(tenant.id, day_start, day_end)
                .await
                .map_err(MeteringError::from)?;

            let mut per_type: HashMap<String, Decimal> = HashMap::new();
            for event in events {
                *per_type.entry(event.event_type).or_insert(Decimal::ZERO) += event.quantity;
            }
            for (event_type, quantity) in per_type {
                state
                    .store
                    .replace_snapshot(tenant.id, date, &event_type, quantity)
                    .await
                    .map_err(MeteringError::from)?;
            }
            processed += 1;
        }
        offset += BATCH;
    }

    Ok(AxumJson(SnapshotResponse { success: true, date, tenants_processed: processed }))
}

/// Triggers `BuildInvoice` (§4.7) for one tenant/period. Operator-only,
/// same as the snapshot job — invoice runs are a billing-cycle concern
/// external callers don't drive directly.
pub async fn build_invoice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<BuildInvoiceRequest>,
) -> Result<AxumJson<meterline_core::types::Invoice>, ApiError> {
    authorize_operator(&state, &headers)?;

    let deadline = state.config.pipeline.invoice_build_deadline();
    with_deadline(deadline, async {
        let tenant = state
            .store
            .get_tenant(body.tenant_id)
            .await
            .map_err(MeteringError::from)?
            .ok_or_else(|| {
                ApiError::from(MeteringError::Validation(ValidationError::Field {
                    field: "tenant_id".into(),
                    message: "no such tenant".into(),
                }))
            })?;
        let organization = state
            .store
            .get_organization(tenant.organization_id)
            .await
            .map_err(MeteringError::from)?
            .ok_or_else(|| {
                ApiError::from(MeteringError::Validation(ValidationError::Field {
                    field: "tenant_id".into(),
                    message: "tenant has no owning organization".into(),
                }))
            })?;

        let invoice = state
            .invoices
            .build(tenant.id, organization.id, &organization.slug, body.period_start, body.period_end)
            .await
            .map_err(MeteringError::from)?;

        Ok(AxumJson(invoice))
    })
    .await
}

pub async fn get_invoice(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::extract::Path(invoice_id): axum::extract::Path<uuid::Uuid>,
) -> Result<AxumJson<meterline_core::types::Invoice>, ApiError> {
    authenticate(&state, &headers, Permission::UsageRead).await?;

    let invoice = state.store.get_invoice(invoice_id).await.map_err(MeteringError::from)?.ok_or_else(|| {
        ApiError::from(MeteringError::Validation(ValidationError::Field {
            field: "invoice_id".into(),
            message: "no such invoice".into(),
        }))
    })?;

    Ok(AxumJson(invoice))
}

/// §6.3 PSP webhook: HMAC-SHA256 over the raw body, verified against
/// `psp_webhook_secret` before the payload is trusted.
pub async fn psp_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<AxumJson<WebhookResponse>, ApiError> {
    let signature = headers
        .get("x-psp-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::from(MeteringError::Credential(CredentialError::Invalid)))?;

    verify_hmac(&state.config.psp_webhook_secret, &body, signature)
        .map_err(|_| ApiError::from(MeteringError::Credential(CredentialError::Invalid)))?;

    let payload: PspWebhookPayload = serde_json::from_slice(&body).map_err(|e| {
        ApiError::from(MeteringError::Validation(ValidationError::Field {
            field: "body".into(),
            message: e.to_string(),
        }))
    })?;

    let status = SubscriptionStatus::from_str(&payload.status).map_err(|_| {
        ApiError::from(MeteringError::Validation(ValidationError::Field {
            field: "status".into(),
            message: "unrecognized subscription status".into(),
        }))
    })?;

    state
        .store
        .set_subscription_status(payload.organization_id, status, Utc::now())
        .await
        .map_err(MeteringError::from)?;

    Ok(AxumJson(WebhookResponse { success: true }))
}

fn verify_hmac(secret: &str, body: &[u8], provided_hex: &str) -> Result<(), ()> {
    let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, secret.as_bytes());
    let provided = hex::decode(provided_hex).map_err(|_| ())?;
    ring::hmac::verify(&key, body, &provided).map_err(|_| ())
}

pub async fn health() -> impl IntoResponse {
    (axum::http::StatusCode::OK, AxumJson(serde_json::json!({ "status": "ok" })))
}
