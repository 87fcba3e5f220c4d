//! Maps [`MeteringError`] onto the §6.2 JSON error envelope. One
//! `IntoResponse` impl, so every handler returns `Result<_, ApiError>`
//! and gets consistent status codes, headers, and body shape for free —
//! grounded on the single-conversion-point style of
//! `aerolithdb_saas::errors::SaaSError`, generalized to axum's
//! `IntoResponse` rather than a bespoke HTTP-framework shim.

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use meterline_core::errors::{ApiErrorCode, MeteringError};
use serde_json::json;
use uuid::Uuid;

pub struct ApiError {
    inner: MeteringError,
}

impl From<MeteringError> for ApiError {
    fn from(inner: MeteringError) -> Self {
        Self { inner }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.inner.api_code();
        let status = match code {
            ApiErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ApiErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ApiErrorCode::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ApiErrorCode::QuotaExceeded => StatusCode::FORBIDDEN,
            ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let (message, details) = match &self.inner {
            MeteringError::Quota(v) => {
                use meterline_core::errors::{QuotaViolation, QuotaViolationDetail};

                fn flat_json(d: &QuotaViolationDetail) -> serde_json::Value {
                    json!({
                        "tenant_id": d.tenant_id,
                        "event_type": d.event_type,
                        "current": d.current,
                        "requested": d.requested,
                        "limit": d.limit,
                        "softLimit": d.soft_limit,
                        "enforcementMode": d.enforcement_mode.to_string(),
                        "resetAt": d.reset_at,
                        "gracePeriodEnd": d.grace_period_end,
                    })
                }

                // §6.2 batch shape: `violations: [{tenant_id, event_type, details}]`.
                fn batch_item_json(d: &QuotaViolationDetail) -> serde_json::Value {
                    json!({
                        "tenant_id": d.tenant_id,
                        "event_type": d.event_type,
                        "details": {
                            "current": d.current,
                            "requested": d.requested,
                            "limit": d.limit,
                            "softLimit": d.soft_limit,
                            "enforcementMode": d.enforcement_mode.to_string(),
                            "resetAt": d.reset_at,
                            "gracePeriodEnd": d.grace_period_end,
                        },
                    })
                }

                match v {
                    QuotaViolation::Exceeded(detail) => (v.to_string(), flat_json(detail)),
                    QuotaViolation::Batch(details) => (
                        v.to_string(),
                        json!({ "violations": details.iter().map(batch_item_json).collect::<Vec<_>>() }),
                    ),
                }
            }
            MeteringError::Validation(e) => (e.to_string(), json!({})),
            MeteringError::Credential(e) => (e.to_string(), json!({})),
            MeteringError::Admission(e) => (e.to_string(), json!({})),
            MeteringError::DeadlineExceeded => (self.inner.to_string(), json!({})),
            MeteringError::Invoice(_) | MeteringError::Store(_) | MeteringError::Config(_) | MeteringError::Internal(_) => {
                let request_id = Uuid::new_v4();
                tracing::error!(%request_id, error = %self.inner, "internal error");
                ("an internal error occurred".to_string(), json!({ "request_id": request_id }))
            }
        };

        let mut response =
            (status, Json(json!({ "error": message, "code": code.as_str(), "details": details }))).into_response();

        if let MeteringError::Admission(meterline_core::errors::AdmissionError::RateLimited {
            limit,
            remaining,
            reset_at_unix,
            retry_after_sec,
        }) = &self.inner
        {
            let headers = response.headers_mut();
            if let Ok(value) = HeaderValue::from_str(&retry_after_sec.to_string()) {
                headers.insert(HeaderName::from_static("retry-after"), value);
            }
            if let Ok(value) = HeaderValue::from_str(&limit.to_string()) {
                headers.insert(HeaderName::from_static("x-ratelimit-limit"), value);
            }
            if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
                headers.insert(HeaderName::from_static("x-ratelimit-remaining"), value);
            }
            if let Ok(value) = HeaderValue::from_str(&reset_at_unix.to_string()) {
                headers.insert(HeaderName::from_static("x-ratelimit-reset"), value);
            }
        }

        response
    }
}
