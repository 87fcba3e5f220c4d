//! Error taxonomy for the metering pipeline.
//!
//! Each component gets its own error enum; `MeteringError` wraps them with
//! `#[from]` the way `aerolithdb_saas::errors::SaaSError` wraps its
//! component errors. Every variant maps to exactly one of the four
//! API error kinds in `ApiErrorCode` (client / auth / policy / internal),
//! via `MeteringError::api_code` — the mapping lives in one place instead
//! of being re-derived at each HTTP handler.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("invalid bearer credential")]
    Invalid,
    #[error("credential has been revoked")]
    Revoked,
    #[error("credential has expired")]
    Expired,
    #[error("credential lacks required permission: {permission}")]
    Forbidden { permission: String },
}

#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("rate limit exceeded, retry after {retry_after_sec}s")]
    RateLimited { limit: u32, remaining: u32, reset_at_unix: i64, retry_after_sec: i64 },
}

/// One `(tenant, eventType)` pair's quota decision, grounded on the
/// plain-struct shape of `aerolithdb_saas::quotas::QuotaViolation`
/// (itself collected into a `Vec` for per-resource batch reporting).
#[derive(Debug, Clone)]
pub struct QuotaViolationDetail {
    pub tenant_id: uuid::Uuid,
    pub event_type: String,
    pub current: rust_decimal::Decimal,
    pub requested: rust_decimal::Decimal,
    pub limit: rust_decimal::Decimal,
    pub soft_limit: Option<rust_decimal::Decimal>,
    pub enforcement_mode: crate::types::EnforcementMode,
    pub reset_at: chrono::DateTime<chrono::Utc>,
    pub grace_period_end: Option<chrono::DateTime<chrono::Utc>>,
}

impl std::fmt::Display for QuotaViolationDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "quota exceeded for tenant {} event {}: {}+{} > {}",
            self.tenant_id, self.event_type, self.current, self.requested, self.limit
        )
    }
}

#[derive(Error, Debug)]
pub enum QuotaViolation {
    #[error("{0}")]
    Exceeded(QuotaViolationDetail),
    #[error("{} quota violations in batch", .0.len())]
    Batch(Vec<QuotaViolationDetail>),
}

impl From<QuotaViolationDetail> for MeteringError {
    fn from(detail: QuotaViolationDetail) -> Self {
        MeteringError::Quota(QuotaViolation::Exceeded(detail))
    }
}

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("field '{field}': {message}")]
    Field { field: String, message: String },
    #[error("batch size {actual} exceeds maximum of {max}")]
    BatchTooLarge { actual: usize, max: usize },
    #[error("timestamp {timestamp} is too far in the future (tolerance {tolerance_sec}s)")]
    TimestampInFuture { timestamp: String, tolerance_sec: i64 },
}

#[derive(Error, Debug)]
pub enum InvoiceError {
    #[error("invoice number generation failed after {attempts} attempts")]
    NumberGenerationExhausted { attempts: u32 },
    #[error("invoice build exceeded its deadline")]
    DeadlineExceeded,
}

#[derive(Error, Debug)]
pub enum MeteringError {
    #[error("{0}")]
    Credential(#[from] CredentialError),

    #[error("{0}")]
    Admission(#[from] AdmissionError),

    #[error("{0}")]
    Quota(#[from] QuotaViolation),

    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Invoice(#[from] InvoiceError),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("request exceeded its deadline")]
    DeadlineExceeded,
}

/// The four response kinds from spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorCode {
    InvalidRequest,
    Unauthorized,
    Forbidden,
    RateLimitExceeded,
    QuotaExceeded,
    InternalError,
}

impl ApiErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiErrorCode::InvalidRequest => "INVALID_REQUEST",
            ApiErrorCode::Unauthorized => "UNAUTHORIZED",
            ApiErrorCode::Forbidden => "FORBIDDEN",
            ApiErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ApiErrorCode::QuotaExceeded => "QUOTA_EXCEEDED",
            ApiErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl MeteringError {
    pub fn api_code(&self) -> ApiErrorCode {
        match self {
            MeteringError::Credential(CredentialError::Forbidden { .. }) => ApiErrorCode::Forbidden,
            MeteringError::Credential(_) => ApiErrorCode::Unauthorized,
            MeteringError::Admission(_) => ApiErrorCode::RateLimitExceeded,
            MeteringError::Quota(_) => ApiErrorCode::QuotaExceeded,
            MeteringError::Validation(_) => ApiErrorCode::InvalidRequest,
            MeteringError::Invoice(_) => ApiErrorCode::InternalError,
            MeteringError::Store(_) => ApiErrorCode::InternalError,
            MeteringError::Config(_) => ApiErrorCode::InternalError,
            MeteringError::Internal(_) => ApiErrorCode::InternalError,
            MeteringError::DeadlineExceeded => ApiErrorCode::InternalError,
        }
    }
}

pub type MeteringResult<T> = Result<T, MeteringError>;
