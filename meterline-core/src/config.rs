//! Service configuration, loaded from environment variables.
//!
//! Mirrors the shape of `aerolithdb_saas::config::SaaSConfig` (one struct
//! per concern) but scoped to exactly the knobs named in spec §6.5 plus
//! the pool/timeout knobs of §5. Durations are stored as plain integers
//! (seconds or milliseconds, named accordingly) and converted to
//! `std::time::Duration` at the call site — the `config` crate's
//! environment source has no built-in humantime parsing.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Base URL for generated links (invoice portal, etc).
    pub app_url: String,

    /// System-of-record connection string.
    pub store_url: String,

    /// Fast-path cache connection string.
    pub cache_url: String,

    /// Bearer secret for `/internal/*` operator endpoints.
    pub cron_secret: String,

    /// Payment-processor credentials (webhook contract only; PSP itself
    /// is out of scope).
    pub psp_secret: String,
    pub psp_webhook_secret: String,

    pub billing: BillingConfig,
    pub quota: QuotaConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillingConfig {
    #[serde(deserialize_with = "deserialize_decimal")]
    pub tax_rate: Decimal,
    pub invoice_due_days: i64,
    pub invoice_number_max_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    /// Clock-skew tolerance for caller-supplied future timestamps.
    pub future_timestamp_tolerance_sec: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Bounded concurrency cap for fan-out lookups within one request.
    pub max_concurrent_lookups: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub idempotency_ttl_sec: u64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown_sec: u64,
    pub op_timeout_ms: u64,
}

impl CacheConfig {
    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_sec)
    }
    pub fn circuit_breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_cooldown_sec)
    }
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub request_deadline_sec: u64,
    pub invoice_build_deadline_sec: u64,
    pub store_statement_timeout_sec: u64,
}

impl PipelineConfig {
    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.request_deadline_sec)
    }
    pub fn invoice_build_deadline(&self) -> Duration {
        Duration::from_secs(self.invoice_build_deadline_sec)
    }
    pub fn store_statement_timeout(&self) -> Duration {
        Duration::from_secs(self.store_statement_timeout_sec)
    }
}

fn deserialize_decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse::<Decimal>().map_err(serde::de::Error::custom)
}

impl Config {
    /// Load from environment variables (`config` crate, `__` nested
    /// separator), falling back to the spec's defaults for anything not
    /// set in the environment.
    pub fn load() -> anyhow::Result<Self> {
        let built = config::Config::builder()
            .set_default("app_url", "http://localhost:8080")?
            .set_default("store_url", "postgres://localhost/meterline")?
            .set_default("cache_url", "redis://localhost:6379")?
            .set_default("cron_secret", "dev-cron-secret")?
            .set_default("psp_secret", "dev-psp-secret")?
            .set_default("psp_webhook_secret", "dev-psp-webhook-secret")?
            .set_default("billing.tax_rate", "0.10")?
            .set_default("billing.invoice_due_days", 30)?
            .set_default("billing.invoice_number_max_retries", 8)?
            .set_default("quota.future_timestamp_tolerance_sec", 300)?
            .set_default("rate_limit.max_concurrent_lookups", 64)?
            .set_default("cache.idempotency_ttl_sec", 24 * 3600)?
            .set_default("cache.circuit_breaker_threshold", 5)?
            .set_default("cache.circuit_breaker_cooldown_sec", 30)?
            .set_default("cache.op_timeout_ms", 100)?
            .set_default("pipeline.request_deadline_sec", 30)?
            .set_default("pipeline.invoice_build_deadline_sec", 300)?
            .set_default("pipeline.store_statement_timeout_sec", 5)?
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        built
            .try_deserialize()
            .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))
    }
}
