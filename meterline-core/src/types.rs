//! Domain types shared across the metering pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// The service's own customer: a SaaS company metering its usage through us.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The organization's own customer — the entity whose usage is metered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub external_id: String,
    pub name: String,
    pub status: TenantStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TenantStatus {
    Active,
    Suspended,
    Deleted,
}

impl std::fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TenantStatus::Active => "ACTIVE",
            TenantStatus::Suspended => "SUSPENDED",
            TenantStatus::Deleted => "DELETED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TenantStatus {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(TenantStatus::Active),
            "SUSPENDED" => Ok(TenantStatus::Suspended),
            "DELETED" => Ok(TenantStatus::Deleted),
            _ => Err(()),
        }
    }
}

/// The atom of billing: one unit of observed usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub organization_id: Uuid,
    pub event_type: String,
    pub quantity: Decimal,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub idempotency_key: Option<String>,
    pub invoice_id: Option<Uuid>,
    pub billed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Daily roll-up of quantity per `(tenant, date, event_type)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub tenant_id: Uuid,
    pub date: NaiveDate,
    pub event_type: String,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnforcementMode {
    Hard,
    Soft,
    Disabled,
}

impl std::fmt::Display for EnforcementMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EnforcementMode::Hard => "HARD",
            EnforcementMode::Soft => "SOFT",
            EnforcementMode::Disabled => "DISABLED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for EnforcementMode {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HARD" => Ok(EnforcementMode::Hard),
            "SOFT" => Ok(EnforcementMode::Soft),
            "DISABLED" => Ok(EnforcementMode::Disabled),
            _ => Err(()),
        }
    }
}

/// Per-`(tenant, eventType)` quota configuration. Absence means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaLimit {
    pub tenant_id: Uuid,
    pub event_type: String,
    pub limit_value: Decimal,
    pub soft_limit_value: Option<Decimal>,
    pub enforcement_mode: EnforcementMode,
    pub overage_allowed: Option<Decimal>,
    pub grace_period_end: Option<DateTime<Utc>>,
    pub reset_at: DateTime<Utc>,
}

/// One step of a per-`(organization, eventType)` tiered price curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingTier {
    pub organization_id: Uuid,
    pub event_type: String,
    pub tier_level: i32,
    pub min_quantity: Decimal,
    pub max_quantity: Option<Decimal>,
    /// Price per unit, in minor currency units. May carry fractional
    /// precision (e.g. a tenth of a cent per API call); only the summed
    /// line-item total is rounded to whole minor units.
    pub unit_price: Decimal,
    pub effective_from: DateTime<Utc>,
    pub effective_to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceStatus {
    Draft,
    Pending,
    Paid,
    Overdue,
    Cancelled,
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InvoiceStatus::Draft => "DRAFT",
            InvoiceStatus::Pending => "PENDING",
            InvoiceStatus::Paid => "PAID",
            InvoiceStatus::Overdue => "OVERDUE",
            InvoiceStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for InvoiceStatus {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(InvoiceStatus::Draft),
            "PENDING" => Ok(InvoiceStatus::Pending),
            "PAID" => Ok(InvoiceStatus::Paid),
            "OVERDUE" => Ok(InvoiceStatus::Overdue),
            "CANCELLED" => Ok(InvoiceStatus::Cancelled),
            _ => Err(()),
        }
    }
}

/// One tier's contribution to a line item's total, for audit display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierBreakdown {
    pub tier_level: i32,
    pub consumed: Decimal,
    pub unit_price: Decimal,
    pub subtotal: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceLineItem {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub event_type: String,
    pub quantity: Decimal,
    /// Display-only average; never used in further arithmetic.
    pub unit_price: Decimal,
    /// Minor currency units.
    pub total_price: i64,
    pub breakdown: Vec<TierBreakdown>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub organization_id: Uuid,
    pub invoice_number: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub status: InvoiceStatus,
    /// Minor currency units.
    pub subtotal: i64,
    pub tax: i64,
    pub total: i64,
    pub due_date: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub line_items: Vec<InvoiceLineItem>,
}

/// Permissions a bearer credential may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "events:write")]
    EventsWrite,
    #[serde(rename = "usage:read")]
    UsageRead,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::EventsWrite => "events:write",
            Permission::UsageRead => "usage:read",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "events:write" => Some(Permission::EventsWrite),
            "usage:read" => Some(Permission::UsageRead),
            _ => None,
        }
    }
}

/// Bearer credential. Only the SHA-256 hash of the raw key is ever stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub key_hash: String,
    pub key_prefix: String,
    pub permissions: Vec<Permission>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Per-organization (optionally per-key) sliding-window rate limit policy.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RateLimitPolicy {
    pub requests_per_second: Option<u32>,
    pub requests_per_minute: Option<u32>,
    pub requests_per_hour: Option<u32>,
}

/// Local projection of PSP subscription state, mutated only by the
/// webhook handler (§6.3). The PSP itself is out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionStatus {
    Active,
    Canceled,
    PastDue,
    Trialing,
    Unpaid,
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::Canceled => "CANCELED",
            SubscriptionStatus::PastDue => "PAST_DUE",
            SubscriptionStatus::Trialing => "TRIALING",
            SubscriptionStatus::Unpaid => "UNPAID",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(SubscriptionStatus::Active),
            "CANCELED" => Ok(SubscriptionStatus::Canceled),
            "PAST_DUE" => Ok(SubscriptionStatus::PastDue),
            "TRIALING" => Ok(SubscriptionStatus::Trialing),
            "UNPAID" => Ok(SubscriptionStatus::Unpaid),
            _ => Err(()),
        }
    }
}

pub type Metadata = HashMap<String, serde_json::Value>;
