//! System-of-record persistence (Postgres via `sqlx`).
//!
//! Follows the teacher's convention (`aerolithdb_saas::tenant::TenantManager`):
//! plain `sqlx::query` rather than the `query!`/`query_as!` macros (no
//! compile-time DB connection required), manual `row_to_x` mapping
//! functions, schema created in-process via `CREATE TABLE IF NOT EXISTS`
//! on startup rather than an external migration tool. Every invariant-
//! bearing write (event inserts, the invoice/line-item/event-backlink
//! commit, snapshot upserts) goes through here; the unique constraints
//! are the correctness backstop this module leans on, not application
//! locking.

use chrono::{DateTime, NaiveDate, Utc};
use meterline_core::types::*;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub type StoreResult<T> = Result<T, sqlx::Error>;

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// `statement_timeout` bounds how long any single statement may run
    /// (§5 "store ≤ 5s per statement"); it is applied per pooled
    /// connection via `SET statement_timeout`, not the pool's own
    /// connection-acquire wait.
    pub async fn connect(url: &str, statement_timeout: Duration) -> StoreResult<Self> {
        let statement_timeout_ms = statement_timeout.as_millis() as i64;
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(10))
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    sqlx::query(&format!("SET statement_timeout = {statement_timeout_ms}"))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(url)
            .await?;
        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    #[cfg(test)]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn initialize_schema(&self) -> StoreResult<()> {
        debug!("initializing store schema");
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS organizations (
                id UUID PRIMARY KEY,
                slug TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tenants (
                id UUID PRIMARY KEY,
                organization_id UUID NOT NULL REFERENCES organizations(id),
                external_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (organization_id, external_id)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage_events (
                id UUID PRIMARY KEY,
                tenant_id UUID NOT NULL REFERENCES tenants(id),
                organization_id UUID NOT NULL REFERENCES organizations(id),
                event_type TEXT NOT NULL,
                quantity NUMERIC NOT NULL,
                metadata JSONB NOT NULL DEFAULT '{}',
                timestamp TIMESTAMPTZ NOT NULL,
                idempotency_key TEXT,
                invoice_id UUID,
                billed_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (organization_id, idempotency_key)
            )"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_usage_events_tenant_time ON usage_events(tenant_id, timestamp)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_usage_events_invoice ON usage_events(invoice_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage_snapshots (
                tenant_id UUID NOT NULL REFERENCES tenants(id),
                date DATE NOT NULL,
                event_type TEXT NOT NULL,
                quantity NUMERIC NOT NULL,
                PRIMARY KEY (tenant_id, date, event_type)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quota_limits (
                tenant_id UUID NOT NULL REFERENCES tenants(id),
                event_type TEXT NOT NULL,
                limit_value NUMERIC NOT NULL,
                soft_limit_value NUMERIC,
                enforcement_mode TEXT NOT NULL,
                overage_allowed NUMERIC,
                grace_period_end TIMESTAMPTZ,
                reset_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (tenant_id, event_type)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pricing_tiers (
                organization_id UUID NOT NULL REFERENCES organizations(id),
                event_type TEXT NOT NULL,
                tier_level INT NOT NULL,
                min_quantity NUMERIC NOT NULL,
                max_quantity NUMERIC,
                unit_price NUMERIC NOT NULL,
                effective_from TIMESTAMPTZ NOT NULL,
                effective_to TIMESTAMPTZ,
                PRIMARY KEY (organization_id, event_type, tier_level)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS invoices (
                id UUID PRIMARY KEY,
                tenant_id UUID NOT NULL REFERENCES tenants(id),
                organization_id UUID NOT NULL REFERENCES organizations(id),
                invoice_number TEXT NOT NULL UNIQUE,
                period_start TIMESTAMPTZ NOT NULL,
                period_end TIMESTAMPTZ NOT NULL,
                status TEXT NOT NULL,
                subtotal BIGINT NOT NULL,
                tax BIGINT NOT NULL,
                total BIGINT NOT NULL,
                due_date TIMESTAMPTZ NOT NULL,
                paid_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_invoices_org ON invoices(organization_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS invoice_line_items (
                id UUID PRIMARY KEY,
                invoice_id UUID NOT NULL REFERENCES invoices(id),
                event_type TEXT NOT NULL,
                quantity NUMERIC NOT NULL,
                unit_price NUMERIC NOT NULL,
                total_price BIGINT NOT NULL,
                breakdown JSONB NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS api_keys (
                id UUID PRIMARY KEY,
                organization_id UUID NOT NULL REFERENCES organizations(id),
                key_hash TEXT NOT NULL UNIQUE,
                key_prefix TEXT NOT NULL,
                permissions TEXT[] NOT NULL,
                expires_at TIMESTAMPTZ,
                revoked_at TIMESTAMPTZ,
                last_used_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rate_limit_policies (
                organization_id UUID PRIMARY KEY REFERENCES organizations(id),
                requests_per_second INT,
                requests_per_minute INT,
                requests_per_hour INT
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscriptions (
                organization_id UUID PRIMARY KEY REFERENCES organizations(id),
                status TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"#,
        )
        .execute(&self.pool)
        .await?;

        debug!("store schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Tenant Resolver (C3)
    // ------------------------------------------------------------------

    /// Batched find-or-create. Deduplicates `external_ids`, resolves all
    /// existing rows in one query, then upserts the misses inside a
    /// transaction. The unique constraint on `(organization_id,
    /// external_id)` — not the transaction boundary — is what makes
    /// concurrent ingesters converge on the same tenant row.
    pub async fn resolve_tenants(
        &self,
        organization_id: Uuid,
        external_ids: &[String],
    ) -> StoreResult<HashMap<String, Uuid>> {
        let mut unique: Vec<String> = external_ids.to_vec();
        unique.sort();
        unique.dedup();
        if unique.is_empty() {
            return Ok(HashMap::new());
        }

        let mut resolved = HashMap::new();

        let rows = sqlx::query(
            "SELECT id, external_id FROM tenants WHERE organization_id = $1 AND external_id = ANY($2)",
        )
        .bind(organization_id)
        .bind(&unique)
        .fetch_all(&self.pool)
        .await?;
        for row in &rows {
            let external_id: String = row.try_get("external_id")?;
            let id: Uuid = row.try_get("id")?;
            resolved.insert(external_id, id);
        }

        let missing: Vec<&String> = unique.iter().filter(|e| !resolved.contains_key(*e)).collect();
        if !missing.is_empty() {
            let mut tx = self.pool.begin().await?;
            for external_id in missing {
                let now = Utc::now();
                let row = sqlx::query(
                    r#"
                    INSERT INTO tenants (id, organization_id, external_id, name, status, created_at, updated_at)
                    VALUES ($1, $2, $3, $3, 'ACTIVE', $4, $4)
                    ON CONFLICT (organization_id, external_id) DO UPDATE SET external_id = EXCLUDED.external_id
                    RETURNING id
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(organization_id)
                .bind(external_id)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?;
                let id: Uuid = row.try_get("id")?;
                resolved.insert(external_id.clone(), id);
            }
            tx.commit().await?;
        }

        Ok(resolved)
    }

    pub async fn get_tenant(&self, tenant_id: Uuid) -> StoreResult<Option<Tenant>> {
        let row = sqlx::query("SELECT * FROM tenants WHERE id = $1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_tenant).transpose()
    }

    // ------------------------------------------------------------------
    // Idempotency Filter (C4) — store fallback
    // ------------------------------------------------------------------

    pub async fn find_events_by_idempotency_keys(
        &self,
        organization_id: Uuid,
        keys: &[String],
    ) -> StoreResult<HashMap<String, Uuid>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            "SELECT id, idempotency_key FROM usage_events WHERE organization_id = $1 AND idempotency_key = ANY($2)",
        )
        .bind(organization_id)
        .bind(keys)
        .fetch_all(&self.pool)
        .await?;
        let mut out = HashMap::new();
        for row in rows {
            let key: Option<String> = row.try_get("idempotency_key")?;
            let id: Uuid = row.try_get("id")?;
            if let Some(key) = key {
                out.insert(key, id);
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Quota Engine (C5) — store fallback for the running total
    // ------------------------------------------------------------------

    pub async fn get_quota_limit(
        &self,
        tenant_id: Uuid,
        event_type: &str,
    ) -> StoreResult<Option<QuotaLimit>> {
        let row = sqlx::query("SELECT * FROM quota_limits WHERE tenant_id = $1 AND event_type = $2")
            .bind(tenant_id)
            .bind(event_type)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_quota_limit).transpose()
    }

    /// `SUM(quantity)` since `reset_at`, used when the fast-path counter
    /// cache is unavailable.
    pub async fn sum_quantity_since(
        &self,
        tenant_id: Uuid,
        event_type: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Decimal> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(quantity), 0) AS total FROM usage_events \
             WHERE tenant_id = $1 AND event_type = $2 AND timestamp >= $3",
        )
        .bind(tenant_id)
        .bind(event_type)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        row.try_get("total")
    }

    // ------------------------------------------------------------------
    // Event Recorder (C6)
    // ------------------------------------------------------------------

    /// Insert a batch of fresh events. Returns, per event, the row that
    /// now exists and whether this call is the one that inserted it —
    /// `false` means a concurrent writer already won the
    /// `(organization_id, idempotency_key)` race.
    pub async fn insert_events(&self, events: Vec<UsageEvent>) -> StoreResult<Vec<(UsageEvent, bool)>> {
        let mut out = Vec::with_capacity(events.len());
        let mut tx = self.pool.begin().await?;
        for event in events {
            let inserted = sqlx::query(
                r#"
                INSERT INTO usage_events
                    (id, tenant_id, organization_id, event_type, quantity, metadata,
                     timestamp, idempotency_key, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (organization_id, idempotency_key) DO NOTHING
                RETURNING *
                "#,
            )
            .bind(event.id)
            .bind(event.tenant_id)
            .bind(event.organization_id)
            .bind(&event.event_type)
            .bind(event.quantity)
            .bind(&event.metadata)
            .bind(event.timestamp)
            .bind(&event.idempotency_key)
            .bind(event.created_at)
            .fetch_optional(&mut *tx)
            .await?;

            match inserted {
                Some(row) => out.push((row_to_event(row)?, true)),
                None => {
                    let key = event.idempotency_key.as_deref().unwrap_or_default();
                    let row = sqlx::query(
                        "SELECT * FROM usage_events WHERE organization_id = $1 AND idempotency_key = $2",
                    )
                    .bind(event.organization_id)
                    .bind(key)
                    .fetch_one(&mut *tx)
                    .await?;
                    out.push((row_to_event(row)?, false));
                }
            }
        }
        tx.commit().await?;
        Ok(out)
    }

    pub async fn list_events(
        &self,
        tenant_id: Option<Uuid>,
        event_type: Option<&str>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: i64,
    ) -> StoreResult<Vec<UsageEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM usage_events
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
              AND ($2::text IS NULL OR event_type = $2)
              AND ($3::timestamptz IS NULL OR timestamp >= $3)
              AND ($4::timestamptz IS NULL OR timestamp <= $4)
            ORDER BY timestamp DESC
            LIMIT $5
            "#,
        )
        .bind(tenant_id)
        .bind(event_type)
        .bind(start)
        .bind(end)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_event).collect()
    }

    // ------------------------------------------------------------------
    // Scheduled snapshots (§6.3)
    // ------------------------------------------------------------------

    /// Replaces a day's rollup with a freshly-computed total. Used by the
    /// `/internal/snapshots` batch job, which sums the full day from raw
    /// events before calling this — replace is correct there, a rerun must
    /// not double-count on top of a prior run.
    pub async fn replace_snapshot(
        &self,
        tenant_id: Uuid,
        date: NaiveDate,
        event_type: &str,
        quantity: Decimal,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_snapshots (tenant_id, date, event_type, quantity)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id, date, event_type) DO UPDATE SET quantity = EXCLUDED.quantity
            "#,
        )
        .bind(tenant_id)
        .bind(date)
        .bind(event_type)
        .bind(quantity)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Adds `delta` onto a day's rollup, creating the row at `delta` if
    /// absent. Used by the per-event rolling counter, where each call
    /// carries one event's own quantity rather than the day's running total.
    pub async fn increment_snapshot(
        &self,
        tenant_id: Uuid,
        date: NaiveDate,
        event_type: &str,
        delta: Decimal,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_snapshots (tenant_id, date, event_type, quantity)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id, date, event_type) DO UPDATE SET quantity = usage_snapshots.quantity + EXCLUDED.quantity
            "#,
        )
        .bind(tenant_id)
        .bind(date)
        .bind(event_type)
        .bind(delta)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_active_tenants(&self, limit: i64, offset: i64) -> StoreResult<Vec<Tenant>> {
        let rows = sqlx::query("SELECT * FROM tenants WHERE status = 'ACTIVE' ORDER BY id LIMIT $1 OFFSET $2")
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_tenant).collect()
    }

    pub async fn events_for_tenant_range(
        &self,
        tenant_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<UsageEvent>> {
        self.list_events(Some(tenant_id), None, Some(start), Some(end), 1_000_000).await
    }

    // ------------------------------------------------------------------
    // Invoice Builder (C7)
    // ------------------------------------------------------------------

    pub async fn load_snapshots(
        &self,
        tenant_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> StoreResult<Vec<UsageSnapshot>> {
        let rows = sqlx::query("SELECT * FROM usage_snapshots WHERE tenant_id = $1 AND date >= $2 AND date < $3")
            .bind(tenant_id)
            .bind(period_start.date_naive())
            .bind(period_end.date_naive())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_snapshot).collect()
    }

    pub async fn load_pricing_tiers(
        &self,
        organization_id: Uuid,
        event_type: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> StoreResult<Vec<PricingTier>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM pricing_tiers
            WHERE organization_id = $1 AND event_type = $2
              AND effective_from < $4
              AND (effective_to IS NULL OR effective_to > $3)
            ORDER BY tier_level ASC
            "#,
        )
        .bind(organization_id)
        .bind(event_type)
        .bind(period_start)
        .bind(period_end)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_pricing_tier).collect()
    }

    /// Already-billed quantity per event type in the range. Snapshots
    /// roll up *all* usage for a day regardless of billing status, so the
    /// invoice builder subtracts this from the snapshot total to stay
    /// correct when a period is rebuilt after a partial or full bill.
    pub async fn billed_quantity_by_type(
        &self,
        tenant_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> StoreResult<HashMap<String, Decimal>> {
        let rows = sqlx::query(
            "SELECT event_type, COALESCE(SUM(quantity), 0) AS total FROM usage_events \
             WHERE tenant_id = $1 AND timestamp >= $2 AND timestamp < $3 AND invoice_id IS NOT NULL \
             GROUP BY event_type",
        )
        .bind(tenant_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_all(&self.pool)
        .await?;
        let mut out = HashMap::new();
        for row in rows {
            let event_type: String = row.try_get("event_type")?;
            let total: Decimal = row.try_get("total")?;
            out.insert(event_type, total);
        }
        Ok(out)
    }

    /// `count+1` against the unique `invoice_number` index; the caller
    /// retries on a unique-violation collision.
    pub async fn next_invoice_number(&self, organization_id: Uuid, org_slug: &str) -> StoreResult<String> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM invoices WHERE organization_id = $1")
            .bind(organization_id)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("n")?;
        Ok(format!("INV-{}-{:06}", org_slug.to_uppercase(), count + 1))
    }

    /// Invoice + line items + event back-links, one transaction. The
    /// `invoice_id IS NULL` filter on the `UPDATE` is the serialization
    /// point that keeps a tenant's events from being billed twice, not
    /// an advisory lock.
    pub async fn commit_invoice(&self, invoice: &Invoice) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO invoices
                (id, tenant_id, organization_id, invoice_number, period_start, period_end,
                 status, subtotal, tax, total, due_date, paid_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(invoice.id)
        .bind(invoice.tenant_id)
        .bind(invoice.organization_id)
        .bind(&invoice.invoice_number)
        .bind(invoice.period_start)
        .bind(invoice.period_end)
        .bind(invoice.status.to_string())
        .bind(invoice.subtotal)
        .bind(invoice.tax)
        .bind(invoice.total)
        .bind(invoice.due_date)
        .bind(invoice.paid_at)
        .bind(invoice.created_at)
        .execute(&mut *tx)
        .await?;

        for item in &invoice.line_items {
            let breakdown = serde_json::to_value(&item.breakdown).expect("TierBreakdown always serializes");
            sqlx::query(
                r#"
                INSERT INTO invoice_line_items
                    (id, invoice_id, event_type, quantity, unit_price, total_price, breakdown)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(item.id)
            .bind(item.invoice_id)
            .bind(&item.event_type)
            .bind(item.quantity)
            .bind(item.unit_price)
            .bind(item.total_price)
            .bind(breakdown)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            UPDATE usage_events
            SET invoice_id = $1, billed_at = $2
            WHERE tenant_id = $3 AND timestamp >= $4 AND timestamp < $5 AND invoice_id IS NULL
            "#,
        )
        .bind(invoice.id)
        .bind(invoice.created_at)
        .bind(invoice.tenant_id)
        .bind(invoice.period_start)
        .bind(invoice.period_end)
        .execute(&mut *tx)
        .await?;

        tx.commit().await
    }

    /// True for a unique-constraint violation, the expected shape of an
    /// invoice-number collision under concurrent builds (§9).
    pub fn is_unique_violation(err: &sqlx::Error) -> bool {
        matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
    }

    pub async fn get_invoice(&self, invoice_id: Uuid) -> StoreResult<Option<Invoice>> {
        let row = sqlx::query("SELECT * FROM invoices WHERE id = $1")
            .bind(invoice_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let mut invoice = row_to_invoice(row)?;
        let item_rows = sqlx::query("SELECT * FROM invoice_line_items WHERE invoice_id = $1")
            .bind(invoice_id)
            .fetch_all(&self.pool)
            .await?;
        invoice.line_items = item_rows.into_iter().map(row_to_line_item).collect::<StoreResult<_>>()?;
        Ok(Some(invoice))
    }

    // ------------------------------------------------------------------
    // Credential Validator (C1)
    // ------------------------------------------------------------------

    pub async fn get_api_key_by_hash(&self, key_hash: &str) -> StoreResult<Option<ApiKey>> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE key_hash = $1")
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_api_key).transpose()
    }

    /// Best-effort; the caller must not fail the request if this fails.
    pub async fn touch_api_key_last_used(&self, key_id: Uuid, now: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = $1 WHERE id = $2")
            .bind(now)
            .bind(key_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn create_api_key(
        &self,
        organization_id: Uuid,
        key_hash: &str,
        key_prefix: &str,
        permissions: &[Permission],
    ) -> StoreResult<ApiKey> {
        let now = Utc::now();
        let perm_strs: Vec<&str> = permissions.iter().map(|p| p.as_str()).collect();
        let row = sqlx::query(
            r#"
            INSERT INTO api_keys (id, organization_id, key_hash, key_prefix, permissions, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(organization_id)
        .bind(key_hash)
        .bind(key_prefix)
        .bind(&perm_strs)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        row_to_api_key(row)
    }

    // ------------------------------------------------------------------
    // Admission Controller (C2)
    // ------------------------------------------------------------------

    pub async fn get_rate_limit_policy(&self, organization_id: Uuid) -> StoreResult<Option<RateLimitPolicy>> {
        let row = sqlx::query("SELECT * FROM rate_limit_policies WHERE organization_id = $1")
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok::<_, sqlx::Error>(RateLimitPolicy {
                requests_per_second: r.try_get::<Option<i32>, _>("requests_per_second")?.map(|v| v as u32),
                requests_per_minute: r.try_get::<Option<i32>, _>("requests_per_minute")?.map(|v| v as u32),
                requests_per_hour: r.try_get::<Option<i32>, _>("requests_per_hour")?.map(|v| v as u32),
            })
        })
        .transpose()
    }

    // ------------------------------------------------------------------
    // PSP webhook (§6.3)
    // ------------------------------------------------------------------

    pub async fn set_subscription_status(
        &self,
        organization_id: Uuid,
        status: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (organization_id, status, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (organization_id) DO UPDATE SET status = EXCLUDED.status, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(organization_id)
        .bind(status.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_organization(&self, organization_id: Uuid) -> StoreResult<Option<Organization>> {
        let row = sqlx::query("SELECT * FROM organizations WHERE id = $1")
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_organization).transpose()
    }

    pub async fn create_organization(&self, slug: &str, name: &str) -> StoreResult<Organization> {
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO organizations (id, slug, name, created_at, updated_at) VALUES ($1, $2, $3, $4, $4) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(slug)
        .bind(name)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        row_to_organization(row)
    }
}

fn row_to_organization(row: PgRow) -> StoreResult<Organization> {
    Ok(Organization {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_tenant(row: PgRow) -> StoreResult<Tenant> {
    let status_str: String = row.try_get("status")?;
    Ok(Tenant {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        external_id: row.try_get("external_id")?,
        name: row.try_get("name")?,
        status: TenantStatus::from_str(&status_str).unwrap_or(TenantStatus::Active),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_event(row: PgRow) -> StoreResult<UsageEvent> {
    Ok(UsageEvent {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        organization_id: row.try_get("organization_id")?,
        event_type: row.try_get("event_type")?,
        quantity: row.try_get("quantity")?,
        metadata: row.try_get("metadata")?,
        timestamp: row.try_get("timestamp")?,
        idempotency_key: row.try_get("idempotency_key")?,
        invoice_id: row.try_get("invoice_id")?,
        billed_at: row.try_get("billed_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_snapshot(row: PgRow) -> StoreResult<UsageSnapshot> {
    Ok(UsageSnapshot {
        tenant_id: row.try_get("tenant_id")?,
        date: row.try_get("date")?,
        event_type: row.try_get("event_type")?,
        quantity: row.try_get("quantity")?,
    })
}

fn row_to_quota_limit(row: PgRow) -> StoreResult<QuotaLimit> {
    let mode_str: String = row.try_get("enforcement_mode")?;
    Ok(QuotaLimit {
        tenant_id: row.try_get("tenant_id")?,
        event_type: row.try_get("event_type")?,
        limit_value: row.try_get("limit_value")?,
        soft_limit_value: row.try_get("soft_limit_value")?,
        enforcement_mode: EnforcementMode::from_str(&mode_str).unwrap_or(EnforcementMode::Disabled),
        overage_allowed: row.try_get("overage_allowed")?,
        grace_period_end: row.try_get("grace_period_end")?,
        reset_at: row.try_get("reset_at")?,
    })
}

fn row_to_pricing_tier(row: PgRow) -> StoreResult<PricingTier> {
    Ok(PricingTier {
        organization_id: row.try_get("organization_id")?,
        event_type: row.try_get("event_type")?,
        tier_level: row.try_get("tier_level")?,
        min_quantity: row.try_get("min_quantity")?,
        max_quantity: row.try_get("max_quantity")?,
        unit_price: row.try_get("unit_price")?,
        effective_from: row.try_get("effective_from")?,
        effective_to: row.try_get("effective_to")?,
    })
}

fn row_to_invoice(row: PgRow) -> StoreResult<Invoice> {
    let status_str: String = row.try_get("status")?;
    Ok(Invoice {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        organization_id: row.try_get("organization_id")?,
        invoice_number: row.try_get("invoice_number")?,
        period_start: row.try_get("period_start")?,
        period_end: row.try_get("period_end")?,
        status: InvoiceStatus::from_str(&status_str).unwrap_or(InvoiceStatus::Draft),
        subtotal: row.try_get("subtotal")?,
        tax: row.try_get("tax")?,
        total: row.try_get("total")?,
        due_date: row.try_get("due_date")?,
        paid_at: row.try_get("paid_at")?,
        created_at: row.try_get("created_at")?,
        line_items: Vec::new(),
    })
}

fn row_to_line_item(row: PgRow) -> StoreResult<InvoiceLineItem> {
    let breakdown: serde_json::Value = row.try_get("breakdown")?;
    Ok(InvoiceLineItem {
        id: row.try_get("id")?,
        invoice_id: row.try_get("invoice_id")?,
        event_type: row.try_get("event_type")?,
        quantity: row.try_get("quantity")?,
        unit_price: row.try_get("unit_price")?,
        total_price: row.try_get("total_price")?,
        breakdown: serde_json::from_value(breakdown).unwrap_or_default(),
    })
}

fn row_to_api_key(row: PgRow) -> StoreResult<ApiKey> {
    let perms: Vec<String> = row.try_get("permissions")?;
    Ok(ApiKey {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        key_hash: row.try_get("key_hash")?,
        key_prefix: row.try_get("key_prefix")?,
        permissions: perms.iter().filter_map(|p| Permission::parse(p)).collect(),
        expires_at: row.try_get("expires_at")?,
        revoked_at: row.try_get("revoked_at")?,
        last_used_at: row.try_get("last_used_at")?,
        created_at: row.try_get("created_at")?,
    })
}
