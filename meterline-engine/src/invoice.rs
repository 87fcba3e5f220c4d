//! Invoice Builder (C7).
//!
//! Aggregates a period's events (via snapshot, falling back to raw
//! events), walks ordered tiered pricing per event type, and commits the
//! invoice with its line items and event back-links in one transaction
//! (§4.7). Grounded on the `calculate_billing`/`generate_invoice`
//! two-step shape of `aerolithdb_saas::billing::BillingEngine`, with the
//! tier walk itself built directly from the spec since the teacher bills
//! flat per-plan fees rather than tiered usage curves.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use meterline_core::config::BillingConfig;
use meterline_core::errors::InvoiceError;
use meterline_core::types::{Invoice, InvoiceLineItem, InvoiceStatus, PricingTier, TierBreakdown};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::store::Store;

pub struct InvoiceBuilder {
    store: Store,
    config: BillingConfig,
}

impl InvoiceBuilder {
    pub fn new(store: Store, config: BillingConfig) -> Self {
        Self { store, config }
    }

    pub async fn build(
        &self,
        tenant_id: Uuid,
        organization_id: Uuid,
        org_slug: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Invoice, InvoiceError> {
        // Step 1: aggregate quantities by event type, snapshot-first.
        let quantities = self.aggregate_quantities(tenant_id, period_start, period_end).await;

        let mut line_items = Vec::new();
        for (event_type, quantity) in &quantities {
            if *quantity <= Decimal::ZERO {
                continue;
            }
            let tiers = self
                .store
                .load_pricing_tiers(organization_id, event_type, period_start, period_end)
                .await
                .unwrap_or_default();
            line_items.push(price_event_type(event_type, *quantity, &tiers));
        }

        let subtotal: i64 = line_items.iter().map(|i| i.total_price).sum();
        let tax = apply_rate(subtotal, self.config.tax_rate);
        let total = subtotal + tax;
        let now = Utc::now();

        // Step 5 retry loop: `next_invoice_number` counts existing rows,
        // so a concurrent build for the same organization can race us to
        // the same number. Re-derive and retry on that specific
        // collision, bounded per §9.
        for attempt in 0..self.config.invoice_number_max_retries {
            let invoice_number = self
                .store
                .next_invoice_number(organization_id, org_slug)
                .await
                .map_err(|_| InvoiceError::NumberGenerationExhausted { attempts: attempt + 1 })?;

            let mut invoice = Invoice {
                id: Uuid::new_v4(),
                tenant_id,
                organization_id,
                invoice_number,
                period_start,
                period_end,
                status: InvoiceStatus::Draft,
                subtotal,
                tax,
                total,
                due_date: period_end + Duration::days(self.config.invoice_due_days),
                paid_at: None,
                created_at: now,
                line_items: Vec::new(),
            };
            for item in &mut line_items {
                item.invoice_id = invoice.id;
            }
            invoice.line_items = line_items.clone();

            match self.store.commit_invoice(&invoice).await {
                Ok(()) => return Ok(invoice),
                Err(err) if Store::is_unique_violation(&err) => continue,
                Err(_) => return Err(InvoiceError::DeadlineExceeded),
            }
        }

        Err(InvoiceError::NumberGenerationExhausted { attempts: self.config.invoice_number_max_retries })
    }

    async fn aggregate_quantities(
        &self,
        tenant_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> HashMap<String, Decimal> {
        let mut totals: HashMap<String, Decimal> = HashMap::new();
        let mut snapshotted: HashMap<String, HashSet<NaiveDate>> = HashMap::new();

        if let Ok(snapshots) = self.store.load_snapshots(tenant_id, period_start, period_end).await {
            for snapshot in snapshots {
                *totals.entry(snapshot.event_type.clone()).or_insert(Decimal::ZERO) += snapshot.quantity;
                snapshotted.entry(snapshot.event_type).or_default().insert(snapshot.date);
            }
        }

        // Fall back to raw events for whatever day/event-type combination
        // the snapshot job hasn't rolled up yet — today's partial day, or
        // a gap — even when the same event type has snapshot coverage on
        // other days in the period.
        if let Ok(events) = self.store.events_for_tenant_range(tenant_id, period_start, period_end).await {
            for event in &events {
                let covered = snapshotted.get(&event.event_type).is_some_and(|dates| dates.contains(&event.timestamp.date_naive()));
                if !covered {
                    *totals.entry(event.event_type.clone()).or_insert(Decimal::ZERO) += event.quantity;
                }
            }
        }

        // Snapshots roll up all usage for a day regardless of billing
        // status; subtract what a prior invoice already claimed so
        // rebuilding a period doesn't double-bill (§4.7 correctness
        // invariant).
        if let Ok(billed) = self.store.billed_quantity_by_type(tenant_id, period_start, period_end).await {
            for (event_type, billed_qty) in billed {
                if let Some(total) = totals.get_mut(&event_type) {
                    *total = (*total - billed_qty).max(Decimal::ZERO);
                }
            }
        }

        totals
    }

}

/// Walks the ordered tier list for one event type, per §4.7 step 3.
fn price_event_type(event_type: &str, quantity: Decimal, tiers: &[PricingTier]) -> InvoiceLineItem {
    let mut processed = Decimal::ZERO;
    let mut total: i64 = 0;
    let mut breakdown = Vec::new();

    for tier in tiers {
        if processed >= quantity {
            break;
        }
        let max_q = tier.max_quantity.unwrap_or(Decimal::MAX);
        let consumed = (quantity.min(max_q) - processed.max(tier.min_quantity)).max(Decimal::ZERO);
        if consumed <= Decimal::ZERO {
            continue;
        }
        let subtotal_minor = to_minor_units(consumed * tier.unit_price);
        total += subtotal_minor;
        breakdown.push(TierBreakdown {
            tier_level: tier.tier_level,
            consumed,
            unit_price: tier.unit_price,
            subtotal: consumed * tier.unit_price,
        });
        processed += consumed;
    }

    if breakdown.is_empty() {
        // Pricing misconfiguration: no tier starts at 0. Fall back to the
        // first tier's unit price for the whole quantity, or free if
        // there is no pricing at all configured for this event type.
        let unit_price = tiers.first().map(|t| t.unit_price).unwrap_or(Decimal::ZERO);
        let subtotal_minor = to_minor_units(quantity * unit_price);
        total = subtotal_minor;
        breakdown.push(TierBreakdown { tier_level: 0, consumed: quantity, unit_price, subtotal: quantity * unit_price });
    }

    let unit_price = if quantity.is_zero() { Decimal::ZERO } else { Decimal::from(total) / quantity / Decimal::ONE_HUNDRED };

    InvoiceLineItem {
        id: Uuid::new_v4(),
        invoice_id: Uuid::nil(),
        event_type: event_type.to_string(),
        quantity,
        unit_price,
        total_price: total,
        breakdown,
    }
}

/// Minor currency units, rounded to the nearest cent.
fn to_minor_units(amount: Decimal) -> i64 {
    (amount * Decimal::ONE_HUNDRED).round().try_into().unwrap_or(i64::MAX)
}

fn apply_rate(minor_units: i64, rate: Decimal) -> i64 {
    to_minor_units(Decimal::from(minor_units) / Decimal::ONE_HUNDRED * rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(level: i32, min: i64, max: Option<i64>, price: &str) -> PricingTier {
        PricingTier {
            organization_id: Uuid::nil(),
            event_type: "api_request".into(),
            tier_level: level,
            min_quantity: Decimal::from(min),
            max_quantity: max.map(Decimal::from),
            unit_price: price.parse().unwrap(),
            effective_from: Utc::now(),
            effective_to: None,
        }
    }

    #[test]
    fn two_tier_curve_bills_correctly() {
        let tiers = vec![tier(1, 0, Some(1000), "0.10"), tier(2, 1000, None, "0.05")];
        let item = price_event_type("api_request", Decimal::from(1500), &tiers);
        assert_eq!(item.total_price, 12_500); // $125.00 in cents
        assert_eq!(item.breakdown.len(), 2);
        assert_eq!(item.breakdown[0].consumed, Decimal::from(1000));
        assert_eq!(item.breakdown[1].consumed, Decimal::from(500));
    }

    #[test]
    fn single_unbounded_tier_bills_all_quantity() {
        let tiers = vec![tier(1, 0, None, "0.02")];
        let item = price_event_type("api_request", Decimal::from(250), &tiers);
        assert_eq!(item.total_price, 500); // $5.00
    }

    #[test]
    fn misconfigured_tiers_fall_back_to_first_unit_price() {
        let tiers = vec![tier(1, 100, None, "0.25")];
        let item = price_event_type("api_request", Decimal::from(40), &tiers);
        assert_eq!(item.total_price, 1000); // 40 * 0.25 = $10.00
        assert_eq!(item.breakdown.len(), 1);
    }

    #[test]
    fn tax_applies_configured_rate() {
        assert_eq!(apply_rate(12_500, "0.10".parse().unwrap()), 1_250);
    }
}
