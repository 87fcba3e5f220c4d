//! Shared application state, grounded on the `AppState`/`RESTAPIv1`
//! shape of `aerolithdb_api::rest`: one `Clone`-able struct wrapping the
//! long-lived service handles, injected into every handler via
//! `State<AppState>`.

use std::sync::Arc;

use meterline_core::config::Config;
use meterline_engine::admission::AdmissionController;
use meterline_engine::cache::Cache;
use meterline_engine::credential::CredentialValidator;
use meterline_engine::idempotency::IdempotencyFilter;
use meterline_engine::ingest::EventRecorder;
use meterline_engine::invoice::InvoiceBuilder;
use meterline_engine::quota::QuotaEngine;
use meterline_engine::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub credentials: Arc<CredentialValidator>,
    pub admission: Arc<AdmissionController>,
    pub recorder: Arc<EventRecorder>,
    pub invoices: Arc<InvoiceBuilder>,
}

impl AppState {
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let store = Store::connect(&config.store_url, config.pipeline.store_statement_timeout()).await?;
        let cache = Cache::connect(&config.cache_url, &config.cache)
            .await
            .unwrap_or_else(|_| Cache::disabled());

        let credentials = Arc::new(CredentialValidator::new(store.clone()));
        let admission = Arc::new(AdmissionController::new(store.clone(), cache.clone()));
        let idempotency = IdempotencyFilter::new(store.clone(), cache.clone(), &config.cache, &config.rate_limit);
        let quota = QuotaEngine::new(store.clone(), cache.clone());
        let recorder = Arc::new(EventRecorder::new(store.clone(), idempotency, quota, &config.quota));
        let invoices = Arc::new(InvoiceBuilder::new(store.clone(), config.billing.clone()));

        Ok(Self { config: Arc::new(config), store, credentials, admission, recorder, invoices })
    }
}
