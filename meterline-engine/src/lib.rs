pub mod admission;
pub mod cache;
pub mod credential;
pub mod idempotency;
pub mod ingest;
pub mod invoice;
pub mod quota;
pub mod store;
