//! Domain types, error taxonomy and configuration for the usage metering
//! and tiered-billing service.

pub mod config;
pub mod errors;
pub mod types;

pub use config::Config;
pub use errors::{ApiErrorCode, MeteringError, MeteringResult};
pub use types::*;
