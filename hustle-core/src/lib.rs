//! Shared foundation for the HustleXP money & trust core
//!
//! This crate carries everything the money-path crates agree on:
//! - the closed error taxonomy with stable code strings
//! - environment-driven configuration
//! - deterministic identifiers (account UUIDs, monotonic ULIDs, idempotency keys)
//! - the SERIALIZABLE transaction runner with jittered retry

pub mod config;
pub mod error;
pub mod ids;
pub mod money;
pub mod retry;

pub use config::{CoreConfig, StripeMode};
pub use error::CoreError;

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;
