//! Double-entry ledger for the HustleXP money core
//!
//! This crate owns the relational schema (including the trigger layer that
//! enforces invariants regardless of application bugs) and the transactional
//! bookkeeping service: deterministic account identity, monotonic ULID
//! ordering, zero-sum entries, and per-account snapshots.

pub mod constitution;
pub mod guard;
pub mod models;
pub mod service;
pub mod snapshot;

pub use models::{
    AccountOwner, AccountType, EntryDirection, EntryInput, LedgerAccount, LedgerEntry,
    LedgerTransaction, TransactionInput, TxStatus,
};
pub use service::LedgerService;

/// A postgres transaction handle as every ledger operation receives it.
pub type PgTx<'t> = sqlx::Transaction<'t, sqlx::Postgres>;
