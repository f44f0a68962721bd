//! HustleXP money engine
//!
//! The orchestration layer between the HTTP surface and the ledger: task,
//! escrow, and proof state machines; the two-phase payment saga around the
//! external provider; webhook ingress guards; the durable outbox with its
//! worker pool and recovery sweeps; XP and trust services; and the admin and
//! safety controls.
//!
//! Nothing in this crate is a module-level singleton. Every service is a
//! value constructed in `main` and passed down, so the dependency graph is
//! explicit and testable.

pub mod admin;
pub mod alerting;
pub mod lock_manager;
pub mod metrics;
pub mod ordering_gate;
pub mod outbox;
pub mod recovery;
pub mod safety;
pub mod saga;
pub mod state_machine;
pub mod stripe;
pub mod tasks;
pub mod trust;
pub mod worker;
pub mod xp;

pub use lock_manager::LockManager;
pub use metrics::CoreMetrics;
pub use ordering_gate::OrderingGate;
pub use saga::{PaymentSaga, SagaAction, SagaRequest};
pub use tasks::TaskService;
