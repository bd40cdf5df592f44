//! Strata daemon library
//!
//! Stack lifecycle orchestration, event reconciliation and account
//! provisioning on top of `strata-core`. The `stratad` binary wires these
//! together; an API layer drives them through the same types.

pub mod accounts;
pub mod orchestrator;
pub mod reconcile;
pub mod shutdown;

pub use accounts::AccountManager;
pub use orchestrator::{EventReconciler, ReconcilerHandle, StackOrchestrator};
pub use reconcile::{ReconcileReport, StateReconciler};
