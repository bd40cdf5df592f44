//! Stack orchestration module.
//!
//! Provides dependency-ordered start and stop of stacks on the cluster and
//! the reconciler that turns cluster events into stack service status.

pub mod reconciler;
pub mod stack;


pub use reconciler::{EventReconciler, ReconcilerHandle};
pub use stack::StackOrchestrator;
