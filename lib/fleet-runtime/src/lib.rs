//! Controller runtime: keyed, de-duplicating work queues drained by worker pools

pub mod controller;
pub mod key;
pub mod queue;

pub use controller::{Action, ControllerSettings, Reconcile, WorkQueueController};
pub use key::ObjectKey;
pub use queue::{ExponentialBackoff, WorkQueue};
