//! nimbus-scaling — the scaling & health engine.
//!
//! Two cooperating periodic loops over the store:
//!
//! * the **reconcile loop** keeps every `active` deployment at its
//!   declared shape — per-region floor, global minimum and maximum,
//!   CPU-driven scaling under a cooldown — and finishes teardown of
//!   `terminating` instances;
//! * the **health loop** probes stale `running` instances and writes
//!   off the ones that stay unreachable, so the next reconcile tick
//!   replaces them.
//!
//! Both loops are idempotent and derive all work from store state, so
//! a restart loses nothing. Errors never kill a loop: log, tick again.

pub mod error;
pub mod health;
pub mod reconcile;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{ScalingError, ScalingResult};
pub use health::{HealthCheckConfig, HealthEngine};
pub use reconcile::{ReconcileConfig, ReconcileEngine};
