//! Provider failover: availability tracking, rotation, recovery probes, and
//! the periodic health checker.
//!
//! [`FailoverManager`] owns the provider table and is the only writer of
//! provider state; the [`HealthChecker`] consumes read-only snapshots and
//! reports probe outcomes back through a single
//! [`FailoverManager::apply_probe_result`] entry point, which keeps the
//! natural checker/manager cycle broken.

mod health;
mod manager;

pub use {
    health::HealthChecker,
    manager::{
        FailoverConfig, FailoverError, FailoverManager, FailoverStatus, ForceSwitchOutcome,
        ProbeTarget, ProviderStatus,
    },
};
