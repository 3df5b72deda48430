//! Operational metrics for the gateway.
//!
//! [`MetricsSink`] keeps a sliding-window log of every dispatched request
//! and answers aggregated queries for the status endpoints: success rates,
//! latency, token and cost totals, hourly histograms, and the failover
//! events visible in the log. A background pruner drops records that age
//! out of the configured window.
//!
//! Alongside the queryable log, record calls emit counters through the
//! `metrics` crate facade (see [`names`]) so an exporter can be attached
//! without touching this crate.

pub mod names;
mod sink;

pub use sink::{
    FailoverEvent, MetricsReport, MetricsSink, OverallMetrics, ProviderMetrics, UsageStats,
};

// Re-export the facade macros for callers that emit ad-hoc metrics.
pub use metrics::{counter, gauge, histogram};
