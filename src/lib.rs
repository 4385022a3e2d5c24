//! Prometheus-compatible anomaly-corridor gateway.
//!
//! Sits between a dashboarding frontend and upstream time-series backends
//! exposed through Grafana. For each queried series it derives a corridor
//! (upper/lower envelope) from a historical window using a linear trend plus
//! a discrete Fourier model, persists the corridor in a multi-tier cache,
//! and re-emits the original series together with the corridor and a set of
//! anomaly-intensity series.

pub mod anomaly;
pub mod autotune;
pub mod cache;
pub mod config;
pub mod corridor;
pub mod error;
pub mod format;
pub mod fourier;
pub mod grafana;
pub mod metrics;
pub mod pipeline;
pub mod router;
pub mod series;
pub mod trend;
