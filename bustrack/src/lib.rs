//! Bustrack - Real-time bus tracking and arrival estimation
//!
//! This library turns raw, noisy GPS reports from drivers into trustworthy
//! trip state, per-stop arrival estimates, and anomaly signals. The engine
//! covers ingestion and validation of location reports, the trip lifecycle
//! state machine, speed/route-deviation anomaly detection, route and ETA
//! estimation, and a short-TTL visualization cache that bounds the cost of
//! repeated map-refresh polling.
//!
//! Entity ownership (buses, drivers, lines) lives with external collaborators;
//! the engine consumes immutable snapshots through the [`registry`] traits.

pub mod anomaly;
pub mod api;
pub mod app;
pub mod arrivals;
pub mod error;
pub mod geo;
pub mod ingest;
pub mod model;
pub mod registry;
pub mod route;
pub mod sweep;
pub mod telemetry;
pub mod trip;
pub mod viz;

/// Library version, sourced from Cargo metadata.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
