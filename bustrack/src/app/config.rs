//! Engine configuration.

use std::time::Duration;

use crate::anomaly::AnomalyConfig;
use crate::arrivals::ArrivalsConfig;
use crate::ingest::IngestConfig;
use crate::route::RouteConfig;
use crate::sweep::SweepConfig;
use crate::viz::VizConfig;

/// Tuning for every engine component, with working defaults.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub ingest: IngestConfig,
    pub anomaly: AnomalyConfig,
    pub route: RouteConfig,
    pub arrivals: ArrivalsConfig,
    pub viz: VizConfig,
    pub sweep: SweepConfig,
    /// Budget for one read query before it fails as transient.
    pub read_timeout: ReadTimeout,
}

/// Newtype so the default timeout lives next to the field.
#[derive(Debug, Clone, Copy)]
pub struct ReadTimeout(pub Duration);

impl Default for ReadTimeout {
    fn default() -> Self {
        Self(Duration::from_secs(2))
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_traffic_factor(mut self, factor: f64) -> Self {
        self.route.traffic_factor = factor;
        self
    }

    pub fn with_viz_ttl(mut self, ttl: Duration) -> Self {
        self.viz.ttl = ttl;
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.sweep.inactivity_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep.interval = interval;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = ReadTimeout(timeout);
        self
    }
}
