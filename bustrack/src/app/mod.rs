//! Engine assembly.
//!
//! [`Engine`] wires the trip store, ingestor, estimators, caches and the
//! sweeper behind one handle. It is cheap to clone; all components sit
//! behind `Arc`s, so clones share state.

mod config;

pub use config::{EngineConfig, ReadTimeout};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::anomaly::{AnomalyDetector, AnomalyLog};
use crate::arrivals::{ArrivalEstimate, ArrivalEstimationService, WaitingReports};
use crate::error::TrackError;
use crate::ingest::{LocationIngestor, LocationReport, RecordResult};
use crate::model::{
    Anomaly, BusId, DriverId, LineId, StopId, TripId, WaitingPassengerReport,
};
use crate::registry::{BusRegistry, DriverRegistry, LineRegistry, SegmentRepository};
use crate::route::{RouteEstimate, RouteEstimator};
use crate::sweep::InactivitySweeper;
use crate::telemetry::{EngineMetrics, TelemetrySnapshot};
use crate::trip::{TripSnapshot, TripStore};
use crate::viz::{self, LineVisualization, VisualizationCache};

/// External data sources the engine reads from.
#[derive(Clone)]
pub struct Registries {
    pub buses: Arc<dyn BusRegistry>,
    pub drivers: Arc<dyn DriverRegistry>,
    pub lines: Arc<dyn LineRegistry>,
    pub segments: Arc<dyn SegmentRepository>,
}

impl Registries {
    /// Use one object implementing all four registry traits.
    pub fn from_single<R>(registry: Arc<R>) -> Self
    where
        R: BusRegistry + DriverRegistry + LineRegistry + SegmentRepository + 'static,
    {
        Self {
            buses: registry.clone(),
            drivers: registry.clone(),
            lines: registry.clone(),
            segments: registry,
        }
    }
}

/// The assembled tracking engine.
#[derive(Clone)]
pub struct Engine {
    store: Arc<TripStore>,
    registries: Registries,
    log: Arc<AnomalyLog>,
    viz: Arc<VisualizationCache>,
    metrics: Arc<EngineMetrics>,
    ingestor: Arc<LocationIngestor>,
    estimator: Arc<RouteEstimator>,
    arrivals: Arc<ArrivalEstimationService>,
    config: Arc<EngineConfig>,
}

impl Engine {
    pub fn new(config: EngineConfig, registries: Registries) -> Self {
        let store = Arc::new(TripStore::new());
        let log = Arc::new(AnomalyLog::new());
        let viz = Arc::new(VisualizationCache::new(config.viz.clone()));
        let metrics = Arc::new(EngineMetrics::new());
        let waiting = Arc::new(WaitingReports::new());

        let ingestor = Arc::new(LocationIngestor::new(
            Arc::clone(&store),
            Arc::clone(&registries.lines),
            Arc::clone(&registries.segments),
            AnomalyDetector::new(config.anomaly.clone()),
            Arc::clone(&log),
            Arc::clone(&viz),
            Arc::clone(&metrics),
            config.ingest.clone(),
        ));
        let estimator = Arc::new(RouteEstimator::new(
            Arc::clone(&store),
            Arc::clone(&registries.lines),
            Arc::clone(&registries.buses),
            Arc::clone(&registries.segments),
            config.route.clone(),
        ));
        let arrivals = Arc::new(ArrivalEstimationService::new(
            Arc::clone(&store),
            Arc::clone(&registries.lines),
            Arc::clone(&registries.buses),
            Arc::clone(&registries.drivers),
            Arc::clone(&estimator),
            Arc::clone(&log),
            waiting,
            config.arrivals.clone(),
        ));

        Self {
            store,
            registries,
            log,
            viz,
            metrics,
            ingestor,
            estimator,
            arrivals,
            config: Arc::new(config),
        }
    }

    /// Register a trip, validating that the referenced line, bus and driver
    /// all exist.
    pub fn create_trip(
        &self,
        trip_id: TripId,
        line_id: LineId,
        bus_id: BusId,
        driver_id: DriverId,
    ) -> Result<(), TrackError> {
        if self.registries.lines.line(&line_id).is_none() {
            return Err(TrackError::NotFound(format!("line {} not found", line_id)));
        }
        if self.registries.buses.bus(&bus_id).is_none() {
            return Err(TrackError::NotFound(format!("bus {} not found", bus_id)));
        }
        if self.registries.drivers.driver(&driver_id).is_none() {
            return Err(TrackError::NotFound(format!(
                "driver {} not found",
                driver_id
            )));
        }
        self.store.create(trip_id, line_id, bus_id, driver_id)
    }

    pub fn start_trip(&self, trip_id: &TripId) -> Result<TripSnapshot, TrackError> {
        let snapshot = self.store.start(trip_id)?;
        self.metrics.trip_started();
        info!(trip = %trip_id, line = %snapshot.line_id, "trip started");
        Ok(snapshot)
    }

    pub fn complete_trip(&self, trip_id: &TripId) -> Result<TripSnapshot, TrackError> {
        let snapshot = self.store.complete(trip_id)?;
        self.metrics.trip_completed();
        self.viz.invalidate(&snapshot.line_id);
        info!(trip = %trip_id, "trip completed");
        Ok(snapshot)
    }

    pub fn abort_trip(&self, trip_id: &TripId) -> Result<TripSnapshot, TrackError> {
        let snapshot = self.store.abort_at(trip_id, Utc::now())?;
        self.viz.invalidate(&snapshot.line_id);
        info!(trip = %trip_id, "trip aborted");
        Ok(snapshot)
    }

    /// Validate and record one location report.
    pub fn record_location(&self, report: LocationReport) -> Result<RecordResult, TrackError> {
        self.ingestor.record(report)
    }

    pub fn trip(&self, trip_id: &TripId) -> Result<TripSnapshot, TrackError> {
        self.store.snapshot(trip_id)
    }

    pub fn active_trips(&self) -> Vec<TripSnapshot> {
        self.store.active_snapshots()
    }

    pub fn anomalies(&self, trip_id: &TripId) -> Vec<Anomaly> {
        self.log.for_trip(trip_id)
    }

    pub fn report_waiting(&self, report: WaitingPassengerReport) -> Result<(), TrackError> {
        self.arrivals.report_waiting(report)
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn read_timeout(&self) -> Duration {
        self.config.read_timeout.0
    }

    /// Synchronous route estimate. Prefer the async wrapper in `api` from
    /// request handlers.
    pub fn route_estimate_blocking(
        &self,
        trip_id: &TripId,
    ) -> Result<RouteEstimate, TrackError> {
        self.estimator.estimate(trip_id)
    }

    /// Synchronous arrivals query, optionally limited to one line.
    pub fn arrivals_blocking(
        &self,
        stop_id: &StopId,
        line_id: Option<&LineId>,
    ) -> Result<Vec<ArrivalEstimate>, TrackError> {
        self.arrivals.arrivals_at(stop_id, line_id)
    }

    /// Synchronous visualization lookup, served from cache when possible.
    pub fn visualization_blocking(
        &self,
        line_id: &LineId,
    ) -> Result<Arc<LineVisualization>, TrackError> {
        self.visualization_blocking_at(line_id, Utc::now())
    }

    pub fn visualization_blocking_at(
        &self,
        line_id: &LineId,
        now: DateTime<Utc>,
    ) -> Result<Arc<LineVisualization>, TrackError> {
        if let Some(cached) = self.viz.get(line_id) {
            self.metrics.viz_cache_hit();
            return Ok(cached);
        }
        self.metrics.viz_cache_miss();

        let line = self
            .registries
            .lines
            .line(line_id)
            .ok_or_else(|| TrackError::NotFound(format!("line {} not found", line_id)))?;
        let trips = self.store.active_on_line(line_id);
        let payload = Arc::new(viz::build_visualization(
            &line,
            &trips,
            self.registries.drivers.as_ref(),
            self.registries.segments.as_ref(),
            now,
        ));
        self.viz.put(line_id.clone(), Arc::clone(&payload), None);
        Ok(payload)
    }

    /// Spawn the housekeeping daemon on the current runtime.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let sweeper = InactivitySweeper::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registries.lines),
            Arc::clone(&self.log),
            Arc::clone(&self.viz),
            Arc::clone(&self.metrics),
            self.config.anomaly.clone(),
            self.config.sweep.clone(),
        );
        tokio::spawn(sweeper.run(shutdown))
    }
}
