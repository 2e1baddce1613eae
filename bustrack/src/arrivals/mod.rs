//! Stop-centric arrival estimation.
//!
//! Answers "which buses are coming to this stop, and when". Candidates are
//! the active trips of every line serving the stop whose stop pointer has
//! not yet passed it. Each candidate's ETA comes from the route estimator;
//! a candidate whose estimate fails is skipped with a warning rather than
//! failing the whole query.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::warn;

use crate::anomaly::AnomalyLog;
use crate::error::TrackError;
use crate::model::{
    BusId, BusSnapshot, DriverSnapshot, LineId, LineRef, StopId, TripId,
    WaitingPassengerReport,
};
use crate::registry::{BusRegistry, DriverRegistry, LineRegistry};
use crate::route::RouteEstimator;
use crate::trip::TripStore;

/// Reliability scoring inputs.
#[derive(Debug, Clone)]
pub struct ArrivalsConfig {
    /// Anomalies within this trailing window count against reliability.
    pub anomaly_window: Duration,
    /// Points deducted per recent anomaly.
    pub anomaly_penalty: f64,
    /// Waiting-passenger reports older than this are ignored.
    pub waiting_window: Duration,
}

impl Default for ArrivalsConfig {
    fn default() -> Self {
        Self {
            anomaly_window: Duration::from_secs(30 * 60),
            anomaly_penalty: 10.0,
            waiting_window: Duration::from_secs(30 * 60),
        }
    }
}

/// Bus position relative to the queried stop.
#[derive(Debug, Clone, Serialize)]
pub struct ApproachingLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub distance_to_stop_km: f64,
}

/// One bus expected at the stop.
#[derive(Debug, Clone, Serialize)]
pub struct ArrivalEstimate {
    pub trip_id: TripId,
    pub bus: Option<BusSnapshot>,
    pub driver: Option<DriverSnapshot>,
    pub line: LineRef,
    pub current_location: ApproachingLocation,
    pub eta: DateTime<Utc>,
    pub eta_minutes: f64,
    /// Score in [0, 100] from driver rating minus recent anomalies.
    pub reliability: f64,
    pub last_update: Option<DateTime<Utc>>,
    /// Passengers reported waiting at the stop recently.
    pub waiting_passengers: u32,
}

/// Recent crowd-sourced waiting counts per stop.
#[derive(Default)]
pub struct WaitingReports {
    by_stop: DashMap<StopId, Vec<WaitingPassengerReport>>,
}

impl WaitingReports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, report: WaitingPassengerReport) {
        self.by_stop
            .entry(report.stop_id.clone())
            .or_default()
            .push(report);
    }

    /// Count from the most recent report within the window, or zero.
    pub fn recent_count(&self, stop_id: &StopId, window: Duration, now: DateTime<Utc>) -> u32 {
        let cutoff =
            now - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
        self.by_stop
            .get(stop_id)
            .and_then(|reports| {
                reports
                    .iter()
                    .filter(|r| r.reported_at >= cutoff)
                    .max_by_key(|r| r.reported_at)
                    .map(|r| r.count)
            })
            .unwrap_or(0)
    }
}

/// Computes arrival estimates for one stop.
pub struct ArrivalEstimationService {
    store: Arc<TripStore>,
    lines: Arc<dyn LineRegistry>,
    buses: Arc<dyn BusRegistry>,
    drivers: Arc<dyn DriverRegistry>,
    estimator: Arc<RouteEstimator>,
    log: Arc<AnomalyLog>,
    waiting: Arc<WaitingReports>,
    config: ArrivalsConfig,
}

impl ArrivalEstimationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<TripStore>,
        lines: Arc<dyn LineRegistry>,
        buses: Arc<dyn BusRegistry>,
        drivers: Arc<dyn DriverRegistry>,
        estimator: Arc<RouteEstimator>,
        log: Arc<AnomalyLog>,
        waiting: Arc<WaitingReports>,
        config: ArrivalsConfig,
    ) -> Self {
        Self {
            store,
            lines,
            buses,
            drivers,
            estimator,
            log,
            waiting,
            config,
        }
    }

    /// All buses currently expected at the stop, soonest first, optionally
    /// limited to one line.
    pub fn arrivals_at(
        &self,
        stop_id: &StopId,
        line_filter: Option<&LineId>,
    ) -> Result<Vec<ArrivalEstimate>, TrackError> {
        self.arrivals_at_time(stop_id, line_filter, Utc::now())
    }

    pub fn arrivals_at_time(
        &self,
        stop_id: &StopId,
        line_filter: Option<&LineId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ArrivalEstimate>, TrackError> {
        let mut lines = self.lines.lines_containing_stop(stop_id);
        if lines.is_empty() {
            return Err(TrackError::NotFound(format!(
                "no line serves stop {}",
                stop_id
            )));
        }
        if let Some(filter) = line_filter {
            lines.retain(|line| &line.id == filter);
        }

        let waiting = self
            .waiting
            .recent_count(stop_id, self.config.waiting_window, now);

        let mut estimates = Vec::new();
        for line in &lines {
            let Some(stop_index) = line.position_of(stop_id) else {
                continue;
            };
            for trip in self.store.active_on_line(&line.id) {
                // A bus that has already passed the stop is not coming back.
                if trip.stop_pointer > stop_index {
                    continue;
                }
                let estimate =
                    match self.estimator.estimate_snapshot(&trip, Some(stop_id), now) {
                        Ok(e) => e,
                        Err(err) => {
                            warn!(
                                trip = %trip.id,
                                stop = %stop_id,
                                error = %err,
                                "skipping trip with failing estimate"
                            );
                            continue;
                        }
                    };

                let Some(target) = estimate
                    .remaining_stops
                    .iter()
                    .find(|s| &s.stop_id == stop_id)
                else {
                    continue;
                };

                let driver = self.drivers.driver(&trip.driver_id);
                let recent = self
                    .log
                    .recent_count(&trip.id, self.config.anomaly_window, now);
                let reliability = self.reliability(driver.as_ref(), recent);

                estimates.push(ArrivalEstimate {
                    trip_id: trip.id.clone(),
                    bus: self.buses.bus(&trip.bus_id),
                    driver,
                    line: LineRef::from(line),
                    current_location: ApproachingLocation {
                        latitude: estimate.current_location.latitude,
                        longitude: estimate.current_location.longitude,
                        distance_to_stop_km: target.distance_km,
                    },
                    eta: target.eta,
                    eta_minutes: (target.eta - now).num_seconds() as f64 / 60.0,
                    reliability,
                    last_update: trip.last_update.as_ref().map(|u| u.timestamp),
                    waiting_passengers: waiting,
                });
            }
        }

        estimates.sort_by(|a, b| {
            a.eta.cmp(&b.eta).then(
                a.current_location
                    .distance_to_stop_km
                    .total_cmp(&b.current_location.distance_to_stop_km),
            )
        });
        Ok(estimates)
    }

    /// Record a waiting-passenger report for a stop.
    pub fn report_waiting(&self, report: WaitingPassengerReport) -> Result<(), TrackError> {
        let served = !self.lines.lines_containing_stop(&report.stop_id).is_empty();
        if !served {
            return Err(TrackError::NotFound(format!(
                "no line serves stop {}",
                report.stop_id
            )));
        }
        self.waiting.record(report);
        Ok(())
    }

    fn reliability(&self, driver: Option<&DriverSnapshot>, recent_anomalies: usize) -> f64 {
        let rating = driver.map(|d| d.rating).unwrap_or(2.5);
        let base = rating * 20.0;
        (base - recent_anomalies as f64 * self.config.anomaly_penalty).clamp(0.0, 100.0)
    }
}
