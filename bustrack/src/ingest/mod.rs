//! Location report validation and recording.
//!
//! This is the engine's only write path for telemetry. A report is validated
//! up front, then appended to its trip under the trip's lock, where the stop
//! pointer advances and anomaly checks run against the new state. Anomaly
//! recording, cache invalidation and counters happen after the lock is
//! released so a slow consumer never stalls the next report.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::anomaly::{AnomalyDetector, AnomalyLog};
use crate::error::TrackError;
use crate::geo::{self, Coordinate};
use crate::model::{Anomaly, LineSnapshot, LocationUpdate, TripId, TripState};
use crate::registry::{LineRegistry, SegmentRepository};
use crate::telemetry::EngineMetrics;
use crate::trip::TripStore;
use crate::viz::VisualizationCache;

/// Validation limits for incoming reports.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Reports with a timestamp further in the future than this are rejected.
    pub max_clock_skew: Duration,
    /// Reports with worse (larger) GPS accuracy are rejected.
    pub max_accuracy_m: f64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_clock_skew: Duration::from_secs(5 * 60),
            max_accuracy_m: 200.0,
        }
    }
}

/// One raw GPS report as received from a device.
#[derive(Debug, Clone)]
pub struct LocationReport {
    pub trip_id: TripId,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: f64,
    pub speed_kmh: Option<f64>,
    pub heading_deg: Option<f64>,
}

/// Outcome of an accepted report.
#[derive(Debug, Clone)]
pub struct RecordResult {
    pub update: LocationUpdate,
    /// Stop pointer after this update.
    pub stop_pointer: usize,
    /// Whether this update advanced the stop pointer.
    pub advanced: bool,
    /// Whether this update completed the trip at the terminus.
    pub completed: bool,
    pub anomalies: Vec<Anomaly>,
}

/// Validates and records location reports against active trips.
pub struct LocationIngestor {
    store: Arc<TripStore>,
    lines: Arc<dyn LineRegistry>,
    segments: Arc<dyn SegmentRepository>,
    detector: AnomalyDetector,
    log: Arc<AnomalyLog>,
    viz: Arc<VisualizationCache>,
    metrics: Arc<EngineMetrics>,
    config: IngestConfig,
}

impl LocationIngestor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<TripStore>,
        lines: Arc<dyn LineRegistry>,
        segments: Arc<dyn SegmentRepository>,
        detector: AnomalyDetector,
        log: Arc<AnomalyLog>,
        viz: Arc<VisualizationCache>,
        metrics: Arc<EngineMetrics>,
        config: IngestConfig,
    ) -> Self {
        Self {
            store,
            lines,
            segments,
            detector,
            log,
            viz,
            metrics,
            config,
        }
    }

    /// Validate and record one report.
    pub fn record(&self, report: LocationReport) -> Result<RecordResult, TrackError> {
        self.record_at(report, Utc::now())
    }

    pub fn record_at(
        &self,
        report: LocationReport,
        now: DateTime<Utc>,
    ) -> Result<RecordResult, TrackError> {
        let result = self.record_inner(report, now);
        match &result {
            Ok(_) => self.metrics.update_accepted(),
            Err(_) => self.metrics.update_rejected(),
        }
        result
    }

    fn record_inner(
        &self,
        report: LocationReport,
        now: DateTime<Utc>,
    ) -> Result<RecordResult, TrackError> {
        let position = Coordinate::new(report.latitude, report.longitude)?;
        self.validate(&report, now)?;

        // Line lookup happens before taking the trip lock.
        let line_id = self.store.snapshot(&report.trip_id)?.line_id;
        let line = self
            .lines
            .line(&line_id)
            .ok_or_else(|| TrackError::NotFound(format!("line {} not found", line_id)))?;

        let trip_id = report.trip_id.clone();
        let (result, completed_line) = self.store.with_active_mut(&trip_id, |trip| {
            if let Some(last) = trip.last_update() {
                if report.timestamp < last.timestamp {
                    return Err(TrackError::Validation(format!(
                        "report for trip {} at {} is older than last update at {}",
                        trip_id, report.timestamp, last.timestamp
                    )));
                }
            }

            let update = LocationUpdate {
                trip_id: trip_id.clone(),
                timestamp: report.timestamp,
                latitude: report.latitude,
                longitude: report.longitude,
                accuracy_m: report.accuracy_m,
                speed_kmh: report.speed_kmh,
                heading_deg: report.heading_deg,
            };

            let previous = trip.last_update().cloned();
            let mut streak = trip.deviation_streak;
            let anomalies = self.detector.inspect(
                previous.as_ref(),
                &update,
                &line,
                self.segments.as_ref(),
                &mut streak,
            );
            trip.deviation_streak = streak;

            trip.append(update.clone());

            let advanced = advance_pointer(trip, position, &line);
            let at_terminus = trip.stop_pointer == line.stops().len() - 1
                && geo::distance_km(position, line.terminus().coordinate) * 1000.0
                    <= ARRIVAL_RADIUS_M;
            let completed = if at_terminus {
                trip.finish(TripState::Completed, now);
                true
            } else {
                false
            };

            Ok((
                RecordResult {
                    update,
                    stop_pointer: trip.stop_pointer,
                    advanced,
                    completed,
                    anomalies,
                },
                completed.then(|| trip.line_id.clone()),
            ))
        })?;

        // Post-lock bookkeeping.
        for anomaly in &result.anomalies {
            warn!(
                trip = %anomaly.trip_id,
                kind = anomaly.kind.name(),
                severity = ?anomaly.severity,
                "anomaly detected"
            );
            self.log.record(anomaly.clone());
        }
        self.metrics.anomalies_flagged(result.anomalies.len() as u64);
        self.viz.invalidate(&line_id);

        if let Some(line_id) = completed_line {
            info!(trip = %result.update.trip_id, line = %line_id, "trip completed at terminus");
            self.metrics.trip_completed();
        } else {
            debug!(
                trip = %result.update.trip_id,
                pointer = result.stop_pointer,
                advanced = result.advanced,
                "location recorded"
            );
        }

        Ok(result)
    }

    fn validate(&self, report: &LocationReport, now: DateTime<Utc>) -> Result<(), TrackError> {
        if !report.accuracy_m.is_finite() || report.accuracy_m <= 0.0 {
            return Err(TrackError::Validation(format!(
                "accuracy must be positive, got {}",
                report.accuracy_m
            )));
        }
        if report.accuracy_m > self.config.max_accuracy_m {
            return Err(TrackError::Validation(format!(
                "accuracy {}m exceeds limit of {}m",
                report.accuracy_m, self.config.max_accuracy_m
            )));
        }
        let skew = chrono::Duration::from_std(self.config.max_clock_skew)
            .unwrap_or_else(|_| chrono::Duration::zero());
        if report.timestamp > now + skew {
            return Err(TrackError::Validation(format!(
                "timestamp {} is too far in the future",
                report.timestamp
            )));
        }
        if let Some(speed) = report.speed_kmh {
            if !speed.is_finite() || speed < 0.0 {
                return Err(TrackError::Validation(format!(
                    "reported speed must be non-negative, got {speed}"
                )));
            }
        }
        if let Some(heading) = report.heading_deg {
            if !heading.is_finite() || !(0.0..360.0).contains(&heading) {
                return Err(TrackError::Validation(format!(
                    "heading must be in [0, 360), got {heading}"
                )));
            }
        }
        Ok(())
    }
}

/// Distance within which a bus counts as having reached a stop.
const ARRIVAL_RADIUS_M: f64 = 75.0;

/// Advance the stop pointer one step when the bus is now closer to the next
/// stop than to its current target. The pointer never moves backwards.
fn advance_pointer(
    trip: &mut crate::trip::TripRecord,
    position: Coordinate,
    line: &LineSnapshot,
) -> bool {
    let stops = line.stops();
    if trip.stop_pointer + 1 >= stops.len() {
        return false;
    }
    let current = &stops[trip.stop_pointer];
    let next = &stops[trip.stop_pointer + 1];
    let to_current = geo::distance_km(position, current.coordinate);
    let to_next = geo::distance_km(position, next.coordinate);
    if to_next < to_current {
        trip.stop_pointer += 1;
        true
    } else {
        false
    }
}
