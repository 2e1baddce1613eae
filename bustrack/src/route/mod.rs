//! Remaining-route and ETA estimation for one active trip.
//!
//! Estimation is pure over a [`TripSnapshot`]: it reads a point-in-time copy
//! of the trip and never touches live trip state, so a slow estimate cannot
//! hold up ingestion.
//!
//! Distances use precomputed segment geometry where the repository has it
//! and fall back to the straight line between stop coordinates where not.
//! The first leg, from the bus's current position to its next stop, is
//! always straight-line.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::TrackError;
use crate::geo::{self, Coordinate};
use crate::model::{LineId, StopId, TripId};
use crate::registry::{BusRegistry, LineRegistry, SegmentRepository};
use crate::trip::{TripSnapshot, TripStore};

/// Bounds applied to the traffic factor before use.
pub const MIN_TRAFFIC_FACTOR: f64 = 0.3;
pub const MAX_TRAFFIC_FACTOR: f64 = 1.5;

/// Estimation tuning.
#[derive(Debug, Clone)]
pub struct RouteConfig {
    /// Multiplier on effective speed; 1.0 is free flow, lower is congested.
    /// Clamped to `[MIN_TRAFFIC_FACTOR, MAX_TRAFFIC_FACTOR]` before use.
    pub traffic_factor: f64,
    /// Speed assumed when the bus registry has no average for the bus.
    pub fallback_speed_kmh: f64,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            traffic_factor: 1.0,
            fallback_speed_kmh: 30.0,
        }
    }
}

impl RouteConfig {
    pub fn effective_factor(&self) -> f64 {
        self.traffic_factor.clamp(MIN_TRAFFIC_FACTOR, MAX_TRAFFIC_FACTOR)
    }
}

/// Where the bus is right now, or where it is assumed to be.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentLocation {
    pub latitude: f64,
    pub longitude: f64,
    /// Timestamp of the update this position came from; `None` when the
    /// position was synthesized from the line's first stop.
    pub reported_at: Option<DateTime<Utc>>,
}

/// One stop still ahead of the bus.
#[derive(Debug, Clone, Serialize)]
pub struct RemainingStop {
    pub stop_id: StopId,
    pub name: String,
    pub ordinal: u32,
    pub latitude: f64,
    pub longitude: f64,
    /// Cumulative travel distance from the current position.
    pub distance_km: f64,
    pub eta: DateTime<Utc>,
}

/// One drawable leg of the remaining path.
#[derive(Debug, Clone, Serialize)]
pub struct PathSegment {
    pub from_stop: StopId,
    pub to_stop: StopId,
    /// Full geometry when known, otherwise the two stop endpoints.
    pub geometry: Vec<Coordinate>,
    pub distance_km: f64,
    pub duration_min: f64,
}

/// Traffic input echoed back with the estimate.
#[derive(Debug, Clone, Serialize)]
pub struct TrafficConditions {
    pub factor: f64,
    pub level: &'static str,
}

impl TrafficConditions {
    fn from_factor(factor: f64) -> Self {
        let level = if factor >= 1.0 {
            "free_flow"
        } else if factor >= 0.7 {
            "moderate"
        } else {
            "heavy"
        };
        Self { factor, level }
    }
}

/// Full remaining-route estimate for one trip.
#[derive(Debug, Clone, Serialize)]
pub struct RouteEstimate {
    pub trip_id: TripId,
    pub line_id: LineId,
    pub current_location: CurrentLocation,
    /// Stops passed over total stops, in percent.
    pub progress_percent: f64,
    /// Remaining travel distance to the terminus.
    pub total_distance_km: f64,
    pub remaining_stops: Vec<RemainingStop>,
    pub estimated_path: Vec<PathSegment>,
    pub traffic: TrafficConditions,
    pub generated_at: DateTime<Utc>,
}

/// Computes remaining-route estimates from trip snapshots.
pub struct RouteEstimator {
    store: Arc<TripStore>,
    lines: Arc<dyn LineRegistry>,
    buses: Arc<dyn BusRegistry>,
    segments: Arc<dyn SegmentRepository>,
    config: RouteConfig,
}

impl RouteEstimator {
    pub fn new(
        store: Arc<TripStore>,
        lines: Arc<dyn LineRegistry>,
        buses: Arc<dyn BusRegistry>,
        segments: Arc<dyn SegmentRepository>,
        config: RouteConfig,
    ) -> Self {
        Self {
            store,
            lines,
            buses,
            segments,
            config,
        }
    }

    /// Estimate the remaining route of an active trip to the line terminus.
    pub fn estimate(&self, trip_id: &TripId) -> Result<RouteEstimate, TrackError> {
        self.estimate_at(trip_id, Utc::now())
    }

    pub fn estimate_at(
        &self,
        trip_id: &TripId,
        now: DateTime<Utc>,
    ) -> Result<RouteEstimate, TrackError> {
        let trip = self.store.snapshot(trip_id)?;
        self.estimate_snapshot(&trip, None, now)
    }

    /// Estimate to an intermediate destination stop instead of the terminus.
    pub fn estimate_to_stop_at(
        &self,
        trip_id: &TripId,
        destination: &StopId,
        now: DateTime<Utc>,
    ) -> Result<RouteEstimate, TrackError> {
        let trip = self.store.snapshot(trip_id)?;
        self.estimate_snapshot(&trip, Some(destination), now)
    }

    /// Estimate from an already-taken snapshot. Used by the arrivals service
    /// to avoid re-snapshotting each candidate trip.
    pub fn estimate_snapshot(
        &self,
        trip: &TripSnapshot,
        destination: Option<&StopId>,
        now: DateTime<Utc>,
    ) -> Result<RouteEstimate, TrackError> {
        if trip.state.is_terminal() {
            return Err(TrackError::InvalidState(format!(
                "trip {} is {}, nothing left to estimate",
                trip.id, trip.state
            )));
        }

        let line = self.lines.line(&trip.line_id).ok_or_else(|| {
            TrackError::NotFound(format!("line {} not found", trip.line_id))
        })?;
        let stops = line.stops();

        let end_index = match destination {
            Some(stop_id) => line.position_of(stop_id).ok_or_else(|| {
                TrackError::Validation(format!(
                    "stop {} is not on line {}",
                    stop_id, trip.line_id
                ))
            })?,
            None => stops.len() - 1,
        };

        // A trip with no accepted updates yet is assumed to sit at the
        // line's first stop with zero progress.
        let (position, reported_at, pointer) = match &trip.last_update {
            Some(update) => (
                update.coordinate(),
                Some(update.timestamp),
                trip.stop_pointer.min(stops.len() - 1),
            ),
            None => (stops[0].coordinate, None, 0),
        };

        if end_index < pointer {
            return Err(TrackError::Validation(format!(
                "stop {} is already behind trip {}",
                stops[end_index].id, trip.id
            )));
        }

        let speed_kmh = self
            .buses
            .bus(&trip.bus_id)
            .map(|b| b.average_speed_kmh)
            .filter(|s| *s > 0.0)
            .unwrap_or(self.config.fallback_speed_kmh);
        let factor = self.config.effective_factor();
        let effective_speed = speed_kmh * factor;

        let mut remaining_stops = Vec::with_capacity(end_index - pointer + 1);
        let mut estimated_path = Vec::new();
        let mut cumulative_km = 0.0;

        for index in pointer..=end_index {
            let stop = &stops[index];
            if index == pointer {
                // First leg: straight line from the current position.
                cumulative_km += geo::distance_km(position, stop.coordinate);
            } else {
                let prev = &stops[index - 1];
                let (geometry, distance_km, duration_min) =
                    match self.segments.segment(&prev.id, &stop.id) {
                        Some(seg) => {
                            let geometry = if seg.geometry.len() >= 2 {
                                seg.geometry
                            } else {
                                vec![prev.coordinate, stop.coordinate]
                            };
                            (geometry, seg.distance_km, seg.nominal_duration_min)
                        }
                        None => {
                            let d = geo::distance_km(prev.coordinate, stop.coordinate);
                            (
                                vec![prev.coordinate, stop.coordinate],
                                d,
                                d / effective_speed * 60.0,
                            )
                        }
                    };
                cumulative_km += distance_km;
                estimated_path.push(PathSegment {
                    from_stop: prev.id.clone(),
                    to_stop: stop.id.clone(),
                    geometry,
                    distance_km,
                    duration_min,
                });
            }

            let eta_minutes = cumulative_km / effective_speed * 60.0;
            remaining_stops.push(RemainingStop {
                stop_id: stop.id.clone(),
                name: stop.name.clone(),
                ordinal: stop.ordinal,
                latitude: stop.coordinate.latitude,
                longitude: stop.coordinate.longitude,
                distance_km: cumulative_km,
                eta: now + chrono::Duration::milliseconds((eta_minutes * 60_000.0) as i64),
            });
        }

        let progress_percent = if stops.len() <= 1 {
            100.0
        } else {
            (pointer as f64 / stops.len() as f64 * 100.0).clamp(0.0, 100.0)
        };

        Ok(RouteEstimate {
            trip_id: trip.id.clone(),
            line_id: trip.line_id.clone(),
            current_location: CurrentLocation {
                latitude: position.latitude,
                longitude: position.longitude,
                reported_at,
            },
            progress_percent,
            total_distance_km: cumulative_km,
            remaining_stops,
            estimated_path,
            traffic: TrafficConditions::from_factor(factor),
            generated_at: now,
        })
    }
}
