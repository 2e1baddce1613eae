//! Request-level surface of the engine.
//!
//! Wire DTOs plus async wrappers around the blocking read queries. Each
//! read runs on the blocking pool under the engine's read timeout, so one
//! slow query degrades into a transient error instead of tying up a
//! runtime worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::app::Engine;
use crate::arrivals::ArrivalEstimate;
use crate::error::{ErrorKind, TrackError};
use crate::ingest::LocationReport;
use crate::model::{Anomaly, LineId, StopId, TripId};
use crate::route::RouteEstimate;
use crate::viz::LineVisualization;

/// Incoming location report.
#[derive(Debug, Clone, Deserialize)]
pub struct LocationUpdateRequest {
    pub trip_id: TripId,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: f64,
    #[serde(default)]
    pub speed_kmh: Option<f64>,
    #[serde(default)]
    pub heading_deg: Option<f64>,
}

/// Acknowledgement for an accepted report.
#[derive(Debug, Clone, Serialize)]
pub struct LocationUpdateAccepted {
    pub trip_id: TripId,
    pub stop_pointer: usize,
    pub trip_completed: bool,
    pub anomalies: Vec<Anomaly>,
}

/// Error shape returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    fn timeout(what: &str) -> Self {
        Self {
            kind: ErrorKind::TransientCompute,
            message: format!("{what} timed out"),
        }
    }
}

impl From<TrackError> for ApiError {
    fn from(err: TrackError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

impl Engine {
    /// Record one location report. Writes are quick and lock only the
    /// target trip, so no timeout applies.
    pub fn post_location_update(
        &self,
        request: LocationUpdateRequest,
    ) -> Result<LocationUpdateAccepted, ApiError> {
        let result = self.record_location(LocationReport {
            trip_id: request.trip_id,
            timestamp: request.timestamp,
            latitude: request.latitude,
            longitude: request.longitude,
            accuracy_m: request.accuracy_m,
            speed_kmh: request.speed_kmh,
            heading_deg: request.heading_deg,
        })?;
        Ok(LocationUpdateAccepted {
            trip_id: result.update.trip_id,
            stop_pointer: result.stop_pointer,
            trip_completed: result.completed,
            anomalies: result.anomalies,
        })
    }

    /// Remaining-route estimate for a trip, bounded by the read timeout.
    pub async fn route_estimate(&self, trip_id: TripId) -> Result<RouteEstimate, ApiError> {
        let engine = self.clone();
        self.bounded_read("route estimate", move || {
            engine.route_estimate_blocking(&trip_id)
        })
        .await
    }

    /// Arrivals at a stop, bounded by the read timeout.
    pub async fn arrivals(
        &self,
        stop_id: StopId,
        line_id: Option<LineId>,
    ) -> Result<Vec<ArrivalEstimate>, ApiError> {
        let engine = self.clone();
        self.bounded_read("arrivals query", move || {
            engine.arrivals_blocking(&stop_id, line_id.as_ref())
        })
        .await
    }

    /// Map payload for a line, bounded by the read timeout.
    pub async fn visualization(
        &self,
        line_id: LineId,
    ) -> Result<std::sync::Arc<LineVisualization>, ApiError> {
        let engine = self.clone();
        self.bounded_read("visualization", move || {
            engine.visualization_blocking(&line_id)
        })
        .await
    }

    async fn bounded_read<T, F>(&self, what: &str, f: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, TrackError> + Send + 'static,
    {
        let task = tokio::task::spawn_blocking(f);
        match tokio::time::timeout(self.read_timeout(), task).await {
            Ok(Ok(result)) => result.map_err(ApiError::from),
            Ok(Err(join_err)) => {
                warn!(what, error = %join_err, "read query panicked");
                Err(ApiError {
                    kind: ErrorKind::TransientCompute,
                    message: format!("{what} failed"),
                })
            }
            Err(_) => {
                warn!(what, "read query timed out");
                Err(ApiError::timeout(what))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{EngineConfig, Registries};
    use crate::geo::Coordinate;
    use crate::model::{
        BusId, BusSnapshot, DriverId, DriverSnapshot, LineSnapshot, StopSnapshot,
    };
    use crate::registry::InMemoryRegistry;
    use std::sync::Arc;

    fn stop(id: &str, ordinal: u32, lat: f64) -> StopSnapshot {
        StopSnapshot {
            id: StopId::from(id),
            name: id.to_uppercase(),
            ordinal,
            coordinate: Coordinate {
                latitude: lat,
                longitude: 0.0,
            },
        }
    }

    fn engine() -> Engine {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.insert_line(
            LineSnapshot::new(
                LineId::from("l1"),
                "Line 1",
                "#aa00aa",
                vec![stop("a", 0, 0.0), stop("b", 1, 0.05), stop("c", 2, 0.1)],
            )
            .unwrap(),
        );
        registry.insert_bus(BusSnapshot {
            id: BusId::from("b1"),
            capacity: 40,
            average_speed_kmh: 30.0,
        });
        registry.insert_driver(DriverSnapshot {
            id: DriverId::from("d1"),
            name: "Ana".to_string(),
            rating: 4.0,
        });
        Engine::new(EngineConfig::default(), Registries::from_single(registry))
    }

    fn active_trip(engine: &Engine, id: &str) -> TripId {
        let trip = TripId::from(id);
        engine
            .create_trip(
                trip.clone(),
                LineId::from("l1"),
                BusId::from("b1"),
                DriverId::from("d1"),
            )
            .unwrap();
        engine.start_trip(&trip).unwrap();
        trip
    }

    #[test]
    fn test_post_location_update_roundtrip() {
        let engine = engine();
        let trip = active_trip(&engine, "t1");

        let accepted = engine
            .post_location_update(LocationUpdateRequest {
                trip_id: trip.clone(),
                timestamp: Utc::now(),
                latitude: 0.001,
                longitude: 0.0,
                accuracy_m: 10.0,
                speed_kmh: None,
                heading_deg: None,
            })
            .unwrap();
        assert_eq!(accepted.trip_id, trip);
        assert!(!accepted.trip_completed);
        assert!(accepted.anomalies.is_empty());
    }

    #[test]
    fn test_request_deserializes_with_optional_fields() {
        let request: LocationUpdateRequest = serde_json::from_str(
            r#"{
                "trip_id": "t1",
                "timestamp": "2024-05-01T12:00:00Z",
                "latitude": 0.01,
                "longitude": 0.0,
                "accuracy_m": 15.0
            }"#,
        )
        .unwrap();
        assert_eq!(request.trip_id, TripId::from("t1"));
        assert!(request.speed_kmh.is_none());
        assert!(request.heading_deg.is_none());
    }

    #[test]
    fn test_api_error_carries_kind() {
        let engine = engine();
        let err = engine
            .post_location_update(LocationUpdateRequest {
                trip_id: TripId::from("ghost"),
                timestamp: Utc::now(),
                latitude: 0.0,
                longitude: 0.0,
                accuracy_m: 10.0,
                speed_kmh: None,
                heading_deg: None,
            })
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_async_reads_resolve() {
        let engine = engine();
        let trip = active_trip(&engine, "t1");
        engine
            .post_location_update(LocationUpdateRequest {
                trip_id: trip.clone(),
                timestamp: Utc::now(),
                latitude: 0.02,
                longitude: 0.0,
                accuracy_m: 10.0,
                speed_kmh: None,
                heading_deg: None,
            })
            .unwrap();

        let estimate = engine.route_estimate(trip.clone()).await.unwrap();
        assert_eq!(estimate.trip_id, trip);

        let arrivals = engine.arrivals(StopId::from("c"), None).await.unwrap();
        assert_eq!(arrivals.len(), 1);

        let viz = engine.visualization(LineId::from("l1")).await.unwrap();
        assert_eq!(viz.total_stops, 3);
    }

    #[tokio::test]
    async fn test_async_read_propagates_not_found() {
        let engine = engine();
        let err = engine
            .route_estimate(TripId::from("ghost"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
