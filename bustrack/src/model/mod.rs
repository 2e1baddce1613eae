//! Core data model.
//!
//! Entities owned elsewhere (buses, drivers, lines, stops) appear here only
//! as immutable snapshots; the engine never holds a live handle into a
//! collaborator's storage. Records the engine does own (location updates,
//! anomalies, waiting-passenger reports) are append-only and immutable once
//! created.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TrackError;
use crate::geo::Coordinate;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_type!(
    /// Identifier of a bus (owned by the bus registry).
    BusId
);
id_type!(
    /// Identifier of a driver (owned by the driver registry).
    DriverId
);
id_type!(
    /// Identifier of a line (owned by the line registry).
    LineId
);
id_type!(
    /// Identifier of a stop along a line.
    StopId
);
id_type!(
    /// Identifier of one tracked run of a bus along a line.
    TripId
);

/// Immutable bus snapshot consumed per request from the bus registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusSnapshot {
    pub id: BusId,
    pub capacity: u32,
    /// Average cruising speed in km/h, used as the ETA fallback speed.
    pub average_speed_kmh: f64,
}

/// Immutable driver snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverSnapshot {
    pub id: DriverId,
    pub name: String,
    /// Historical rating in [0, 5]; feeds the arrival reliability score.
    pub rating: f64,
}

/// Immutable stop snapshot. Fixed for the lifetime of any trip on its line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopSnapshot {
    pub id: StopId,
    pub name: String,
    /// Position within the line's ordered sequence, starting at 0.
    pub ordinal: u32,
    pub coordinate: Coordinate,
}

/// A line and its ordered stops.
///
/// The ordering invariant is load-bearing: the route estimator assumes stops
/// are traversed in ordinal order, so construction validates that ordinals
/// are unique and sorts the sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawLineSnapshot")]
pub struct LineSnapshot {
    pub id: LineId,
    pub name: String,
    pub color: String,
    stops: Vec<StopSnapshot>,
}

/// Wire shape of a line; deserialization routes through [`LineSnapshot::new`]
/// so the ordering invariant survives untrusted input.
#[derive(Deserialize)]
struct RawLineSnapshot {
    id: LineId,
    name: String,
    color: String,
    stops: Vec<StopSnapshot>,
}

impl TryFrom<RawLineSnapshot> for LineSnapshot {
    type Error = TrackError;

    fn try_from(raw: RawLineSnapshot) -> Result<Self, Self::Error> {
        Self::new(raw.id, raw.name, raw.color, raw.stops)
    }
}

impl LineSnapshot {
    /// Build a line snapshot, sorting stops by ordinal and rejecting
    /// duplicate ordinals or an empty stop list.
    pub fn new(
        id: LineId,
        name: impl Into<String>,
        color: impl Into<String>,
        mut stops: Vec<StopSnapshot>,
    ) -> Result<Self, TrackError> {
        if stops.is_empty() {
            return Err(TrackError::Validation(format!(
                "line {} has no stops",
                id
            )));
        }
        stops.sort_by_key(|s| s.ordinal);
        for pair in stops.windows(2) {
            if pair[0].ordinal == pair[1].ordinal {
                return Err(TrackError::Validation(format!(
                    "line {} has duplicate stop ordinal {}",
                    id, pair[0].ordinal
                )));
            }
        }
        Ok(Self {
            id,
            name: name.into(),
            color: color.into(),
            stops,
        })
    }

    /// Stops in traversal order.
    pub fn stops(&self) -> &[StopSnapshot] {
        &self.stops
    }

    /// Index of a stop within the traversal order.
    pub fn position_of(&self, stop_id: &StopId) -> Option<usize> {
        self.stops.iter().position(|s| &s.id == stop_id)
    }

    pub fn contains_stop(&self, stop_id: &StopId) -> bool {
        self.position_of(stop_id).is_some()
    }

    /// The final stop of the line.
    pub fn terminus(&self) -> &StopSnapshot {
        // Construction guarantees at least one stop.
        self.stops.last().expect("line has at least one stop")
    }
}

/// Lightweight line reference embedded in API responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineRef {
    pub id: LineId,
    pub name: String,
    pub color: String,
}

impl From<&LineSnapshot> for LineRef {
    fn from(line: &LineSnapshot) -> Self {
        Self {
            id: line.id.clone(),
            name: line.name.clone(),
            color: line.color.clone(),
        }
    }
}

/// Precomputed path geometry between two consecutive stops.
///
/// When absent, the route estimator falls back to the straight line between
/// the stop coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSegment {
    pub from_stop: StopId,
    pub to_stop: StopId,
    /// Ordered path coordinates, including both endpoints.
    pub geometry: Vec<Coordinate>,
    pub distance_km: f64,
    pub nominal_duration_min: f64,
}

/// A single validated GPS report, immutable once appended to a trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub trip_id: TripId,
    /// Report timestamp; non-decreasing within one trip.
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: f64,
    pub speed_kmh: Option<f64>,
    /// Heading in degrees [0, 360).
    pub heading_deg: Option<f64>,
}

impl LocationUpdate {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

/// Anomaly severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// What made a location report implausible.
///
/// One variant per anomaly kind, each carrying only the supporting values
/// that kind needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Derived speed above the plausibility ceiling. `observed_kmh` is `None`
    /// when the speed is undefined (zero elapsed time over non-zero distance).
    Speed { observed_kmh: Option<f64> },

    /// Position off the line's route geometry for consecutive updates.
    RouteDeviation { off_route_m: f64 },

    /// Two active buses on the same line running too close together.
    Bunching {
        other_trip: TripId,
        separation_km: f64,
    },
}

impl AnomalyKind {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            AnomalyKind::Speed { .. } => "speed",
            AnomalyKind::RouteDeviation { .. } => "route_deviation",
            AnomalyKind::Bunching { .. } => "bunching",
        }
    }
}

/// A recorded observation that a trip's telemetry is implausible.
///
/// Append-only: anomalies are never mutated or resolved by the engine, and
/// they never block the ingestion that produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub trip_id: TripId,
    pub detected_at: DateTime<Utc>,
    pub severity: Severity,
    #[serde(flatten)]
    pub kind: AnomalyKind,
}

/// Crowd-sourced count of passengers waiting at a stop.
///
/// Lifecycle is owned by an external collaborator; the engine aggregates
/// recent reports only as an input signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitingPassengerReport {
    pub stop_id: StopId,
    pub line_id: Option<LineId>,
    pub count: u32,
    pub reported_at: DateTime<Utc>,
}

/// Trip lifecycle state.
///
/// `Pending → Active → Completed | Aborted`; the two right-hand states are
/// terminal and accept no further location updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripState {
    Pending,
    Active,
    Completed,
    Aborted,
}

impl TripState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TripState::Completed | TripState::Aborted)
    }
}

impl std::fmt::Display for TripState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TripState::Pending => "pending",
            TripState::Active => "active",
            TripState::Completed => "completed",
            TripState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Statistics computed when a trip ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripSummary {
    /// Sum of distances between consecutive location updates.
    pub total_distance_km: f64,
    /// `None` for trips that ended with no elapsed time.
    pub average_speed_kmh: Option<f64>,
    pub duration_secs: i64,
}
