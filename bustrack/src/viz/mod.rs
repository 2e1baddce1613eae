//! Per-line visualization payloads and their cache.
//!
//! Building a visualization walks every stop and active trip of a line, so
//! results are cached per line with a time-to-live. Any accepted location
//! update for a line invalidates its entry; the TTL only bounds staleness
//! for lines nobody is reporting on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use moka::Expiry;
use serde::Serialize;

use crate::geo::{self, Coordinate};
use crate::model::{BusId, DriverId, LineId, LineRef, LineSnapshot, StopId, TripId};
use crate::registry::{DriverRegistry, SegmentRepository};
use crate::trip::TripSnapshot;

/// Cache tuning.
#[derive(Debug, Clone)]
pub struct VizConfig {
    /// Default time-to-live for cached payloads.
    pub ttl: Duration,
    /// Maximum number of cached lines.
    pub max_entries: u64,
}

impl Default for VizConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_entries: 10_000,
        }
    }
}

/// One stop rendered on the map.
#[derive(Debug, Clone, Serialize)]
pub struct StopMarker {
    pub stop_id: StopId,
    pub name: String,
    pub ordinal: u32,
    pub latitude: f64,
    pub longitude: f64,
    pub is_terminal: bool,
}

/// One drawable leg between consecutive stops.
#[derive(Debug, Clone, Serialize)]
pub struct VizSegment {
    pub from_stop: StopId,
    pub to_stop: StopId,
    /// Path geometry when known; `None` means draw a straight line.
    pub polyline: Option<Vec<Coordinate>>,
    pub distance_km: f64,
    pub duration_min: Option<f64>,
}

/// Live position of one active bus on the line.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveBus {
    pub trip_id: TripId,
    pub bus_id: BusId,
    pub driver_name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub heading_deg: Option<f64>,
    pub reported_at: DateTime<Utc>,
}

/// Axis-aligned box enclosing the line's stops and active buses.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BoundingBox {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl BoundingBox {
    fn from_points(points: impl IntoIterator<Item = Coordinate>) -> Option<Self> {
        let mut bounds: Option<BoundingBox> = None;
        for p in points {
            bounds = Some(match bounds {
                None => BoundingBox {
                    north: p.latitude,
                    south: p.latitude,
                    east: p.longitude,
                    west: p.longitude,
                },
                Some(b) => BoundingBox {
                    north: b.north.max(p.latitude),
                    south: b.south.min(p.latitude),
                    east: b.east.max(p.longitude),
                    west: b.west.min(p.longitude),
                },
            });
        }
        bounds
    }
}

/// Full map payload for one line.
#[derive(Debug, Clone, Serialize)]
pub struct LineVisualization {
    pub line: LineRef,
    pub total_stops: usize,
    pub markers: Vec<StopMarker>,
    pub segments: Vec<VizSegment>,
    pub total_distance_km: f64,
    pub estimated_duration_min: Option<f64>,
    pub active_buses: Vec<ActiveBus>,
    pub bounds: Option<BoundingBox>,
    pub generated_at: DateTime<Utc>,
}

/// Build the map payload for a line from current snapshots.
pub fn build_visualization(
    line: &LineSnapshot,
    active_trips: &[TripSnapshot],
    drivers: &dyn DriverRegistry,
    segments: &dyn SegmentRepository,
    now: DateTime<Utc>,
) -> LineVisualization {
    let stops = line.stops();

    let markers: Vec<StopMarker> = stops
        .iter()
        .map(|stop| StopMarker {
            stop_id: stop.id.clone(),
            name: stop.name.clone(),
            ordinal: stop.ordinal,
            latitude: stop.coordinate.latitude,
            longitude: stop.coordinate.longitude,
            is_terminal: stop.id == line.terminus().id,
        })
        .collect();

    let mut viz_segments = Vec::new();
    let mut total_distance_km = 0.0;
    let mut total_duration_min = 0.0;
    let mut duration_known = true;
    for pair in stops.windows(2) {
        let segment = match segments.segment(&pair[0].id, &pair[1].id) {
            Some(seg) => {
                total_distance_km += seg.distance_km;
                total_duration_min += seg.nominal_duration_min;
                VizSegment {
                    from_stop: pair[0].id.clone(),
                    to_stop: pair[1].id.clone(),
                    polyline: (seg.geometry.len() >= 2).then_some(seg.geometry),
                    distance_km: seg.distance_km,
                    duration_min: Some(seg.nominal_duration_min),
                }
            }
            None => {
                let d = geo::distance_km(pair[0].coordinate, pair[1].coordinate);
                total_distance_km += d;
                duration_known = false;
                VizSegment {
                    from_stop: pair[0].id.clone(),
                    to_stop: pair[1].id.clone(),
                    polyline: None,
                    distance_km: d,
                    duration_min: None,
                }
            }
        };
        viz_segments.push(segment);
    }

    let active_buses: Vec<ActiveBus> = active_trips
        .iter()
        .filter_map(|trip| {
            let update = trip.last_update.as_ref()?;
            Some(ActiveBus {
                trip_id: trip.id.clone(),
                bus_id: trip.bus_id.clone(),
                driver_name: drivers.driver(&trip.driver_id).map(|d| d.name),
                latitude: update.latitude,
                longitude: update.longitude,
                heading_deg: update.heading_deg,
                reported_at: update.timestamp,
            })
        })
        .collect();

    let bounds = BoundingBox::from_points(
        stops
            .iter()
            .map(|s| s.coordinate)
            .chain(active_buses.iter().map(|b| Coordinate {
                latitude: b.latitude,
                longitude: b.longitude,
            })),
    );

    LineVisualization {
        line: LineRef::from(line),
        total_stops: stops.len(),
        markers,
        segments: viz_segments,
        total_distance_km,
        estimated_duration_min: duration_known.then_some(total_duration_min),
        active_buses,
        bounds,
        generated_at: now,
    }
}

#[derive(Clone)]
struct CacheEntry {
    value: Arc<LineVisualization>,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<LineId, CacheEntry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &LineId,
        entry: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// TTL cache of per-line visualization payloads.
pub struct VisualizationCache {
    cache: Cache<LineId, CacheEntry>,
    default_ttl: Duration,
}

impl VisualizationCache {
    pub fn new(config: VizConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_entries)
            .expire_after(PerEntryTtl)
            .build();
        Self {
            cache,
            default_ttl: config.ttl,
        }
    }

    /// Cached payload for a line, if present and not expired.
    pub fn get(&self, line_id: &LineId) -> Option<Arc<LineVisualization>> {
        self.cache.get(line_id).map(|entry| entry.value)
    }

    /// Store a payload, with an optional TTL override for this entry.
    pub fn put(&self, line_id: LineId, value: Arc<LineVisualization>, ttl: Option<Duration>) {
        self.cache.insert(
            line_id,
            CacheEntry {
                value,
                ttl: ttl.unwrap_or(self.default_ttl),
            },
        );
    }

    /// Drop the cached payload for a line. No-op when nothing is cached.
    pub fn invalidate(&self, line_id: &LineId) {
        self.cache.invalidate(line_id);
    }
}
