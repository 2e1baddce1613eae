//! Read-only lookup traits for external fleet data.
//!
//! Buses, drivers, lines and segment geometry are owned elsewhere; the
//! engine only ever reads immutable snapshots of them. These traits are the
//! seam where callers plug in their own storage. [`InMemoryRegistry`]
//! implements all of them and backs the tests and the demo binary.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::model::{
    BusId, BusSnapshot, DriverId, DriverSnapshot, LineId, LineSnapshot, RouteSegment, StopId,
};

/// Lookup of bus fleet data.
pub trait BusRegistry: Send + Sync {
    fn bus(&self, id: &BusId) -> Option<BusSnapshot>;
}

/// Lookup of driver data.
pub trait DriverRegistry: Send + Sync {
    fn driver(&self, id: &DriverId) -> Option<DriverSnapshot>;
}

/// Lookup of lines and their stop sequences.
pub trait LineRegistry: Send + Sync {
    fn line(&self, id: &LineId) -> Option<LineSnapshot>;

    fn lines(&self) -> Vec<LineSnapshot>;

    /// All lines whose stop sequence includes the given stop.
    fn lines_containing_stop(&self, stop_id: &StopId) -> Vec<LineSnapshot> {
        self.lines()
            .into_iter()
            .filter(|line| line.contains_stop(stop_id))
            .collect()
    }
}

/// Lookup of precomputed path geometry between consecutive stops.
pub trait SegmentRepository: Send + Sync {
    fn segment(&self, from: &StopId, to: &StopId) -> Option<RouteSegment>;
}

/// Map-backed registry for tests and standalone deployments.
#[derive(Default)]
pub struct InMemoryRegistry {
    buses: RwLock<HashMap<BusId, BusSnapshot>>,
    drivers: RwLock<HashMap<DriverId, DriverSnapshot>>,
    lines: RwLock<HashMap<LineId, LineSnapshot>>,
    segments: RwLock<HashMap<(StopId, StopId), RouteSegment>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_bus(&self, bus: BusSnapshot) {
        self.buses.write().insert(bus.id.clone(), bus);
    }

    pub fn insert_driver(&self, driver: DriverSnapshot) {
        self.drivers.write().insert(driver.id.clone(), driver);
    }

    pub fn insert_line(&self, line: LineSnapshot) {
        self.lines.write().insert(line.id.clone(), line);
    }

    pub fn insert_segment(&self, segment: RouteSegment) {
        self.segments.write().insert(
            (segment.from_stop.clone(), segment.to_stop.clone()),
            segment,
        );
    }
}

impl BusRegistry for InMemoryRegistry {
    fn bus(&self, id: &BusId) -> Option<BusSnapshot> {
        self.buses.read().get(id).cloned()
    }
}

impl DriverRegistry for InMemoryRegistry {
    fn driver(&self, id: &DriverId) -> Option<DriverSnapshot> {
        self.drivers.read().get(id).cloned()
    }
}

impl LineRegistry for InMemoryRegistry {
    fn line(&self, id: &LineId) -> Option<LineSnapshot> {
        self.lines.read().get(id).cloned()
    }

    fn lines(&self) -> Vec<LineSnapshot> {
        self.lines.read().values().cloned().collect()
    }
}

impl SegmentRepository for InMemoryRegistry {
    fn segment(&self, from: &StopId, to: &StopId) -> Option<RouteSegment> {
        self.segments
            .read()
            .get(&(from.clone(), to.clone()))
            .cloned()
    }
}
