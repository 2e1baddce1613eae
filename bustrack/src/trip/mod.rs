//! Trip lifecycle and concurrent trip storage.
//!
//! # Design
//!
//! Each trip lives behind its own mutex inside a [`DashMap`], so writes to
//! different trips never contend while writes to the same trip are strictly
//! serialized. Readers take the lock only long enough to clone a
//! [`TripSnapshot`]; all estimation work happens on the copy, never against
//! live state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::TrackError;
use crate::geo;
use crate::model::{
    BusId, DriverId, LineId, LocationUpdate, TripId, TripState, TripSummary,
};

/// Mutable per-trip state. Only ever touched while holding the trip's mutex.
#[derive(Debug)]
pub(crate) struct TripRecord {
    pub(crate) id: TripId,
    pub(crate) line_id: LineId,
    pub(crate) bus_id: BusId,
    pub(crate) driver_id: DriverId,
    pub(crate) state: TripState,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) ended_at: Option<DateTime<Utc>>,
    /// Append-only history of accepted updates, oldest first.
    pub(crate) updates: Vec<LocationUpdate>,
    /// Index into the line's stop sequence of the next stop to reach.
    /// Monotonically non-decreasing for the lifetime of the trip.
    pub(crate) stop_pointer: usize,
    /// Consecutive off-route updates; reset to zero by any on-route update.
    pub(crate) deviation_streak: u32,
    /// Last accepted update or state change, for inactivity expiry.
    pub(crate) last_activity: DateTime<Utc>,
    pub(crate) summary: Option<TripSummary>,
}

impl TripRecord {
    pub(crate) fn last_update(&self) -> Option<&LocationUpdate> {
        self.updates.last()
    }

    pub(crate) fn append(&mut self, update: LocationUpdate) {
        self.last_activity = update.timestamp;
        self.updates.push(update);
    }

    /// Transition to a terminal state and compute the trip summary from the
    /// accepted update history.
    pub(crate) fn finish(&mut self, state: TripState, now: DateTime<Utc>) {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.ended_at = Some(now);
        self.last_activity = now;

        let mut total_km = 0.0;
        for pair in self.updates.windows(2) {
            total_km += geo::distance_km(pair[0].coordinate(), pair[1].coordinate());
        }
        let duration_secs = match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => (end - start).num_seconds().max(0),
            _ => 0,
        };
        let average_speed_kmh = if duration_secs > 0 {
            Some(total_km / (duration_secs as f64 / 3600.0))
        } else {
            None
        };
        self.summary = Some(TripSummary {
            total_distance_km: total_km,
            average_speed_kmh,
            duration_secs,
        });
    }
}

/// Point-in-time copy of a trip, safe to use without any lock held.
#[derive(Debug, Clone)]
pub struct TripSnapshot {
    pub id: TripId,
    pub line_id: LineId,
    pub bus_id: BusId,
    pub driver_id: DriverId,
    pub state: TripState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_update: Option<LocationUpdate>,
    pub stop_pointer: usize,
    pub update_count: usize,
    pub last_activity: DateTime<Utc>,
    pub summary: Option<TripSummary>,
}

impl TripSnapshot {
    fn from_record(record: &TripRecord) -> Self {
        Self {
            id: record.id.clone(),
            line_id: record.line_id.clone(),
            bus_id: record.bus_id.clone(),
            driver_id: record.driver_id.clone(),
            state: record.state,
            started_at: record.started_at,
            ended_at: record.ended_at,
            last_update: record.last_update().cloned(),
            stop_pointer: record.stop_pointer,
            update_count: record.updates.len(),
            last_activity: record.last_activity,
            summary: record.summary.clone(),
        }
    }
}

/// Concurrent store of all known trips.
#[derive(Default)]
pub struct TripStore {
    trips: DashMap<TripId, Arc<Mutex<TripRecord>>>,
}

impl TripStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new trip in the `Pending` state.
    pub fn create(
        &self,
        id: TripId,
        line_id: LineId,
        bus_id: BusId,
        driver_id: DriverId,
    ) -> Result<(), TrackError> {
        self.create_at(id, line_id, bus_id, driver_id, Utc::now())
    }

    pub fn create_at(
        &self,
        id: TripId,
        line_id: LineId,
        bus_id: BusId,
        driver_id: DriverId,
        now: DateTime<Utc>,
    ) -> Result<(), TrackError> {
        use dashmap::mapref::entry::Entry;

        match self.trips.entry(id.clone()) {
            Entry::Occupied(_) => Err(TrackError::InvalidState(format!(
                "trip {} already exists",
                id
            ))),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Mutex::new(TripRecord {
                    id,
                    line_id,
                    bus_id,
                    driver_id,
                    state: TripState::Pending,
                    started_at: None,
                    ended_at: None,
                    updates: Vec::new(),
                    stop_pointer: 0,
                    deviation_streak: 0,
                    last_activity: now,
                    summary: None,
                })));
                Ok(())
            }
        }
    }

    /// Transition `Pending → Active`.
    pub fn start(&self, id: &TripId) -> Result<TripSnapshot, TrackError> {
        self.start_at(id, Utc::now())
    }

    pub fn start_at(&self, id: &TripId, now: DateTime<Utc>) -> Result<TripSnapshot, TrackError> {
        let record = self.handle(id)?;
        let mut trip = record.lock();
        if trip.state != TripState::Pending {
            return Err(TrackError::InvalidState(format!(
                "trip {} cannot start from state {}",
                id, trip.state
            )));
        }
        trip.state = TripState::Active;
        trip.started_at = Some(now);
        trip.last_activity = now;
        Ok(TripSnapshot::from_record(&trip))
    }

    /// Transition `Active → Completed`, computing the trip summary.
    pub fn complete(&self, id: &TripId) -> Result<TripSnapshot, TrackError> {
        self.complete_at(id, Utc::now())
    }

    pub fn complete_at(
        &self,
        id: &TripId,
        now: DateTime<Utc>,
    ) -> Result<TripSnapshot, TrackError> {
        self.finish_at(id, TripState::Completed, now)
    }

    /// Transition `Active → Aborted`, computing the trip summary.
    pub fn abort_at(&self, id: &TripId, now: DateTime<Utc>) -> Result<TripSnapshot, TrackError> {
        self.finish_at(id, TripState::Aborted, now)
    }

    fn finish_at(
        &self,
        id: &TripId,
        state: TripState,
        now: DateTime<Utc>,
    ) -> Result<TripSnapshot, TrackError> {
        let record = self.handle(id)?;
        let mut trip = record.lock();
        if trip.state != TripState::Active {
            return Err(TrackError::InvalidState(format!(
                "trip {} cannot end from state {}",
                id, trip.state
            )));
        }
        trip.finish(state, now);
        Ok(TripSnapshot::from_record(&trip))
    }

    /// Point-in-time copy of one trip.
    pub fn snapshot(&self, id: &TripId) -> Result<TripSnapshot, TrackError> {
        let record = self.handle(id)?;
        let trip = record.lock();
        Ok(TripSnapshot::from_record(&trip))
    }

    /// Snapshots of all trips currently in the `Active` state.
    pub fn active_snapshots(&self) -> Vec<TripSnapshot> {
        self.trips
            .iter()
            .filter_map(|entry| {
                let trip = entry.value().lock();
                (trip.state == TripState::Active).then(|| TripSnapshot::from_record(&trip))
            })
            .collect()
    }

    /// Active trips on one line.
    pub fn active_on_line(&self, line_id: &LineId) -> Vec<TripSnapshot> {
        self.active_snapshots()
            .into_iter()
            .filter(|t| &t.line_id == line_id)
            .collect()
    }

    /// Run `f` against a trip's record while holding its lock. The trip must
    /// be `Active`.
    pub(crate) fn with_active_mut<T>(
        &self,
        id: &TripId,
        f: impl FnOnce(&mut TripRecord) -> Result<T, TrackError>,
    ) -> Result<T, TrackError> {
        let record = self.handle(id)?;
        let mut trip = record.lock();
        if trip.state != TripState::Active {
            return Err(TrackError::InvalidState(format!(
                "trip {} is {}, not active",
                id, trip.state
            )));
        }
        f(&mut trip)
    }

    /// Abort every active trip whose last activity is older than `timeout`.
    ///
    /// Staleness is re-checked under each trip's lock, so an update racing
    /// the sweep keeps its trip alive. Returns the expired trips' ids and
    /// lines so the caller can invalidate per-line caches.
    pub fn expire_stale(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Vec<(TripId, LineId)> {
        let cutoff = now - chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero());
        let mut expired = Vec::new();
        for entry in self.trips.iter() {
            let mut trip = entry.value().lock();
            if trip.state == TripState::Active && trip.last_activity < cutoff {
                trip.finish(TripState::Aborted, now);
                expired.push((trip.id.clone(), trip.line_id.clone()));
            }
        }
        expired
    }

    fn handle(&self, id: &TripId) -> Result<Arc<Mutex<TripRecord>>, TrackError> {
        self.trips
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TrackError::NotFound(format!("trip {} not found", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store_with_trip(id: &str) -> TripStore {
        let store = TripStore::new();
        store
            .create(
                TripId::from(id),
                LineId::from("l1"),
                BusId::from("b1"),
                DriverId::from("d1"),
            )
            .unwrap();
        store
    }

    fn update_at(trip: &str, ts: DateTime<Utc>, lat: f64, lon: f64) -> LocationUpdate {
        LocationUpdate {
            trip_id: TripId::from(trip),
            timestamp: ts,
            latitude: lat,
            longitude: lon,
            accuracy_m: 10.0,
            speed_kmh: None,
            heading_deg: None,
        }
    }

    #[test]
    fn test_lifecycle_pending_active_completed() {
        let store = store_with_trip("t1");
        let id = TripId::from("t1");

        assert_eq!(store.snapshot(&id).unwrap().state, TripState::Pending);
        store.start(&id).unwrap();
        assert_eq!(store.snapshot(&id).unwrap().state, TripState::Active);
        let done = store.complete(&id).unwrap();
        assert_eq!(done.state, TripState::Completed);
        assert!(done.summary.is_some());
    }

    #[test]
    fn test_cannot_start_twice() {
        let store = store_with_trip("t1");
        let id = TripId::from("t1");
        store.start(&id).unwrap();
        assert!(matches!(
            store.start(&id),
            Err(TrackError::InvalidState(_))
        ));
    }

    #[test]
    fn test_cannot_complete_pending_trip() {
        let store = store_with_trip("t1");
        assert!(matches!(
            store.complete(&TripId::from("t1")),
            Err(TrackError::InvalidState(_))
        ));
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let store = store_with_trip("t1");
        assert!(matches!(
            store.create(
                TripId::from("t1"),
                LineId::from("l2"),
                BusId::from("b2"),
                DriverId::from("d2"),
            ),
            Err(TrackError::InvalidState(_))
        ));
    }

    #[test]
    fn test_unknown_trip_is_not_found() {
        let store = TripStore::new();
        assert!(matches!(
            store.snapshot(&TripId::from("ghost")),
            Err(TrackError::NotFound(_))
        ));
    }

    #[test]
    fn test_summary_totals_distance_and_speed() {
        let store = TripStore::new();
        let id = TripId::from("t1");
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        store
            .create_at(
                id.clone(),
                LineId::from("l1"),
                BusId::from("b1"),
                DriverId::from("d1"),
                start,
            )
            .unwrap();
        store.start_at(&id, start).unwrap();

        // Two updates 0.01 degrees of latitude apart, roughly 1.11 km.
        store
            .with_active_mut(&id, |trip| {
                trip.append(update_at("t1", start, 40.0, -3.0));
                trip.append(update_at(
                    "t1",
                    start + chrono::Duration::minutes(2),
                    40.01,
                    -3.0,
                ));
                Ok(())
            })
            .unwrap();

        let end = start + chrono::Duration::minutes(30);
        let done = store.complete_at(&id, end).unwrap();
        let summary = done.summary.unwrap();
        assert!((summary.total_distance_km - 1.11).abs() < 0.02);
        assert_eq!(summary.duration_secs, 1800);
        let speed = summary.average_speed_kmh.unwrap();
        assert!((speed - summary.total_distance_km * 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_summary_with_no_elapsed_time_has_no_speed() {
        let store = TripStore::new();
        let id = TripId::from("t1");
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        store
            .create_at(
                id.clone(),
                LineId::from("l1"),
                BusId::from("b1"),
                DriverId::from("d1"),
                now,
            )
            .unwrap();
        store.start_at(&id, now).unwrap();
        let done = store.complete_at(&id, now).unwrap();
        assert!(done.summary.unwrap().average_speed_kmh.is_none());
    }

    #[test]
    fn test_expire_stale_aborts_only_inactive_trips() {
        let store = TripStore::new();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        for (id, minutes_ago) in [("fresh", 2i64), ("stale", 20)] {
            let created = now - chrono::Duration::minutes(minutes_ago);
            store
                .create_at(
                    TripId::from(id),
                    LineId::from("l1"),
                    BusId::from("b1"),
                    DriverId::from("d1"),
                    created,
                )
                .unwrap();
            store.start_at(&TripId::from(id), created).unwrap();
        }

        let expired = store.expire_stale(Duration::from_secs(15 * 60), now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, TripId::from("stale"));

        assert_eq!(
            store.snapshot(&TripId::from("stale")).unwrap().state,
            TripState::Aborted
        );
        assert_eq!(
            store.snapshot(&TripId::from("fresh")).unwrap().state,
            TripState::Active
        );
        // Aborted trips still get a summary.
        assert!(store
            .snapshot(&TripId::from("stale"))
            .unwrap()
            .summary
            .is_some());
    }

    #[test]
    fn test_active_on_line_filters_by_line_and_state() {
        let store = TripStore::new();
        for (id, line, start) in [("t1", "l1", true), ("t2", "l2", true), ("t3", "l1", false)] {
            store
                .create(
                    TripId::from(id),
                    LineId::from(line),
                    BusId::from("b"),
                    DriverId::from("d"),
                )
                .unwrap();
            if start {
                store.start(&TripId::from(id)).unwrap();
            }
        }

        let active = store.active_on_line(&LineId::from("l1"));
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, TripId::from("t1"));
        assert_eq!(store.active_snapshots().len(), 2);
    }
}
