//! Plausibility checks over accepted location updates.
//!
//! Detection is advisory: anomalies are recorded and logged but the update
//! that triggered them is still stored, and a detector failure must never
//! reject an otherwise valid report.
//!
//! Three kinds are covered: implausible derived speed, sustained route
//! deviation, and bus bunching. The first two run inline during ingestion;
//! bunching is a pairwise scan run by the background sweeper.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::geo::{self, Coordinate};
use crate::model::{
    Anomaly, AnomalyKind, LineSnapshot, LocationUpdate, Severity, TripId,
};
use crate::registry::SegmentRepository;
use crate::trip::TripSnapshot;

/// Detection thresholds.
#[derive(Debug, Clone)]
pub struct AnomalyConfig {
    /// Speeds strictly above this are flagged.
    pub max_plausible_speed_kmh: f64,
    /// Perpendicular distance from the route beyond which an update counts
    /// as off-route.
    pub max_deviation_m: f64,
    /// Off-route updates needed in a row before a deviation anomaly fires.
    pub deviation_streak: u32,
    /// Same-line buses closer than this are bunched.
    pub bunching_distance_km: f64,
    /// A repeat bunching pair within this window is not re-reported.
    pub bunching_dedupe_window: Duration,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            max_plausible_speed_kmh: 120.0,
            max_deviation_m: 500.0,
            deviation_streak: 2,
            bunching_distance_km: 0.5,
            bunching_dedupe_window: Duration::from_secs(30 * 60),
        }
    }
}

/// Stateless checks applied to each accepted update.
pub struct AnomalyDetector {
    config: AnomalyConfig,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnomalyConfig {
        &self.config
    }

    /// Inspect one accepted update against the previous one and the line
    /// geometry. `streak` is the trip's consecutive off-route counter, which
    /// this call advances or resets.
    pub fn inspect(
        &self,
        previous: Option<&LocationUpdate>,
        current: &LocationUpdate,
        line: &LineSnapshot,
        segments: &dyn SegmentRepository,
        streak: &mut u32,
    ) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();

        if let Some(speed) = self.check_speed(previous, current) {
            anomalies.push(speed);
        }
        if let Some(deviation) = self.check_deviation(current, line, segments, streak) {
            anomalies.push(deviation);
        }

        anomalies
    }

    /// Speed derived from consecutive updates, flagged at high severity when
    /// strictly above the ceiling. Zero elapsed time over non-zero distance
    /// means the speed is undefined and is flagged with no observed value.
    fn check_speed(
        &self,
        previous: Option<&LocationUpdate>,
        current: &LocationUpdate,
    ) -> Option<Anomaly> {
        let previous = previous?;
        let distance_km = geo::distance_km(previous.coordinate(), current.coordinate());
        let elapsed_secs = (current.timestamp - previous.timestamp)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;

        let observed_kmh = if elapsed_secs == 0.0 {
            if distance_km == 0.0 {
                return None;
            }
            None
        } else {
            let observed = distance_km / (elapsed_secs / 3600.0);
            if observed <= self.config.max_plausible_speed_kmh {
                return None;
            }
            Some(observed)
        };

        Some(Anomaly {
            trip_id: current.trip_id.clone(),
            detected_at: current.timestamp,
            severity: Severity::High,
            kind: AnomalyKind::Speed { observed_kmh },
        })
    }

    /// Distance from the update to the nearest piece of the line's route.
    /// Flags only after the configured number of consecutive off-route
    /// updates, so a single GPS glitch does not fire.
    fn check_deviation(
        &self,
        current: &LocationUpdate,
        line: &LineSnapshot,
        segments: &dyn SegmentRepository,
        streak: &mut u32,
    ) -> Option<Anomaly> {
        let off_route_m = match self.distance_to_route_m(current.coordinate(), line, segments) {
            Some(d) => d,
            // Single-stop lines have no route to deviate from.
            None => return None,
        };

        if off_route_m <= self.config.max_deviation_m {
            *streak = 0;
            return None;
        }

        *streak += 1;
        if *streak < self.config.deviation_streak {
            return None;
        }

        Some(Anomaly {
            trip_id: current.trip_id.clone(),
            detected_at: current.timestamp,
            severity: Severity::Medium,
            kind: AnomalyKind::RouteDeviation { off_route_m },
        })
    }

    /// Minimum distance in meters from `point` to any piece of the line's
    /// route, using segment geometry where available and the straight line
    /// between stops where not.
    fn distance_to_route_m(
        &self,
        point: Coordinate,
        line: &LineSnapshot,
        segments: &dyn SegmentRepository,
    ) -> Option<f64> {
        let stops = line.stops();
        if stops.len() < 2 {
            return None;
        }

        let mut best_km = f64::INFINITY;
        for pair in stops.windows(2) {
            let polyline = segments
                .segment(&pair[0].id, &pair[1].id)
                .map(|s| s.geometry)
                .filter(|g| g.len() >= 2);
            match polyline {
                Some(points) => {
                    for leg in points.windows(2) {
                        let d = geo::point_to_segment_km(point, leg[0], leg[1]);
                        best_km = best_km.min(d);
                    }
                }
                None => {
                    let d = geo::point_to_segment_km(
                        point,
                        pair[0].coordinate,
                        pair[1].coordinate,
                    );
                    best_km = best_km.min(d);
                }
            }
        }
        Some(best_km * 1000.0)
    }
}

/// Pairwise bunching scan over the active trips of one line.
///
/// Emits one anomaly per bus in each bunched pair. Deduplication against
/// recent reports is the caller's job via [`AnomalyLog::recent_bunching`].
pub fn detect_bunching(
    trips: &[TripSnapshot],
    config: &AnomalyConfig,
    now: DateTime<Utc>,
) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();
    for (i, a) in trips.iter().enumerate() {
        let Some(pos_a) = a.last_update.as_ref().map(|u| u.coordinate()) else {
            continue;
        };
        for b in &trips[i + 1..] {
            let Some(pos_b) = b.last_update.as_ref().map(|u| u.coordinate()) else {
                continue;
            };
            let separation_km = geo::distance_km(pos_a, pos_b);
            if separation_km >= config.bunching_distance_km {
                continue;
            }
            for (this, other) in [(a, b), (b, a)] {
                anomalies.push(Anomaly {
                    trip_id: this.id.clone(),
                    detected_at: now,
                    severity: Severity::Medium,
                    kind: AnomalyKind::Bunching {
                        other_trip: other.id.clone(),
                        separation_km,
                    },
                });
            }
        }
    }
    anomalies
}

/// Append-only per-trip anomaly history.
#[derive(Default)]
pub struct AnomalyLog {
    by_trip: DashMap<TripId, Vec<Anomaly>>,
}

impl AnomalyLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, anomaly: Anomaly) {
        self.by_trip
            .entry(anomaly.trip_id.clone())
            .or_default()
            .push(anomaly);
    }

    pub fn for_trip(&self, trip_id: &TripId) -> Vec<Anomaly> {
        self.by_trip
            .get(trip_id)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    /// Number of anomalies recorded for a trip within the trailing window.
    pub fn recent_count(&self, trip_id: &TripId, window: Duration, now: DateTime<Utc>) -> usize {
        let cutoff =
            now - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
        self.by_trip
            .get(trip_id)
            .map(|entry| {
                entry
                    .iter()
                    .filter(|a| a.detected_at >= cutoff)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Whether a bunching anomaly for this trip pair was already recorded
    /// within the window.
    pub fn recent_bunching(
        &self,
        trip_id: &TripId,
        other: &TripId,
        window: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        let cutoff =
            now - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
        self.by_trip
            .get(trip_id)
            .map(|entry| {
                entry.iter().any(|a| {
                    a.detected_at >= cutoff
                        && matches!(
                            &a.kind,
                            AnomalyKind::Bunching { other_trip, .. } if other_trip == other
                        )
                })
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BusId, DriverId, LineId, StopId, StopSnapshot, TripState};
    use crate::registry::InMemoryRegistry;
    use chrono::TimeZone;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn update(ts: DateTime<Utc>, lat: f64, lon: f64) -> LocationUpdate {
        LocationUpdate {
            trip_id: TripId::from("t1"),
            timestamp: ts,
            latitude: lat,
            longitude: lon,
            accuracy_m: 10.0,
            speed_kmh: None,
            heading_deg: None,
        }
    }

    fn stop(id: &str, ordinal: u32, lat: f64, lon: f64) -> StopSnapshot {
        StopSnapshot {
            id: StopId::from(id),
            name: id.to_string(),
            ordinal,
            coordinate: Coordinate {
                latitude: lat,
                longitude: lon,
            },
        }
    }

    // Straight north-south line along the prime meridian, about 11 km long.
    fn test_line() -> LineSnapshot {
        LineSnapshot::new(
            LineId::from("l1"),
            "Test",
            "#00ff00",
            vec![stop("a", 0, 0.0, 0.0), stop("b", 1, 0.1, 0.0)],
        )
        .unwrap()
    }

    fn detector() -> AnomalyDetector {
        AnomalyDetector::new(AnomalyConfig::default())
    }

    mod speed {
        use super::*;

        #[test]
        fn test_speed_above_ceiling_is_flagged() {
            let t0 = base_time();
            // 1.11 km in 10 seconds is about 400 km/h.
            let prev = update(t0, 0.0, 0.0);
            let curr = update(t0 + chrono::Duration::seconds(10), 0.01, 0.0);

            let mut streak = 0;
            let anomalies =
                detector().inspect(Some(&prev), &curr, &test_line(), &InMemoryRegistry::new(), &mut streak);
            assert_eq!(anomalies.len(), 1);
            match &anomalies[0].kind {
                AnomalyKind::Speed { observed_kmh } => {
                    let v = observed_kmh.unwrap();
                    assert!(v > 350.0 && v < 450.0, "observed {v}");
                }
                other => panic!("expected speed anomaly, got {other:?}"),
            }
        }

        #[test]
        fn test_gross_overspeed_is_high_severity() {
            let t0 = base_time();
            // About 5 km in one second, an impossible 18000 km/h.
            let prev = update(t0, 0.0, 0.0);
            let curr = update(t0 + chrono::Duration::seconds(1), 0.045, 0.0);

            let mut streak = 0;
            let anomalies =
                detector().inspect(Some(&prev), &curr, &test_line(), &InMemoryRegistry::new(), &mut streak);
            let speed = anomalies
                .iter()
                .find(|a| matches!(a.kind, AnomalyKind::Speed { .. }))
                .unwrap();
            assert_eq!(speed.severity, Severity::High);
            match speed.kind {
                AnomalyKind::Speed {
                    observed_kmh: Some(v),
                } => assert!(v > 15_000.0, "observed {v}"),
                ref other => panic!("expected observed speed, got {other:?}"),
            }
        }

        #[test]
        fn test_speed_exactly_at_ceiling_is_not_flagged() {
            let config = AnomalyConfig::default();
            let det = AnomalyDetector::new(config.clone());
            let t0 = base_time();
            let prev = update(t0, 0.0, 0.0);
            // Choose the elapsed time so the derived speed is exactly the
            // ceiling: distance / ceiling hours.
            let distance_km =
                geo::distance_km(prev.coordinate(), Coordinate {
                    latitude: 0.01,
                    longitude: 0.0,
                });
            let elapsed_ms =
                (distance_km / config.max_plausible_speed_kmh * 3600.0 * 1000.0).ceil() as i64;
            let curr = update(t0 + chrono::Duration::milliseconds(elapsed_ms), 0.01, 0.0);

            let mut streak = 0;
            let anomalies =
                det.inspect(Some(&prev), &curr, &test_line(), &InMemoryRegistry::new(), &mut streak);
            assert!(
                !anomalies
                    .iter()
                    .any(|a| matches!(a.kind, AnomalyKind::Speed { .. })),
                "threshold must be strict"
            );
        }

        #[test]
        fn test_speed_just_above_ceiling_is_flagged() {
            let config = AnomalyConfig::default();
            let det = AnomalyDetector::new(config.clone());
            let t0 = base_time();
            let prev = update(t0, 0.0, 0.0);
            let distance_km = geo::distance_km(prev.coordinate(), Coordinate {
                latitude: 0.01,
                longitude: 0.0,
            });
            // Shave a second off the at-ceiling travel time so the derived
            // speed lands just past the limit.
            let elapsed_ms =
                (distance_km / config.max_plausible_speed_kmh * 3600.0 * 1000.0).ceil() as i64
                    - 1000;
            let curr = update(t0 + chrono::Duration::milliseconds(elapsed_ms), 0.01, 0.0);

            let mut streak = 0;
            let anomalies =
                det.inspect(Some(&prev), &curr, &test_line(), &InMemoryRegistry::new(), &mut streak);
            assert!(anomalies
                .iter()
                .any(|a| matches!(a.kind, AnomalyKind::Speed { .. })));
        }

        #[test]
        fn test_zero_elapsed_nonzero_distance_is_high_severity() {
            let t0 = base_time();
            let prev = update(t0, 0.0, 0.0);
            let curr = update(t0, 0.01, 0.0);

            let mut streak = 0;
            let anomalies =
                detector().inspect(Some(&prev), &curr, &test_line(), &InMemoryRegistry::new(), &mut streak);
            let speed = anomalies
                .iter()
                .find(|a| matches!(a.kind, AnomalyKind::Speed { .. }))
                .unwrap();
            assert_eq!(speed.severity, Severity::High);
            assert!(matches!(
                speed.kind,
                AnomalyKind::Speed { observed_kmh: None }
            ));
        }

        #[test]
        fn test_first_update_has_no_speed_check() {
            let curr = update(base_time(), 0.0, 0.0);
            let mut streak = 0;
            let anomalies =
                detector().inspect(None, &curr, &test_line(), &InMemoryRegistry::new(), &mut streak);
            assert!(anomalies.is_empty());
        }
    }

    mod deviation {
        use super::*;

        #[test]
        fn test_deviation_needs_two_consecutive_off_route_updates() {
            let det = detector();
            let line = test_line();
            let registry = InMemoryRegistry::new();
            let t0 = base_time();

            // About 1.1 km east of the route, far beyond 500 m.
            let off1 = update(t0, 0.05, 0.01);
            let off2 = update(t0 + chrono::Duration::seconds(60), 0.051, 0.01);

            let mut streak = 0;
            let first = det.inspect(None, &off1, &line, &registry, &mut streak);
            assert!(first
                .iter()
                .all(|a| !matches!(a.kind, AnomalyKind::RouteDeviation { .. })));
            assert_eq!(streak, 1);

            let second = det.inspect(Some(&off1), &off2, &line, &registry, &mut streak);
            let deviation = second
                .iter()
                .find(|a| matches!(a.kind, AnomalyKind::RouteDeviation { .. }))
                .expect("second consecutive off-route update fires");
            match &deviation.kind {
                AnomalyKind::RouteDeviation { off_route_m } => {
                    assert!(*off_route_m > 500.0);
                }
                _ => unreachable!(),
            }
        }

        #[test]
        fn test_on_route_update_resets_streak() {
            let det = detector();
            let line = test_line();
            let registry = InMemoryRegistry::new();
            let t0 = base_time();

            let mut streak = 0;
            let off1 = update(t0, 0.05, 0.01);
            det.inspect(None, &off1, &line, &registry, &mut streak);
            assert_eq!(streak, 1);

            // Back on the route.
            let on = update(t0 + chrono::Duration::seconds(60), 0.05, 0.0);
            det.inspect(Some(&off1), &on, &line, &registry, &mut streak);
            assert_eq!(streak, 0);

            // Off again: a fresh streak, so still no anomaly.
            let off2 = update(t0 + chrono::Duration::seconds(120), 0.05, 0.01);
            let anomalies = det.inspect(Some(&on), &off2, &line, &registry, &mut streak);
            assert!(anomalies
                .iter()
                .all(|a| !matches!(a.kind, AnomalyKind::RouteDeviation { .. })));
        }

        #[test]
        fn test_segment_geometry_beats_straight_line() {
            // Route geometry detours east through (0.05, 0.02); a point near
            // the detour is on-route even though it is far from the straight
            // line between the stops.
            let registry = InMemoryRegistry::new();
            registry.insert_segment(crate::model::RouteSegment {
                from_stop: StopId::from("a"),
                to_stop: StopId::from("b"),
                geometry: vec![
                    Coordinate { latitude: 0.0, longitude: 0.0 },
                    Coordinate { latitude: 0.05, longitude: 0.02 },
                    Coordinate { latitude: 0.1, longitude: 0.0 },
                ],
                distance_km: 12.0,
                nominal_duration_min: 25.0,
            });

            let det = detector();
            let line = test_line();
            let near_detour = update(base_time(), 0.05, 0.02);

            let mut streak = 5;
            det.inspect(None, &near_detour, &line, &registry, &mut streak);
            assert_eq!(streak, 0, "point on the detour is on-route");
        }

        #[test]
        fn test_single_stop_line_never_deviates() {
            let line = LineSnapshot::new(
                LineId::from("l1"),
                "Stub",
                "#000000",
                vec![stop("a", 0, 0.0, 0.0)],
            )
            .unwrap();
            let far = update(base_time(), 5.0, 5.0);
            let mut streak = 0;
            let anomalies =
                detector().inspect(None, &far, &line, &InMemoryRegistry::new(), &mut streak);
            assert!(anomalies.is_empty());
            assert_eq!(streak, 0);
        }
    }

    mod bunching {
        use super::*;

        fn active_trip(id: &str, lat: f64, lon: f64) -> TripSnapshot {
            TripSnapshot {
                id: TripId::from(id),
                line_id: LineId::from("l1"),
                bus_id: BusId::from("b"),
                driver_id: DriverId::from("d"),
                state: TripState::Active,
                started_at: Some(base_time()),
                ended_at: None,
                last_update: Some(update(base_time(), lat, lon)),
                stop_pointer: 0,
                update_count: 1,
                last_activity: base_time(),
                summary: None,
            }
        }

        #[test]
        fn test_close_pair_flags_both_trips() {
            let trips = vec![
                active_trip("t1", 0.0, 0.0),
                active_trip("t2", 0.002, 0.0), // ~220 m apart
                active_trip("t3", 0.5, 0.0),   // ~55 km away
            ];
            let anomalies = detect_bunching(&trips, &AnomalyConfig::default(), base_time());
            assert_eq!(anomalies.len(), 2);
            let flagged: Vec<_> = anomalies.iter().map(|a| a.trip_id.as_str()).collect();
            assert!(flagged.contains(&"t1") && flagged.contains(&"t2"));
        }

        #[test]
        fn test_trip_without_updates_is_skipped() {
            let mut silent = active_trip("t1", 0.0, 0.0);
            silent.last_update = None;
            let trips = vec![silent, active_trip("t2", 0.0, 0.0)];
            assert!(detect_bunching(&trips, &AnomalyConfig::default(), base_time()).is_empty());
        }
    }

    mod log {
        use super::*;

        fn bunching(trip: &str, other: &str, at: DateTime<Utc>) -> Anomaly {
            Anomaly {
                trip_id: TripId::from(trip),
                detected_at: at,
                severity: Severity::Medium,
                kind: AnomalyKind::Bunching {
                    other_trip: TripId::from(other),
                    separation_km: 0.2,
                },
            }
        }

        #[test]
        fn test_recent_count_respects_window() {
            let log = AnomalyLog::new();
            let now = base_time();
            log.record(bunching("t1", "t2", now - chrono::Duration::minutes(45)));
            log.record(bunching("t1", "t2", now - chrono::Duration::minutes(5)));

            let window = Duration::from_secs(30 * 60);
            assert_eq!(log.recent_count(&TripId::from("t1"), window, now), 1);
            assert_eq!(log.recent_count(&TripId::from("t2"), window, now), 0);
        }

        #[test]
        fn test_recent_bunching_matches_pair() {
            let log = AnomalyLog::new();
            let now = base_time();
            log.record(bunching("t1", "t2", now - chrono::Duration::minutes(5)));

            let window = Duration::from_secs(30 * 60);
            assert!(log.recent_bunching(&TripId::from("t1"), &TripId::from("t2"), window, now));
            assert!(!log.recent_bunching(&TripId::from("t1"), &TripId::from("t9"), window, now));
            assert!(!log.recent_bunching(&TripId::from("t2"), &TripId::from("t1"), window, now));
        }
    }
}
