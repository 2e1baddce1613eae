//! Background housekeeping daemon.
//!
//! Periodically aborts trips that stopped reporting and scans each line for
//! bus bunching. One sweep is a bounded pass over current snapshots, so the
//! daemon never holds a trip lock across an await point.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::anomaly::{self, AnomalyConfig, AnomalyLog};
use crate::registry::LineRegistry;
use crate::telemetry::EngineMetrics;
use crate::trip::TripStore;
use crate::viz::VisualizationCache;

/// Sweep cadence and expiry limits.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Active trips silent for longer than this are aborted.
    pub inactivity_timeout: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            inactivity_timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub trips_expired: usize,
    pub bunching_flagged: usize,
}

/// Expires inactive trips and flags bunched buses on a timer.
pub struct InactivitySweeper {
    store: Arc<TripStore>,
    lines: Arc<dyn LineRegistry>,
    log: Arc<AnomalyLog>,
    viz: Arc<VisualizationCache>,
    metrics: Arc<EngineMetrics>,
    anomaly_config: AnomalyConfig,
    config: SweepConfig,
}

impl InactivitySweeper {
    pub fn new(
        store: Arc<TripStore>,
        lines: Arc<dyn LineRegistry>,
        log: Arc<AnomalyLog>,
        viz: Arc<VisualizationCache>,
        metrics: Arc<EngineMetrics>,
        anomaly_config: AnomalyConfig,
        config: SweepConfig,
    ) -> Self {
        Self {
            store,
            lines,
            log,
            viz,
            metrics,
            anomaly_config,
            config,
        }
    }

    /// Run sweeps until the token is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            interval_secs = self.config.interval.as_secs(),
            timeout_secs = self.config.inactivity_timeout.as_secs(),
            "sweeper started"
        );
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("sweeper shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let report = self.sweep_once(Utc::now());
                    if report != SweepReport::default() {
                        info!(
                            expired = report.trips_expired,
                            bunching = report.bunching_flagged,
                            "sweep finished"
                        );
                    } else {
                        debug!("sweep finished, nothing to do");
                    }
                }
            }
        }
    }

    /// One synchronous sweep pass.
    pub fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        let expired = self.store.expire_stale(self.config.inactivity_timeout, now);
        for (trip_id, line_id) in &expired {
            warn!(trip = %trip_id, line = %line_id, "trip expired after inactivity");
            self.viz.invalidate(line_id);
        }
        self.metrics.trips_expired(expired.len() as u64);
        report.trips_expired = expired.len();

        for line in self.lines.lines() {
            let trips = self.store.active_on_line(&line.id);
            if trips.len() < 2 {
                continue;
            }
            for anomaly in anomaly::detect_bunching(&trips, &self.anomaly_config, now) {
                let crate::model::AnomalyKind::Bunching { ref other_trip, .. } = anomaly.kind
                else {
                    continue;
                };
                if self.log.recent_bunching(
                    &anomaly.trip_id,
                    other_trip,
                    self.anomaly_config.bunching_dedupe_window,
                    now,
                ) {
                    continue;
                }
                warn!(
                    trip = %anomaly.trip_id,
                    other = %other_trip,
                    line = %line.id,
                    "bus bunching detected"
                );
                self.log.record(anomaly);
                report.bunching_flagged += 1;
            }
        }
        self.metrics.anomalies_flagged(report.bunching_flagged as u64);

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Coordinate;
    use crate::model::{
        BusId, DriverId, LineId, LineSnapshot, LocationUpdate, StopId, StopSnapshot, TripId,
        TripState,
    };
    use crate::registry::InMemoryRegistry;
    use crate::viz::VizConfig;
    use chrono::TimeZone;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

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

    struct Fixture {
        store: Arc<TripStore>,
        log: Arc<AnomalyLog>,
        sweeper: InactivitySweeper,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(InMemoryRegistry::new());
            registry.insert_line(
                LineSnapshot::new(
                    LineId::from("l1"),
                    "Line 1",
                    "#445566",
                    vec![stop("a", 0, 0.0), stop("b", 1, 0.1)],
                )
                .unwrap(),
            );
            let store = Arc::new(TripStore::new());
            let log = Arc::new(AnomalyLog::new());
            let sweeper = InactivitySweeper::new(
                Arc::clone(&store),
                registry as Arc<dyn LineRegistry>,
                Arc::clone(&log),
                Arc::new(VisualizationCache::new(VizConfig::default())),
                Arc::new(EngineMetrics::new()),
                AnomalyConfig::default(),
                SweepConfig::default(),
            );
            Self {
                store,
                log,
                sweeper,
            }
        }

        fn active_trip(&self, id: &str, lat: f64, started: DateTime<Utc>) {
            let trip_id = TripId::from(id);
            self.store
                .create_at(
                    trip_id.clone(),
                    LineId::from("l1"),
                    BusId::from("b1"),
                    DriverId::from("d1"),
                    started,
                )
                .unwrap();
            self.store.start_at(&trip_id, started).unwrap();
            self.store
                .with_active_mut(&trip_id, |trip| {
                    trip.append(LocationUpdate {
                        trip_id: trip_id.clone(),
                        timestamp: started,
                        latitude: lat,
                        longitude: 0.0,
                        accuracy_m: 10.0,
                        speed_kmh: None,
                        heading_deg: None,
                    });
                    Ok(())
                })
                .unwrap();
        }
    }

    #[test]
    fn test_sweep_expires_silent_trips() {
        let fx = Fixture::new();
        let now = base_time();
        fx.active_trip("stale", 0.01, now - chrono::Duration::minutes(20));
        fx.active_trip("fresh", 0.09, now - chrono::Duration::minutes(1));

        let report = fx.sweeper.sweep_once(now);
        assert_eq!(report.trips_expired, 1);
        assert_eq!(
            fx.store.snapshot(&TripId::from("stale")).unwrap().state,
            TripState::Aborted
        );
        assert_eq!(
            fx.store.snapshot(&TripId::from("fresh")).unwrap().state,
            TripState::Active
        );
    }

    #[test]
    fn test_sweep_flags_bunched_pair_once() {
        let fx = Fixture::new();
        let now = base_time();
        // Two fresh trips ~110 m apart.
        fx.active_trip("t1", 0.010, now);
        fx.active_trip("t2", 0.011, now);

        let first = fx.sweeper.sweep_once(now);
        assert_eq!(first.bunching_flagged, 2);
        assert_eq!(fx.log.for_trip(&TripId::from("t1")).len(), 1);

        // Within the dedupe window nothing is re-reported.
        let second = fx.sweeper.sweep_once(now + chrono::Duration::minutes(5));
        assert_eq!(second.bunching_flagged, 0);

        // Keep both trips reporting so they survive inactivity expiry.
        let later = now + chrono::Duration::minutes(40);
        for id in ["t1", "t2"] {
            fx.store
                .with_active_mut(&TripId::from(id), |trip| {
                    trip.last_activity = later;
                    Ok(())
                })
                .unwrap();
        }

        // After the window the pair is reported again.
        let third = fx.sweeper.sweep_once(later);
        assert_eq!(third.bunching_flagged, 2);
    }

    #[test]
    fn test_sweep_on_empty_store_is_noop() {
        let fx = Fixture::new();
        assert_eq!(fx.sweeper.sweep_once(base_time()), SweepReport::default());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancellation() {
        let fx = Fixture::new();
        let token = CancellationToken::new();
        let handle = tokio::spawn(fx.sweeper.run(token.clone()));
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper exits promptly")
            .unwrap();
    }
}
