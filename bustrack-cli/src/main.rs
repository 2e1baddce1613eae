//! Demo runner for the tracking engine.
//!
//! Seeds an in-memory registry with one line, drives a simulated bus along
//! it and prints arrival estimates while the engine ingests the updates.
//! Useful for eyeballing engine behavior without any external service.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bustrack::app::{Engine, EngineConfig, Registries};
use bustrack::geo::Coordinate;
use bustrack::ingest::LocationReport;
use bustrack::model::{
    BusId, BusSnapshot, DriverId, DriverSnapshot, LineId, LineSnapshot, StopId, StopSnapshot,
    TripId,
};
use bustrack::registry::InMemoryRegistry;

#[derive(Parser, Debug)]
#[command(name = "bustrack", version = bustrack::VERSION, about = "Bus tracking engine demo")]
struct Args {
    /// Seconds between simulated location reports.
    #[arg(long, default_value_t = 2)]
    report_interval: u64,

    /// Traffic factor applied to ETAs (1.0 is free flow).
    #[arg(long, default_value_t = 1.0)]
    traffic_factor: f64,

    /// Simulated bus speed in km/h.
    #[arg(long, default_value_t = 30.0)]
    bus_speed: f64,

    /// Print the line visualization payload once at startup.
    #[arg(long)]
    show_visualization: bool,
}

fn seed_registry() -> Arc<InMemoryRegistry> {
    let registry = Arc::new(InMemoryRegistry::new());

    // A short north-south demo line, roughly 11 km end to end.
    let stops = [
        ("terminal", "Terminal", 41.380, 2.140),
        ("market", "Market Square", 41.405, 2.155),
        ("university", "University", 41.430, 2.165),
        ("depot", "North Depot", 41.455, 2.170),
    ]
    .into_iter()
    .enumerate()
    .map(|(ordinal, (id, name, lat, lon))| StopSnapshot {
        id: StopId::from(id),
        name: name.to_string(),
        ordinal: ordinal as u32,
        coordinate: Coordinate {
            latitude: lat,
            longitude: lon,
        },
    })
    .collect();

    let line = LineSnapshot::new(LineId::from("demo-line"), "Demo Line", "#e63946", stops)
        .expect("demo line stops are valid");
    registry.insert_line(line);
    registry.insert_bus(BusSnapshot {
        id: BusId::from("demo-bus"),
        capacity: 60,
        average_speed_kmh: 32.0,
    });
    registry.insert_driver(DriverSnapshot {
        id: DriverId::from("demo-driver"),
        name: "Demo Driver".to_string(),
        rating: 4.2,
    });
    registry
}

/// Post simulated reports walking the bus from the first stop to the last.
async fn drive_bus(
    engine: Engine,
    trip_id: TripId,
    speed_kmh: f64,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let line = LineId::from("demo-line");
    let Ok(viz) = engine.visualization_blocking(&line) else {
        error!("demo line missing, cannot simulate");
        return;
    };
    let waypoints: Vec<Coordinate> = viz
        .markers
        .iter()
        .map(|m| Coordinate {
            latitude: m.latitude,
            longitude: m.longitude,
        })
        .collect();

    // Degrees covered per tick at the requested speed, flat-earth is fine
    // for a demo this small.
    let step_km = speed_kmh * interval.as_secs_f64() / 3600.0;
    let mut position = waypoints[0];
    let mut target = 1usize;
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let report = LocationReport {
            trip_id: trip_id.clone(),
            timestamp: Utc::now(),
            latitude: position.latitude,
            longitude: position.longitude,
            accuracy_m: 8.0,
            speed_kmh: Some(speed_kmh),
            heading_deg: None,
        };
        match engine.record_location(report) {
            Ok(result) if result.completed => {
                info!("bus reached the terminus, trip complete");
                return;
            }
            Ok(result) => {
                info!(
                    pointer = result.stop_pointer,
                    anomalies = result.anomalies.len(),
                    "report accepted"
                );
            }
            Err(err) => {
                error!(error = %err, "report rejected");
                return;
            }
        }

        // Move towards the current target waypoint.
        if target < waypoints.len() {
            let goal = waypoints[target];
            let remaining = bustrack::geo::distance_km(position, goal);
            if remaining <= step_km {
                position = goal;
                target += 1;
            } else {
                let fraction = step_km / remaining;
                position = bustrack::geo::interpolate(position, goal, fraction);
            }
        }
    }
}

async fn print_arrivals(engine: Engine, shutdown: CancellationToken) {
    let stop = StopId::from("depot");
    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match engine.arrivals(stop.clone(), None).await {
            Ok(arrivals) => match serde_json::to_string_pretty(&arrivals) {
                Ok(json) => println!("{json}"),
                Err(err) => error!(error = %err, "arrivals not serializable"),
            },
            Err(err) => error!(error = %err, "arrivals query failed"),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let registry = seed_registry();
    let config = EngineConfig::new().with_traffic_factor(args.traffic_factor);
    let engine = Engine::new(config, Registries::from_single(registry));

    let trip_id = TripId::from("demo-trip");
    if let Err(err) = engine.create_trip(
        trip_id.clone(),
        LineId::from("demo-line"),
        BusId::from("demo-bus"),
        DriverId::from("demo-driver"),
    ) {
        error!(error = %err, "failed to create demo trip");
        return;
    }
    if let Err(err) = engine.start_trip(&trip_id) {
        error!(error = %err, "failed to start demo trip");
        return;
    }

    if args.show_visualization {
        match engine.visualization(LineId::from("demo-line")).await {
            Ok(viz) => match serde_json::to_string_pretty(&*viz) {
                Ok(json) => println!("{json}"),
                Err(err) => error!(error = %err, "visualization not serializable"),
            },
            Err(err) => error!(error = %err, "visualization failed"),
        }
    }

    let shutdown = CancellationToken::new();
    let sweeper = engine.spawn_sweeper(shutdown.clone());
    let driver = tokio::spawn(drive_bus(
        engine.clone(),
        trip_id,
        args.bus_speed,
        Duration::from_secs(args.report_interval),
        shutdown.clone(),
    ));
    let arrivals = tokio::spawn(print_arrivals(engine.clone(), shutdown.clone()));

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
    }
    info!("shutting down");
    shutdown.cancel();

    let _ = driver.await;
    let _ = arrivals.await;
    let _ = sweeper.await;

    let telemetry = engine.telemetry();
    info!(
        accepted = telemetry.updates_accepted,
        rejected = telemetry.updates_rejected,
        anomalies = telemetry.anomalies_flagged,
        "final counters"
    );
}
