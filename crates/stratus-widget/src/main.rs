//! Satellite read-only process: shows the last committed snapshot without
//! ever fetching. Stands in for a home-screen widget sharing the durable
//! cache with the main application.

use anyhow::{bail, Result};
use stratus_weather::CacheReader;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let Some(shared_dir) = std::env::args().nth(1) else {
        bail!("usage: stratus-widget <shared-cache-dir>");
    };

    let reader = CacheReader::open(&shared_dir);
    tracing::info!("Reading shared cache at {}", shared_dir);

    match reader.last_known_location() {
        Some(location) => {
            let label = location.label.as_deref().unwrap_or("(unnamed)");
            println!("Last known location: {} ({})", label, location.coordinate);
        }
        None => println!("No known location yet."),
    }

    match reader.load() {
        Some(record) => {
            let snapshot = &record.snapshot;
            println!(
                "{}: {:.1}° (feels like {:.1}°), {}",
                snapshot.fetched_at.format("%Y-%m-%d %H:%M UTC"),
                snapshot.current.temperature,
                snapshot.current.feels_like,
                snapshot.current.condition.description(),
            );
            if let Some(air) = &snapshot.air_quality {
                println!("Air quality: AQI {}", air.european_aqi);
            }
            for alert in &snapshot.alerts {
                println!("Alert [{}]: {}", alert.severity, alert.headline);
            }
        }
        None => println!("No cached weather yet. Open the app to fetch."),
    }

    Ok(())
}
