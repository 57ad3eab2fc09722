//! Callee Application
//!
//! Listens for a caller, plays the received audio and logs the watermark
//! detection results.
//!
//! Usage: `callee [config.toml]`

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use watermark_link::{
    audio::{device::list_devices, CpalHost},
    config::AppConfig,
    session::{Callee, Transition},
    watermark::ConstantDetector,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting watermark callee");

    let config = match std::env::args().nth(1) {
        Some(path) => AppConfig::load(Path::new(&path))?,
        None => AppConfig::load_or_default()?,
    };

    println!("\n=== Available Output Devices ===");
    for device in list_devices().into_iter().filter(|d| d.is_output) {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}", device.name, default_marker);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    // Reference detector until a model is plugged in
    let detector = ConstantDetector::new(
        config.watermark.transport_rate,
        config.watermark.window_frames,
        0.0,
    );
    let playback = config.audio.playback_device.clone();
    let callee = Arc::new(Callee::new(config, Arc::new(CpalHost::new()), Box::new(detector))?);

    callee.set_on_results_callback(|probability, average| {
        tracing::info!("Watermark: {:.3} (average {:.3})", probability, average);
    });

    match callee.start_server(&playback)? {
        Transition::Applied => {
            if let Some(addr) = callee.local_addr() {
                tracing::info!("Waiting for a caller on {} - press Ctrl+C to stop", addr);
            }
        }
        other => tracing::warn!("Server not started: {:?}", other),
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                for fault in callee.faults() {
                    tracing::warn!("Device fault: {}", fault);
                }
                let stats = callee.stats();
                if let Some(receiver) = stats.receiver {
                    tracing::info!(
                        "Stats: {} packets ({} lost, {} invalid), {} windows scored ({} dropped)",
                        receiver.packets,
                        receiver.lost,
                        receiver.invalid,
                        stats.detector.windows,
                        stats.detector.dropped
                    );
                }
                if let Some(player) = stats.player {
                    tracing::debug!(
                        "Player: {} underruns, {} samples dropped",
                        player.underruns,
                        player.dropped
                    );
                }
            }
        }
    }

    callee.clear_results_callback();
    callee.stop();
    tracing::info!("Callee shut down");
    Ok(())
}
