//! Caller Application
//!
//! Plays the probe tone, captures the microphone, embeds the watermark and
//! streams the result to a callee over UDP.
//!
//! Usage: `caller <host[:port]> [config.toml]`

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use watermark_link::{
    audio::{device::list_devices, CpalHost},
    config::AppConfig,
    session::{Caller, Transition},
    watermark::IdentityEmbedder,
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

    tracing::info!("Starting watermark caller");

    let mut args = std::env::args().skip(1);
    let remote = args
        .next()
        .context("usage: caller <host[:port]> [config.toml]")?;
    let config = match args.next() {
        Some(path) => AppConfig::load(Path::new(&path))?,
        None => AppConfig::load_or_default()?,
    };

    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}", device.name, device_type, default_marker);
    }
    println!();

    // Reference embedder: passes audio through at the transport rate
    let embedder = IdentityEmbedder::new(
        config.watermark.transport_rate,
        config.watermark.window_frames,
    );
    let playback = config.audio.playback_device.clone();
    let record = config.audio.record_device.clone();
    let caller = Arc::new(Caller::new(config, Arc::new(CpalHost::new()), Box::new(embedder))?);

    match caller.start_call(&remote, &playback, &record)? {
        Transition::Applied => tracing::info!("Call running - press Ctrl+C to hang up"),
        other => tracing::warn!("Call not started: {:?}", other),
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                for fault in caller.faults() {
                    tracing::warn!("Device fault: {}", fault);
                }
                let stats = caller.stats();
                if let (Some(sender), Some(recorder)) = (stats.sender, stats.recorder) {
                    tracing::info!(
                        "Stats: {} samples captured ({} blocks dropped), {} windows embedded, {} packets sent, {:.1} KB sent",
                        recorder.captured,
                        recorder.dropped,
                        stats.embedded_windows,
                        sender.packets_sent,
                        sender.bytes_sent as f64 / 1024.0
                    );
                }
            }
        }
    }

    caller.stop_call();
    tracing::info!("Caller shut down");
    Ok(())
}
