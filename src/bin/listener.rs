//! Listening peer
//!
//! Waits for the calling peer on the configured port, then streams duplex
//! audio until Ctrl+C or a transport fault.

use anyhow::Result;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use duplex_audio_link::{
    audio::{device::list_devices, CpalCapture, CpalPlayback},
    config::AppConfig,
    net::Connection,
    session::{SessionEvent, StreamingSession},
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

    tracing::info!("Starting duplex audio listener");

    let config = AppConfig::load()?;

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

    let port = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(config.network.listen_port);

    let capture = CpalCapture::new(
        config.stream.sample_rate,
        config.stream.channels,
        config.stream.capture_ring_samples(),
    );
    let playback = CpalPlayback::new(config.stream.sample_rate, config.stream.channels);

    let (mut session, events) =
        StreamingSession::new(config.stream.clone(), Box::new(capture), Box::new(playback))?;

    tracing::info!("Waiting for a peer on port {}", port);
    let conn = tokio::task::spawn_blocking(move || Connection::listen(port)).await??;
    tracing::info!("Peer connected from {}", conn.peer());

    session.attach(conn)?;

    run_until_shutdown(&mut session, events).await;
    Ok(())
}

async fn run_until_shutdown(
    session: &mut StreamingSession,
    events: crossbeam_channel::Receiver<SessionEvent>,
) {
    let mut poll = tokio::time::interval(Duration::from_millis(50));
    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, shutting down");
                session.stop();
                break;
            }
            _ = poll.tick() => {
                let mut stopped = false;
                while let Ok(event) = events.try_recv() {
                    match event {
                        SessionEvent::Connected => tracing::info!("Link established"),
                        SessionEvent::Fault(reason) => {
                            tracing::error!("Transport fault: {}", reason);
                            session.stop();
                        }
                        SessionEvent::Stopped => stopped = true,
                    }
                }
                if stopped {
                    break;
                }

                // Periodic stats logging
                ticks += 1;
                if ticks % 100 == 0 {
                    let stats = session.stats();
                    tracing::info!(
                        "Stats: {} frames sent ({:.1} KB), {} received ({:.1} KB), {} undecodable",
                        stats.frames_sent,
                        stats.bytes_sent as f64 / 1024.0,
                        stats.frames_received,
                        stats.bytes_received as f64 / 1024.0,
                        stats.decode_failures,
                    );
                }
            }
        }
    }
}
