//! Multicast Audio Sender
//!
//! Streams a WAV file (or a generated test tone) to the configured multicast group.
//!
//! Usage: `sender [FILE.wav]`

use anyhow::{Context, Result};
use bytes::Bytes;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_multicast_audio::{
    audio::{tone::sine_wav, PcmSource},
    config::AppConfig,
    session::SenderSession,
};

/// Tone used when no file is given
const TEST_TONE_HZ: f32 = 440.0;
const TEST_TONE_RATE: u32 = 48_000;

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting multicast audio sender");

    let config = AppConfig::load_or_default()?;

    let blob = match std::env::args().nth(1) {
        Some(path) => {
            tracing::info!("Streaming {}", path);
            Bytes::from(std::fs::read(&path).with_context(|| format!("reading {}", path))?)
        }
        None => {
            tracing::info!("No file given, streaming a {} Hz test tone", TEST_TONE_HZ);
            sine_wav(TEST_TONE_HZ, TEST_TONE_RATE, 2, Duration::from_secs(1))?
        }
    };
    let source = PcmSource::parse(blob)?;

    println!("\n=== Source ===");
    println!("  Sample rate: {} Hz", source.format().sample_rate());
    println!("  Channels: {}", source.format().channels());
    println!("  Bits/sample: {}", source.format().bits_per_sample());
    println!("  Duration: {:.2}s", source.duration().as_secs_f32());
    println!();

    let mut session = SenderSession::new(config.network.clone(), config.sender.clone(), source);
    let _ = session.join()?;
    let _ = session.start_sending()?;

    tracing::info!(
        "Sending to {}:{} every {:?} - press Ctrl+C to stop",
        config.network.group,
        config.network.port,
        session.period()
    );

    loop {
        std::thread::sleep(Duration::from_secs(5));

        let stats = session.stats();
        tracing::info!(
            "Stats: {} datagrams sent, {:.1} KB sent, {} failures",
            stats.datagrams_sent,
            stats.bytes_sent as f64 / 1024.0,
            stats.send_failures
        );
    }
}
