//! Multicast Audio Receiver
//!
//! Joins the configured multicast group and plays the stream on the default
//! output device. Datagrams carry no format header, so the stream format is
//! given on the command line.
//!
//! Usage: `receiver [SAMPLE_RATE] [CHANNELS]` (defaults: 48000 2)

use anyhow::{Context, Result};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_multicast_audio::{
    audio::{AudioOutput, PcmFormat, WaveFormat},
    config::AppConfig,
    session::ReceiverSession,
};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting multicast audio receiver");

    let config = AppConfig::load_or_default()?;

    let mut args = std::env::args().skip(1);
    let sample_rate: u32 = match args.next() {
        Some(arg) => arg.parse().context("invalid sample rate")?,
        None => 48_000,
    };
    let channels: u16 = match args.next() {
        Some(arg) => arg.parse().context("invalid channel count")?,
        None => 2,
    };
    let format = WaveFormat::Pcm(PcmFormat::pcm16(channels, sample_rate)?);

    let mut session = ReceiverSession::new(config.network.clone(), config.receiver.clone())?;
    let _ = session.join()?;
    let _ = session.start_receiving()?;

    // Playback is optional - there may be no output device.
    let mut output = match AudioOutput::new(&format) {
        Ok(output) => Some(output),
        Err(e) => {
            tracing::warn!("Playback disabled: {}", e);
            None
        }
    };
    if let (Some(output), Some(puller)) = (output.as_mut(), session.take_puller()) {
        output.start(puller)?;
        let _ = session.start_playing();
        tracing::info!("Playing {} Hz, {} channel(s)", sample_rate, channels);
    }

    tracing::info!(
        "Listening on {}:{} - press Ctrl+C to stop",
        config.network.group,
        config.network.port
    );

    loop {
        std::thread::sleep(Duration::from_secs(5));

        if let Some(err) = output.as_ref().and_then(|o| o.check_errors()) {
            tracing::warn!("Output stream error: {}", err);
        }

        let stats = session.stats();
        tracing::info!(
            "Receiver stats: {} datagrams, {:.1} KB, {} truncated, {} underruns, buffer {}/{} ({} dropped)",
            stats.datagrams_received,
            stats.bytes_received as f64 / 1024.0,
            stats.truncated,
            stats.underruns,
            stats.buffered,
            stats.capacity,
            stats.dropped_bytes
        );
    }
}
