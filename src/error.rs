//! Error types for the multicast audio streaming engine

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Ring buffer error: {0}")]
    Ring(#[from] RingError),

    #[error("PCM source error: {0}")]
    Pcm(#[from] PcmError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Audio output error: {0}")]
    Output(#[from] OutputError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Ring buffer construction errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    #[error("Invalid capacity exponent {exponent}: must be within 2..=16")]
    InvalidCapacity { exponent: u32 },
}

/// WAVE container errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PcmError {
    #[error("Malformed container: {reason}")]
    MalformedContainer { reason: &'static str },

    #[error("Unsupported audio format code: {code:#06x}")]
    UnsupportedFormat { code: u16 },

    #[error("Unrepresentable PCM layout: {channels} channel(s) at {sample_rate} Hz")]
    InvalidLayout { channels: u16, sample_rate: u32 },
}

impl PcmError {
    pub(crate) fn malformed(reason: &'static str) -> Self {
        PcmError::MalformedContainer { reason }
    }
}

/// Multicast transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to resolve {address}: {source}")]
    Resolution {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Socket setup failed while {step}: {source}")]
    Socket {
        step: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Failed to join multicast group {group}: {source}")]
    Join {
        group: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Send failed: {0}")]
    Send(#[source] io::Error),

    #[error("Receive failed: {0}")]
    Receive(#[source] io::Error),

    #[error("Datagram larger than the {capacity} byte receive buffer")]
    Truncated { capacity: usize },
}

impl TransportError {
    pub(crate) fn socket(step: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| TransportError::Socket { step, source }
    }
}

/// Session failures (invalid transitions are not errors, see `session::Transition`)
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to spawn background loop: {0}")]
    Spawn(#[source] io::Error),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Playback device errors (receiver binary only)
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("No default output device")]
    NoDevice,

    #[error("Unsupported sample format: {0} bits per sample")]
    UnsupportedFormat(u16),

    #[error("Failed to open stream: {0}")]
    StreamError(String),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
