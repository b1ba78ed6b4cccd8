//! # LAN Multicast Audio
//!
//! Linear-PCM streaming from one sender to many receivers over IP multicast.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                                SENDER                                 │
//! │  ┌──────────────┐     ┌──────────────────────────────────────────┐    │
//! │  │  PcmSource   │────▶│ SenderSession (session::sender)          │    │
//! │  │ (audio::wav) │     │  send loop thread: one chunk per period  │    │
//! │  └──────────────┘     └────────────────────┬─────────────────────┘    │
//! │                                            ▼                          │
//! │                       ┌──────────────────────────────────────────┐    │
//! │                       │ MulticastTransport (network::multicast)  │    │
//! │                       │   datagrams: [raw PCM bytes, no header]  │    │
//! │                       └────────────────────┬─────────────────────┘    │
//! └────────────────────────────────────────────┼──────────────────────────┘
//!                                              │ UDP multicast group
//!                                              ▼
//! ┌────────────────────────────────────────────┼──────────────────────────┐
//! │                               RECEIVER     │                          │
//! │                       ┌────────────────────┴─────────────────────┐    │
//! │                       │ MulticastTransport (network::multicast)  │    │
//! │                       └────────────────────┬─────────────────────┘    │
//! │                                            ▼                          │
//! │                       ┌──────────────────────────────────────────┐    │
//! │                       │ ReceiverSession (session::receiver)      │    │
//! │                       │  receive loop thread: Producer::push     │    │
//! │                       └────────────────────┬─────────────────────┘    │
//! │                                            ▼                          │
//! │                       ┌──────────────────────────────────────────┐    │
//! │                       │ RingBuffer<u8> jitter buffer             │    │
//! │                       │  (audio::buffer, overwrite-oldest SPSC)  │    │
//! │                       └────────────────────┬─────────────────────┘    │
//! │                                            ▼                          │
//! │                       ┌──────────────────────────────────────────┐    │
//! │                       │ PlaybackPuller::pull (device callback)   │    │
//! │                       │   zero-fills on underrun, never blocks   │    │
//! │                       └──────────────────────────────────────────┘    │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod network;
pub mod session;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default multicast group (administratively scoped)
    pub const DEFAULT_MULTICAST_GROUP: &str = "239.255.77.77";

    /// Default UDP port for audio streaming
    pub const DEFAULT_UDP_PORT: u16 = 7355;

    /// Default multicast TTL (stay on the local subnet)
    pub const DEFAULT_TTL: u32 = 1;

    /// Default payload bytes per datagram
    pub const DEFAULT_CHUNK_SIZE: usize = 1024;

    /// Largest UDP payload over IPv4
    pub const MAX_DATAGRAM_SIZE: usize = 65_507;

    /// Default jitter buffer size exponent (64 KiB)
    pub const DEFAULT_CAPACITY_EXPONENT: u32 = 16;

    /// Default receive loop cancellation wait in milliseconds
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 20;
}
