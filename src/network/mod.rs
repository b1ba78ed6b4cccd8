//! Network subsystem for UDP multicast audio transport

pub mod multicast;

pub use multicast::MulticastTransport;
