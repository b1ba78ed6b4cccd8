//! Audio data path: jitter buffer, WAVE sources and device playback

pub mod buffer;
#[cfg(feature = "receiver")]
pub mod output;
pub mod tone;
pub mod wav;

pub use buffer::{Consumer, Producer, RingBuffer, RingMonitor, Sample};
#[cfg(feature = "receiver")]
pub use output::AudioOutput;
pub use wav::{PcmFormat, PcmSource, WaveFormat};
