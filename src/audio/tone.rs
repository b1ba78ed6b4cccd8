//! In-memory canonical WAVE synthesis
//!
//! Stands in for the tone resources a sender would ship with, and gives tests
//! deterministic containers to parse.

use bytes::{BufMut, Bytes, BytesMut};
use std::f32::consts::TAU;
use std::time::Duration;

use crate::audio::wav::{PcmFormat, FORMAT_PCM};
use crate::error::PcmError;

/// Canonical 44-byte header followed by `data`
pub fn encode_wav(format: &PcmFormat, data: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(44 + data.len());

    out.put_slice(b"RIFF");
    out.put_u32_le(36 + data.len() as u32);
    out.put_slice(b"WAVE");

    out.put_slice(b"fmt ");
    out.put_u32_le(16);
    out.put_u16_le(FORMAT_PCM);
    out.put_u16_le(format.channels);
    out.put_u32_le(format.sample_rate);
    out.put_u32_le(format.byte_rate);
    out.put_u16_le(format.block_align);
    out.put_u16_le(format.bits_per_sample);

    out.put_slice(b"data");
    out.put_u32_le(data.len() as u32);
    out.put_slice(data);

    out.freeze()
}

/// 16-bit PCM sine tone at half scale, identical on every channel
pub fn sine_wav(
    frequency: f32,
    sample_rate: u32,
    channels: u16,
    duration: Duration,
) -> Result<Bytes, PcmError> {
    let format = PcmFormat::pcm16(channels, sample_rate)?;
    let frames = (duration.as_secs_f64() * sample_rate as f64).round() as usize;
    let mut data = BytesMut::with_capacity(frames * format.block_align as usize);

    for n in 0..frames {
        let phase = TAU * frequency * n as f32 / sample_rate as f32;
        let sample = (phase.sin() * i16::MAX as f32 * 0.5) as i16;
        for _ in 0..channels {
            data.put_i16_le(sample);
        }
    }

    Ok(encode_wav(&format, &data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav::{PcmSource, WaveFormat};

    #[test]
    fn test_sine_round_trips_through_parser() {
        let blob = sine_wav(440.0, 8000, 2, Duration::from_millis(100)).unwrap();
        let source = PcmSource::parse(blob).unwrap();

        assert_eq!(source.format(), &WaveFormat::Pcm(PcmFormat::pcm16(2, 8000).unwrap()));
        assert_eq!(source.len(), 800 * 4);
        assert_eq!(source.duration(), Duration::from_millis(100));

        // Starts at zero phase on both channels.
        assert_eq!(&source.data()[..4], &[0, 0, 0, 0]);
    }
}
