//! Canonical RIFF/WAVE parsing and the sender's PCM source
//!
//! The container is parsed once; the sample region is kept as a zero-copy
//! [`Bytes`] view and sliced into datagram-sized chunks by the sender loop.

use bytes::Bytes;
use std::time::Duration;

use crate::error::PcmError;

/// Audio format code for integer PCM
pub const FORMAT_PCM: u16 = 0x0001;

/// Audio format code for WAVE_FORMAT_EXTENSIBLE
pub const FORMAT_EXTENSIBLE: u16 = 0xFFFE;

const RIFF_HEADER_LEN: usize = 12;
const CHUNK_HEADER_LEN: usize = 8;
const FMT_BASE_LEN: usize = 16;
const FMT_EXTENSIBLE_LEN: usize = 40;

/// Basic PCM layout shared by every supported format variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub channels: u16,
    pub sample_rate: u32,
    pub byte_rate: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
}

impl PcmFormat {
    /// Interleaved 16-bit PCM layout.
    ///
    /// Fails when there are no channels or the block align or byte rate
    /// does not fit the header fields.
    pub fn pcm16(channels: u16, sample_rate: u32) -> Result<Self, PcmError> {
        let invalid = PcmError::InvalidLayout {
            channels,
            sample_rate,
        };
        let block_align = match channels.checked_mul(2) {
            Some(align) if align > 0 => align,
            _ => return Err(invalid),
        };
        let byte_rate = sample_rate
            .checked_mul(block_align as u32)
            .ok_or(invalid)?;

        Ok(Self {
            channels,
            sample_rate,
            byte_rate,
            block_align,
            bits_per_sample: 16,
        })
    }

    /// Playback duration of `bytes` bytes at this format's byte rate
    pub fn duration_of(&self, bytes: usize) -> Duration {
        if self.byte_rate == 0 {
            return Duration::ZERO;
        }
        let nanos = bytes as u128 * 1_000_000_000 / self.byte_rate as u128;
        Duration::from_nanos(nanos as u64)
    }
}

/// Format sub-chunk contents, selected by the audio format code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveFormat {
    /// `WAVE_FORMAT_PCM`
    Pcm(PcmFormat),
    /// `WAVE_FORMAT_EXTENSIBLE` with a PCM sub-format
    Extensible {
        base: PcmFormat,
        valid_bits_per_sample: u16,
        channel_mask: u32,
        sub_format: [u8; 16],
    },
}

impl WaveFormat {
    pub fn base(&self) -> &PcmFormat {
        match self {
            WaveFormat::Pcm(base) | WaveFormat::Extensible { base, .. } => base,
        }
    }

    pub fn channels(&self) -> u16 {
        self.base().channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.base().sample_rate
    }

    pub fn bits_per_sample(&self) -> u16 {
        self.base().bits_per_sample
    }

    pub fn block_align(&self) -> u16 {
        self.base().block_align
    }

    pub fn byte_rate(&self) -> u32 {
        self.base().byte_rate
    }

    fn parse(chunk: &[u8]) -> Result<Self, PcmError> {
        if chunk.len() < FMT_BASE_LEN {
            return Err(PcmError::malformed("fmt chunk too short"));
        }

        let code = le_u16(chunk, 0);
        let base = PcmFormat {
            channels: le_u16(chunk, 2),
            sample_rate: le_u32(chunk, 4),
            byte_rate: le_u32(chunk, 8),
            block_align: le_u16(chunk, 12),
            bits_per_sample: le_u16(chunk, 14),
        };

        if base.channels == 0 || base.block_align == 0 {
            return Err(PcmError::malformed("zero channels or block align"));
        }

        match code {
            FORMAT_PCM => Ok(WaveFormat::Pcm(base)),
            FORMAT_EXTENSIBLE => {
                if chunk.len() < FMT_EXTENSIBLE_LEN {
                    return Err(PcmError::malformed("extensible fmt chunk too short"));
                }
                let mut sub_format = [0u8; 16];
                sub_format.copy_from_slice(&chunk[24..40]);

                // The first two GUID bytes carry the effective format code.
                let sub_code = u16::from_le_bytes([sub_format[0], sub_format[1]]);
                if sub_code != FORMAT_PCM {
                    return Err(PcmError::UnsupportedFormat { code: sub_code });
                }

                Ok(WaveFormat::Extensible {
                    base,
                    valid_bits_per_sample: le_u16(chunk, 18),
                    channel_mask: le_u32(chunk, 20),
                    sub_format,
                })
            }
            other => Err(PcmError::UnsupportedFormat { code: other }),
        }
    }
}

/// Read-only PCM view with a wrapping read cursor
#[derive(Debug, Clone)]
pub struct PcmSource {
    format: WaveFormat,
    data: Bytes,
    cursor: usize,
}

impl PcmSource {
    /// Parse a canonical WAVE blob.
    ///
    /// Sub-chunks other than `fmt ` and `data` are skipped. Any declared size
    /// that runs past the end of `bytes` is rejected.
    pub fn parse(bytes: Bytes) -> Result<Self, PcmError> {
        if bytes.len() < RIFF_HEADER_LEN {
            return Err(PcmError::malformed("truncated RIFF header"));
        }
        if &bytes[0..4] != b"RIFF" {
            return Err(PcmError::malformed("missing RIFF tag"));
        }

        let riff_size = le_u32(&bytes, 4) as usize;
        let end = riff_size
            .checked_add(CHUNK_HEADER_LEN)
            .filter(|&end| end <= bytes.len())
            .ok_or(PcmError::malformed("declared RIFF size exceeds buffer"))?;

        if &bytes[8..12] != b"WAVE" {
            return Err(PcmError::malformed("missing WAVE tag"));
        }

        let mut format = None;
        let mut data = None;
        let mut pos = RIFF_HEADER_LEN;

        while pos + CHUNK_HEADER_LEN <= end {
            let id = &bytes[pos..pos + 4];
            let size = le_u32(&bytes, pos + 4) as usize;
            let body_start = pos + CHUNK_HEADER_LEN;
            let body_end = body_start
                .checked_add(size)
                .filter(|&body_end| body_end <= end)
                .ok_or(PcmError::malformed("declared chunk size exceeds buffer"))?;

            match id {
                b"fmt " => format = Some(WaveFormat::parse(&bytes[body_start..body_end])?),
                b"data" => data = Some(bytes.slice(body_start..body_end)),
                _ => {}
            }

            if format.is_some() && data.is_some() {
                break;
            }

            // Odd-sized chunks are followed by a pad byte.
            pos = body_end + (size & 1);
        }

        let format = format.ok_or(PcmError::malformed("missing fmt chunk"))?;
        let data = data.ok_or(PcmError::malformed("missing data chunk"))?;

        Ok(Self {
            format,
            data,
            cursor: 0,
        })
    }

    /// Next chunk of at most `requested_len` bytes.
    ///
    /// A call never straddles the end of the data: when fewer bytes than
    /// requested remain, exactly the remainder is returned and the cursor
    /// wraps to zero for the following call.
    pub fn next_slice(&mut self, requested_len: usize) -> Bytes {
        if requested_len == 0 || self.data.is_empty() {
            return Bytes::new();
        }

        let remaining = self.data.len() - self.cursor;
        if requested_len < remaining {
            let slice = self.data.slice(self.cursor..self.cursor + requested_len);
            self.cursor += requested_len;
            slice
        } else {
            let slice = self.data.slice(self.cursor..);
            self.cursor = 0;
            slice
        }
    }

    pub fn format(&self) -> &WaveFormat {
        &self.format
    }

    /// Raw sample bytes
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Length of the sample region in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current read cursor (byte offset)
    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Playback duration of the whole sample region
    pub fn duration(&self) -> Duration {
        self.format.base().duration_of(self.data.len())
    }
}

fn le_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}
