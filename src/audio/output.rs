//! Audio playback on the default output device
//!
//! Drives a [`PlaybackPuller`] from the device callback on a dedicated
//! thread. Only the receiver binary uses this; the streaming engine itself
//! never opens audio hardware.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::wav::WaveFormat;
use crate::error::OutputError;
use crate::session::PlaybackPuller;

/// 16-bit PCM playback of a received stream
pub struct AudioOutput {
    /// Output device
    device: Option<cpal::Device>,

    /// Whether playback is running
    running: Arc<AtomicBool>,

    /// Stream thread handle
    thread_handle: Option<JoinHandle<()>>,

    /// Channel for stream errors
    error_rx: Option<Receiver<OutputError>>,

    /// Stream configuration
    config: StreamConfig,
}

impl AudioOutput {
    /// Prepare playback of `format` on the default output device
    pub fn new(format: &WaveFormat) -> Result<Self, OutputError> {
        if format.bits_per_sample() != 16 {
            return Err(OutputError::UnsupportedFormat(format.bits_per_sample()));
        }

        let device = cpal::default_host()
            .default_output_device()
            .ok_or(OutputError::NoDevice)?;

        let config = StreamConfig {
            channels: format.channels(),
            sample_rate: cpal::SampleRate(format.sample_rate()),
            buffer_size: cpal::BufferSize::Default,
        };

        Ok(Self {
            device: Some(device),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            error_rx: None,
            config,
        })
    }

    /// Start pulling from `puller` into the device
    pub fn start(&mut self, mut puller: PlaybackPuller) -> Result<(), OutputError> {
        let Some(device) = self.device.take() else {
            return Err(OutputError::StreamError("output already started".into()));
        };

        let (error_tx, error_rx) = bounded::<OutputError>(16);
        self.error_rx = Some(error_rx);

        let running = self.running.clone();
        let config = self.config.clone();
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                // Sized on the first callback, reused afterwards.
                let mut bytes: Vec<u8> = Vec::with_capacity(16 * 1024);
                let stream_errors = error_tx.clone();

                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        bytes.resize(data.len() * 2, 0);
                        puller.pull(&mut bytes);
                        for (sample, pair) in data.iter_mut().zip(bytes.chunks_exact(2)) {
                            *sample = i16::from_le_bytes([pair[0], pair[1]]);
                        }
                    },
                    move |err| {
                        let _ = stream_errors.try_send(OutputError::StreamError(err.to_string()));
                    },
                    None,
                );

                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            tracing::error!("Failed to start output stream: {}", e);
                            let _ = error_tx.try_send(OutputError::StreamError(e.to_string()));
                            return;
                        }

                        // Keep the stream alive while running
                        while running.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(10));
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to build output stream: {}", e);
                        let _ = error_tx.try_send(OutputError::StreamError(e.to_string()));
                    }
                }
            })
            .map_err(|e| OutputError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    /// Stop playback
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    /// Check if playback is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get the stream configuration
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Check for errors
    pub fn check_errors(&self) -> Option<OutputError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.stop();
    }
}
