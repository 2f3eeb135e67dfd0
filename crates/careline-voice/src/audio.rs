//! Microphone capture using CPAL
//!
//! Delivers fixed-size mono chunks over a channel. The returned `Stream` is `!Send`
//! on some platforms; keep it on the thread that created it.

use crate::error::CaptureError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Audio configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Buffer size in samples (default: 480 for 30ms at 16kHz)
    pub buffer_size: usize,

    /// Preferred input device name; default device when None.
    pub device_name: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            buffer_size: 480,
            device_name: None,
        }
    }
}

/// Audio chunk sent from the capture callback
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Audio samples (f32, normalized to -1.0 to 1.0)
    pub samples: Vec<f32>,
    pub timestamp: std::time::Instant,
}

/// Audio capture system using CPAL
pub struct AudioCapture {
    config: AudioConfig,
    device: Device,
    stream_config: StreamConfig,
}

impl AudioCapture {
    pub fn new(config: AudioConfig) -> Result<Self, CaptureError> {
        let host = cpal::default_host();
        let device = match config.device_name.as_deref() {
            Some(wanted) => host
                .input_devices()?
                .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
                .ok_or_else(|| {
                    CaptureError::DeviceUnavailable(format!("input device '{}' not found", wanted))
                })?,
            None => host.default_input_device().ok_or_else(|| {
                CaptureError::DeviceUnavailable("No input device available".to_string())
            })?,
        };

        info!(
            "📱 Using input device: {} ({}Hz mono)",
            device.name().unwrap_or_else(|_| "Unknown".to_string()),
            config.sample_rate
        );

        // Fails early when the OS denies microphone access.
        let _ = device.default_input_config()?;

        let stream_config = StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(config.buffer_size as u32),
        };

        Ok(Self {
            config,
            device,
            stream_config,
        })
    }

    /// Start capturing; chunks of exactly `buffer_size` samples go to `chunk_tx`.
    /// Stream errors are forwarded on `error_tx` so the owner can end the session.
    pub fn start_capture(
        self,
        chunk_tx: mpsc::UnboundedSender<AudioChunk>,
        error_tx: mpsc::UnboundedSender<CaptureError>,
    ) -> Result<Stream, CaptureError> {
        let buffer_size = self.config.buffer_size;
        let mut sample_buffer = Vec::with_capacity(buffer_size);

        let stream = self.device.build_input_stream(
            &self.stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for &sample in data {
                    sample_buffer.push(sample);
                    if sample_buffer.len() >= buffer_size {
                        let chunk = AudioChunk {
                            samples: std::mem::replace(
                                &mut sample_buffer,
                                Vec::with_capacity(buffer_size),
                            ),
                            timestamp: std::time::Instant::now(),
                        };
                        if chunk_tx.send(chunk).is_err() {
                            return;
                        }
                    }
                }
            },
            move |err| {
                warn!("Audio stream error: {}", err);
                let _ = error_tx.send(CaptureError::Stream(err.to_string()));
            },
            None,
        )?;

        stream.play()?;
        info!("✅ Audio capture started");
        Ok(stream)
    }

    /// List available input devices
    pub fn list_input_devices() -> Result<Vec<String>, CaptureError> {
        let devices = cpal::default_host().input_devices()?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}
