//! **Microphone transcriber** — local VAD and gap detection feeding an STT backend.
//!
//! Captures the microphone via CPAL in 30ms chunks, runs WebRTC VAD, commits a turn
//! after 800ms of silence, and sends each committed turn to an [`SttBackend`]. All of
//! it runs on one dedicated thread (the CPAL stream and the VAD are not `Send`); the
//! thread exits and releases the device as soon as the transcript stream is dropped.

use crate::audio::{AudioCapture, AudioChunk, AudioConfig};
use crate::capture::{TranscriptStream, TranscriptUpdate, Transcriber};
use crate::error::CaptureError;
use crate::stt::SttBackend;
use crate::turn::{TurnConfig, TurnEvent, TurnManager};
use crate::vad::{VadConfig, VadDetector};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Configuration for the microphone transcriber.
#[derive(Debug, Clone)]
pub struct MicrophoneConfig {
    /// Sample rate (default 16000). Must be a WebRTC VAD rate.
    pub sample_rate: u32,
    /// Silence after speech that commits a turn (default 800ms).
    pub gap_ms: u64,
    /// Minimum speech duration to commit (default 200ms).
    pub min_speech_ms: u64,
    /// WebRTC VAD aggressiveness 0-3 (default 2).
    pub vad_mode: u8,
    /// Preferred input device name.
    pub device_name: Option<String>,
}

impl Default for MicrophoneConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            gap_ms: 800,
            min_speech_ms: 200,
            vad_mode: 2,
            device_name: None,
        }
    }
}

/// [`Transcriber`] backed by the local microphone.
pub struct MicrophoneTranscriber {
    config: MicrophoneConfig,
    stt: Arc<dyn SttBackend>,
}

impl MicrophoneTranscriber {
    pub fn new(config: MicrophoneConfig, stt: Arc<dyn SttBackend>) -> Self {
        Self { config, stt }
    }
}

#[async_trait::async_trait]
impl Transcriber for MicrophoneTranscriber {
    async fn open(&self) -> Result<TranscriptStream, CaptureError> {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let config = self.config.clone();
        let stt = Arc::clone(&self.stt);

        thread::Builder::new()
            .name("careline-mic".to_string())
            .spawn(move || run_microphone(config, stt, updates_tx, ready_tx))
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(TranscriptStream::new(updates_rx)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CaptureError::DeviceUnavailable(
                "microphone worker exited during startup".to_string(),
            )),
        }
    }
}

fn run_microphone(
    config: MicrophoneConfig,
    stt: Arc<dyn SttBackend>,
    updates_tx: mpsc::UnboundedSender<TranscriptUpdate>,
    ready_tx: oneshot::Sender<Result<(), CaptureError>>,
) {
    let audio_config = AudioConfig {
        sample_rate: config.sample_rate,
        buffer_size: (config.sample_rate as usize * 30) / 1000,
        device_name: config.device_name.clone(),
    };
    let (audio_tx, mut audio_rx) = mpsc::unbounded_channel::<AudioChunk>();
    let (error_tx, mut error_rx) = mpsc::unbounded_channel::<CaptureError>();

    let setup = AudioCapture::new(audio_config)
        .and_then(|capture| capture.start_capture(audio_tx, error_tx))
        .and_then(|stream| {
            VadDetector::new(VadConfig {
                sample_rate: config.sample_rate,
                mode: config.vad_mode,
            })
            .map(|vad| (stream, vad))
        });
    let (_stream, mut vad) = match setup {
        Ok(parts) => {
            let _ = ready_tx.send(Ok(()));
            parts
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let mut turns = TurnManager::new(TurnConfig {
        silence_threshold: Duration::from_millis(config.gap_ms),
        min_speech_duration: Duration::from_millis(config.min_speech_ms),
        max_turn_duration: Duration::from_secs(30),
        sample_rate: config.sample_rate,
    });
    info!("Mic: listening (30ms chunks, {}ms gap)", config.gap_ms);

    while let Some(chunk) = audio_rx.blocking_recv() {
        if updates_tx.is_closed() {
            debug!("Mic: transcript stream dropped, releasing device");
            break;
        }
        if let Ok(err) = error_rx.try_recv() {
            let _ = updates_tx.send(TranscriptUpdate::Failed(err));
            break;
        }
        let is_speech = match vad.is_speech(&chunk.samples) {
            Ok(s) => s,
            Err(_) => continue,
        };
        match turns.process_at(chunk.timestamp, is_speech, &chunk.samples) {
            Some(TurnEvent::SpeechStarted { .. }) => {
                // Empty partial marks speech onset for the live transcript.
                let _ = updates_tx.send(TranscriptUpdate::Partial(String::new()));
            }
            Some(TurnEvent::TurnCommitted(turn)) => {
                let text = match stt.transcribe_turn(&turn) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("Mic: STT failed: {}", e);
                        String::new()
                    }
                };
                if updates_tx.send(TranscriptUpdate::Final(text)).is_err() {
                    break;
                }
            }
            Some(TurnEvent::Discarded { .. }) | None => {}
        }
    }
    info!("Mic: capture thread ended");
}
