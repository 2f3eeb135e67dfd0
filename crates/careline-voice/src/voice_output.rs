//! **Voice output** — speech synthesis backends and the speaker sink.
//!
//! [`SpeechSynthesizer`] turns reply text into encoded audio (MP3/WAV). With the
//! `device` feature, [`RodioSink`] plays that audio on the default output device and
//! `halt()` is the barge-in kill-switch.

use crate::error::PlaybackError;
use std::time::Duration;
use tracing::debug;

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// The `synthesizeSpeech` capability.
#[async_trait::async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Encoded audio for `text`. An empty vec means "nothing to play".
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, PlaybackError>;
}

/// Returns no audio; sinks fall back to their text rendering.
#[derive(Debug, Default)]
pub struct SilentSynthesizer;

#[async_trait::async_trait]
impl SpeechSynthesizer for SilentSynthesizer {
    async fn synthesize(&self, _text: &str) -> Result<Vec<u8>, PlaybackError> {
        Ok(Vec::new())
    }
}

/// OpenAI-compatible `/audio/speech` backend.
/// Env: `TTS_API_URL`, `TTS_API_KEY` (or `OPENAI_API_KEY`), `TTS_MODEL` (default tts-1),
/// `TTS_VOICE` (default nova).
#[derive(Debug, Clone)]
pub struct OpenAiSpeechSynthesizer {
    base_url: String,
    api_key: String,
    model: String,
    voice: String,
    client: reqwest::Client,
}

impl OpenAiSpeechSynthesizer {
    /// Returns `None` when no key is configured.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("TTS_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .ok()
            .filter(|k| !k.trim().is_empty())?;
        let base_url = std::env::var("TTS_API_URL").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());
        let model = std::env::var("TTS_MODEL").unwrap_or_else(|_| "tts-1".to_string());
        let voice = std::env::var("TTS_VOICE").unwrap_or_else(|_| "nova".to_string());
        Some(Self::new(base_url, api_key.trim(), model).with_voice(voice))
    }

    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            voice: "nova".to_string(),
            client,
        }
    }

    /// Set the voice (alloy, echo, fable, onyx, nova, shimmer, ...).
    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }

    pub fn voice(&self) -> &str {
        &self.voice
    }
}

#[async_trait::async_trait]
impl SpeechSynthesizer for OpenAiSpeechSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, PlaybackError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
        });
        let res = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| PlaybackError::Synthesis(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(PlaybackError::Synthesis(format!("TTS API error {}: {}", status, body)));
        }
        let bytes = res
            .bytes()
            .await
            .map_err(|e| PlaybackError::Synthesis(e.to_string()))?;
        debug!(bytes = bytes.len(), voice = %self.voice, "TTS audio received");
        Ok(bytes.to_vec())
    }
}

#[cfg(feature = "device")]
pub use self::device::RodioSink;

#[cfg(feature = "device")]
mod device {
    use crate::error::PlaybackError;
    use crate::playback::{AudioSink, SynthesizedSpeech};
    use rodio::{OutputStream, Sink, Source};
    use std::io::Cursor;
    use std::sync::mpsc as std_mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tracing::info;

    const POLL_INTERVAL: Duration = Duration::from_millis(20);

    /// Speaker sink on the default output device.
    ///
    /// `OutputStream` is not `Send`, so a parked thread owns it for the sink's lifetime;
    /// the `Sink` itself is shared.
    pub struct RodioSink {
        sink: Arc<Sink>,
        _keepalive: std_mpsc::Sender<()>,
    }

    impl RodioSink {
        pub fn new() -> Result<Self, PlaybackError> {
            let (ready_tx, ready_rx) = std_mpsc::channel();
            let (keepalive_tx, keepalive_rx) = std_mpsc::channel::<()>();
            thread::Builder::new()
                .name("careline-speaker".to_string())
                .spawn(move || {
                    let opened = OutputStream::try_default()
                        .map_err(|e| PlaybackError::Device(e.to_string()))
                        .and_then(|(stream, handle)| {
                            Sink::try_new(&handle)
                                .map(|sink| (stream, sink))
                                .map_err(|e| PlaybackError::Device(e.to_string()))
                        });
                    match opened {
                        Ok((_stream, sink)) => {
                            let _ = ready_tx.send(Ok(Arc::new(sink)));
                            // Blocks until the RodioSink is dropped.
                            let _ = keepalive_rx.recv();
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                        }
                    }
                })
                .map_err(|e| PlaybackError::Device(e.to_string()))?;

            let sink = ready_rx
                .recv()
                .map_err(|_| PlaybackError::Device("speaker thread exited".to_string()))??;
            info!("🔈 RodioSink: sink ready for TTS playback");
            Ok(Self {
                sink,
                _keepalive: keepalive_tx,
            })
        }
    }

    #[async_trait::async_trait]
    impl AudioSink for RodioSink {
        async fn play(&self, speech: SynthesizedSpeech) -> Result<(), PlaybackError> {
            if speech.audio.is_empty() {
                return Ok(());
            }
            let source = rodio::Decoder::new(Cursor::new(speech.audio))
                .map_err(|e| PlaybackError::Decode(e.to_string()))?;
            self.sink.append(source.convert_samples::<f32>());
            self.sink.play();

            let (done_tx, done_rx) = oneshot::channel();
            let sink = Arc::clone(&self.sink);
            thread::spawn(move || {
                while !sink.empty() {
                    thread::sleep(POLL_INTERVAL);
                }
                let _ = done_tx.send(());
            });
            let _ = done_rx.await;
            Ok(())
        }

        fn halt(&self) {
            self.sink.stop();
            info!("🔇 RodioSink: stopped (interruption)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn silent_synthesizer_returns_empty() {
        let out = SilentSynthesizer.synthesize("hello").await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn blank_text_skips_the_api() {
        // Unroutable base URL: any request would fail.
        let tts = OpenAiSpeechSynthesizer::new("http://127.0.0.1:9", "key", "tts-1");
        let out = tts.synthesize("   ").await.unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn voice_override() {
        let tts = OpenAiSpeechSynthesizer::new("https://example.invalid/v1/", "k", "tts-1")
            .with_voice("onyx");
        assert_eq!(tts.voice(), "onyx");
        assert_eq!(tts.base_url, "https://example.invalid/v1");
    }
}
