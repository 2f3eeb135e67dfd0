//! Turn-taking for microphone capture
//!
//! Implements the "gap" rule: a spoken turn is committed once the speaker has
//! been silent for `silence_threshold` (800ms by default). Pure state machine, fed
//! one VAD decision per audio chunk; no device access.

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A completed turn: buffered PCM from speech start until the gap was detected.
#[derive(Debug, Clone)]
pub struct AudioTurn {
    /// PCM samples (f32, -1.0..1.0) for the full turn.
    pub samples: Vec<f32>,
    /// When the turn was committed.
    pub timestamp: DateTime<Utc>,
    /// Approximate speech duration.
    pub duration: Duration,
    /// Sample rate (e.g. 16000).
    pub sample_rate: u32,
}

/// Events emitted by the turn manager
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// User started speaking
    SpeechStarted { timestamp: DateTime<Utc> },

    /// Turn is committed (ready for transcription)
    TurnCommitted(AudioTurn),

    /// Speech was too short to be a turn and was dropped
    Discarded { duration: Duration },
}

/// Configuration for turn detection
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Silence duration before committing a turn (default: 800ms)
    pub silence_threshold: Duration,

    /// Minimum speech duration to be considered a valid turn (default: 200ms)
    pub min_speech_duration: Duration,

    /// Maximum turn duration before auto-commit (default: 30s)
    pub max_turn_duration: Duration,

    /// Sample rate for audio (default: 16000 Hz)
    pub sample_rate: u32,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            silence_threshold: Duration::from_millis(800),
            min_speech_duration: Duration::from_millis(200),
            max_turn_duration: Duration::from_secs(30),
            sample_rate: 16000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnState {
    Idle,
    Speaking,
    SilenceDetected,
}

/// Manages conversational turn-taking based on VAD signals
pub struct TurnManager {
    config: TurnConfig,
    state: TurnState,
    speech_start: Option<Instant>,
    last_speech_time: Option<Instant>,
    audio_buffer: Vec<f32>,
}

impl TurnManager {
    pub fn new(config: TurnConfig) -> Self {
        Self {
            config,
            state: TurnState::Idle,
            speech_start: None,
            last_speech_time: None,
            audio_buffer: Vec::new(),
        }
    }

    /// Process a VAD decision for one chunk captured now.
    pub fn process_vad_result(&mut self, is_speech: bool, audio_chunk: &[f32]) -> Option<TurnEvent> {
        self.process_at(Instant::now(), is_speech, audio_chunk)
    }

    /// Process a VAD decision for a chunk captured at `now`.
    pub fn process_at(&mut self, now: Instant, is_speech: bool, audio_chunk: &[f32]) -> Option<TurnEvent> {
        match (self.state, is_speech) {
            (TurnState::Idle, true) => {
                info!("🎤 Speech started");
                self.state = TurnState::Speaking;
                self.speech_start = Some(now);
                self.last_speech_time = Some(now);
                self.audio_buffer.clear();
                self.audio_buffer.extend_from_slice(audio_chunk);
                Some(TurnEvent::SpeechStarted {
                    timestamp: Utc::now(),
                })
            }

            (TurnState::Speaking, true) | (TurnState::SilenceDetected, true) => {
                self.state = TurnState::Speaking;
                self.last_speech_time = Some(now);
                self.audio_buffer.extend_from_slice(audio_chunk);

                let start = self.speech_start.unwrap_or(now);
                if now.duration_since(start) >= self.config.max_turn_duration {
                    warn!("⏱️ Max turn duration reached, auto-committing");
                    return self.commit_turn();
                }
                None
            }

            (TurnState::Speaking, false) => {
                debug!("🤫 Silence detected");
                self.state = TurnState::SilenceDetected;
                // Trailing silence stays in the turn so the recognizer sees the natural ending.
                self.audio_buffer.extend_from_slice(audio_chunk);
                None
            }

            (TurnState::SilenceDetected, false) => {
                self.audio_buffer.extend_from_slice(audio_chunk);
                let last_speech = self.last_speech_time.unwrap_or(now);
                if now.duration_since(last_speech) >= self.config.silence_threshold {
                    info!("✅ Silence threshold reached, committing turn");
                    return self.commit_turn();
                }
                None
            }

            (TurnState::Idle, false) => None,
        }
    }

    fn commit_turn(&mut self) -> Option<TurnEvent> {
        let duration = match (self.speech_start, self.last_speech_time) {
            (Some(start), Some(last)) => last.duration_since(start),
            _ => Duration::ZERO,
        };

        let event = if duration < self.config.min_speech_duration {
            debug!("⏭️ Speech too short ({:?}), ignoring", duration);
            TurnEvent::Discarded { duration }
        } else {
            info!(
                "🎯 Turn committed: {:?} duration, {} samples",
                duration,
                self.audio_buffer.len()
            );
            TurnEvent::TurnCommitted(AudioTurn {
                samples: std::mem::take(&mut self.audio_buffer),
                timestamp: Utc::now(),
                duration,
                sample_rate: self.config.sample_rate,
            })
        };

        self.reset();
        Some(event)
    }

    /// Drop any partially captured turn.
    pub fn reset(&mut self) {
        self.state = TurnState::Idle;
        self.speech_start = None;
        self.last_speech_time = None;
        self.audio_buffer.clear();
    }

    /// True while a turn is open (speaking or inside the gap).
    pub fn in_turn(&self) -> bool {
        self.state != TurnState::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TurnManager {
        TurnManager::new(TurnConfig {
            silence_threshold: Duration::from_millis(100),
            min_speech_duration: Duration::from_millis(50),
            ..Default::default()
        })
    }

    #[test]
    fn commits_after_gap() {
        let mut m = manager();
        let chunk = vec![0.5f32; 480];
        let t0 = Instant::now();

        assert!(matches!(
            m.process_at(t0, true, &chunk),
            Some(TurnEvent::SpeechStarted { .. })
        ));
        assert!(m.process_at(t0 + Duration::from_millis(60), true, &chunk).is_none());
        assert!(m.process_at(t0 + Duration::from_millis(90), false, &chunk).is_none());
        assert!(m.process_at(t0 + Duration::from_millis(120), false, &chunk).is_none());

        match m.process_at(t0 + Duration::from_millis(170), false, &chunk) {
            Some(TurnEvent::TurnCommitted(turn)) => {
                assert_eq!(turn.duration, Duration::from_millis(60));
                assert_eq!(turn.samples.len(), 480 * 5);
            }
            other => panic!("expected commit, got {:?}", other),
        }
        assert!(!m.in_turn());
    }

    #[test]
    fn resumed_speech_keeps_turn_open() {
        let mut m = manager();
        let chunk = vec![0.1f32; 480];
        let t0 = Instant::now();
        m.process_at(t0, true, &chunk);
        m.process_at(t0 + Duration::from_millis(30), false, &chunk);
        assert!(m.process_at(t0 + Duration::from_millis(90), true, &chunk).is_none());
        assert!(m.process_at(t0 + Duration::from_millis(150), false, &chunk).is_none());
        assert!(m.in_turn());
    }

    #[test]
    fn blip_is_discarded() {
        let mut m = manager();
        let chunk = vec![0.1f32; 480];
        let t0 = Instant::now();
        m.process_at(t0, true, &chunk);
        m.process_at(t0 + Duration::from_millis(30), false, &chunk);
        assert!(matches!(
            m.process_at(t0 + Duration::from_millis(130), false, &chunk),
            Some(TurnEvent::Discarded { .. })
        ));
    }
}
