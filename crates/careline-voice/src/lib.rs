//! # Careline Voice - voice command orchestration for the Careline portal
//!
//! Turns speech (or typed text) into portal actions and short spoken replies,
//! one turn at a time: later utterances win, only one reply is audible, and an
//! "anything else?" prompt follows a finished reply unless the user speaks first.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       Voice Orchestrator                          │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────────┐  │
//! │  │   Capture    │ → │   Debounce   │ → │   Command Resolver   │  │
//! │  │ (Transcriber)│   │   (600ms)    │   │ shortcuts → LLM      │  │
//! │  └──────────────┘   └──────────────┘   └──────────────────────┘  │
//! │         ↓ barge-in                                ↓               │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────────┐  │
//! │  │  Follow-up   │ ← │   Playback   │ ← │   Action Executor    │  │
//! │  │  Scheduler   │   │    Queue     │   │   (one at a time)    │  │
//! │  └──────────────┘   └──────────────┘   └──────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Microphone capture and speaker output (CPAL, WebRTC VAD, rodio) live behind the
//! `device` feature; everything else runs against in-process fakes.

pub mod action;
#[cfg(feature = "device")]
pub mod audio;
pub mod capture;
pub mod config;
pub mod context;
pub mod error;
pub mod interpreter;
#[cfg(feature = "device")]
pub mod microphone;
pub mod orchestrator;
pub mod playback;
pub mod resolver;
pub mod scheduler;
pub mod stt;
pub mod turn;
#[cfg(feature = "device")]
pub mod vad;
pub mod voice_output;

pub use action::{dispatch_action, ActionDescriptor, ActionExecutor, ActionOutcome, LoggingActionExecutor, View};
pub use capture::{
    CaptureDevice, CaptureEvent, CaptureState, ChannelTranscriber, SpeechCaptureSession, TranscriptFeed,
    TranscriptStream, TranscriptUpdate, Transcriber, Utterance,
};
pub use config::VoiceConfig;
pub use context::{CommandContext, Role, SessionMemory};
pub use error::{
    ActionExecutionError, CaptureError, InterpreterError, PlaybackError, VoiceError, VoiceResult,
};
pub use interpreter::{ChatIntentInterpreter, IntentInterpreter, Interpretation, OfflineInterpreter};
pub use orchestrator::{AssistantEvent, Generation, OrchestratorHandle, OrchestratorState, VoiceOrchestrator};
pub use playback::{
    AudioSink, ConsoleSink, PlaybackEvent, PlaybackOutcome, PlaybackState, PlaybackToken, SpeechPlaybackQueue,
    SynthesizedSpeech,
};
pub use resolver::{CommandResolver, CommandSource, ResolvedCommand, ShortcutTable};
pub use scheduler::{FollowUpScheduler, FollowUpToken, ScheduledFollowUp};
pub use stt::{create_best_stt, OpenAiStt, PlaceholderStt, SttBackend};
pub use turn::{AudioTurn, TurnConfig, TurnEvent, TurnManager};
pub use voice_output::{OpenAiSpeechSynthesizer, SilentSynthesizer, SpeechSynthesizer};

#[cfg(feature = "device")]
pub use audio::{AudioCapture, AudioChunk, AudioConfig};
#[cfg(feature = "device")]
pub use microphone::{MicrophoneConfig, MicrophoneTranscriber};
#[cfg(feature = "device")]
pub use vad::{VadConfig, VadDetector};
#[cfg(feature = "device")]
pub use voice_output::RodioSink;
