//! Error types for the Careline voice layer
//!
//! Four failure families cross the orchestrator's seams: capture, interpretation,
//! playback and action execution. None of them is fatal to the orchestrator; see
//! [`crate::orchestrator`] for how each one is folded back into the conversation.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Microphone / transcriber failures. Treated as turn abandonment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Capture device busy: another session is listening")]
    DeviceBusy,

    #[error("Capture session already listening")]
    AlreadyListening,

    #[error("Capture stream error: {0}")]
    Stream(String),

    #[error("Transcription failed: {0}")]
    Transcription(String),
}

/// Failures of the external intent interpreter. Converted into the apology reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InterpreterError {
    #[error("Interpreter timed out after {0:?}")]
    Timeout(Duration),

    #[error("Interpreter returned a malformed response: {0}")]
    Malformed(String),

    #[error("Interpreter API error {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Interpreter network error: {0}")]
    Network(String),

    #[error("Interpreter not configured: {0}")]
    NotConfigured(String),
}

/// Speech synthesis or audio output failures. Logged and swallowed by the queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("TTS error: {0}")]
    Synthesis(String),

    #[error("Audio output error: {0}")]
    Device(String),

    #[error("Audio decode failed: {0}")]
    Decode(String),
}

/// Side-effect dispatch failures. Reported inline in the spoken reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionExecutionError {
    #[error("Action rejected: {0}")]
    Rejected(String),

    #[error("Action not supported for this role: {0}")]
    Unsupported(String),

    #[error("Action failed: {0}")]
    Failed(String),

    #[error("Action panicked: {0}")]
    Panicked(String),
}

/// Errors that can occur in the voice orchestration system
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Interpreter(#[from] InterpreterError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    #[error(transparent)]
    Action(#[from] ActionExecutionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid shortcut pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Orchestrator channel closed: {0}")]
    ChannelClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for InterpreterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            InterpreterError::Malformed(err.to_string())
        } else {
            InterpreterError::Network(err.to_string())
        }
    }
}

#[cfg(feature = "device")]
impl From<cpal::DevicesError> for CaptureError {
    fn from(err: cpal::DevicesError) -> Self {
        CaptureError::DeviceUnavailable(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::DefaultStreamConfigError> for CaptureError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        CaptureError::DeviceUnavailable(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::BuildStreamError> for CaptureError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => {
                CaptureError::DeviceUnavailable(err.to_string())
            }
            other => CaptureError::Stream(other.to_string()),
        }
    }
}

#[cfg(feature = "device")]
impl From<cpal::PlayStreamError> for CaptureError {
    fn from(err: cpal::PlayStreamError) -> Self {
        CaptureError::Stream(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_errors_wrap_transparently() {
        let err: VoiceError = CaptureError::PermissionDenied("user blocked mic".into()).into();
        assert_eq!(err.to_string(), "Microphone permission denied: user blocked mic");
    }

    #[test]
    fn interpreter_timeout_message() {
        let err = InterpreterError::Timeout(Duration::from_secs(8));
        assert!(err.to_string().contains("8s"));
    }
}
