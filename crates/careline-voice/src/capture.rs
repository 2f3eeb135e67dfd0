//! **SpeechCaptureSession** — microphone/transcriber lifecycle and utterance events.
//!
//! `start()` takes the exclusive device permit and pumps [`TranscriptUpdate`]s from a
//! [`Transcriber`] into [`CaptureEvent`]s. `stop()` finalizes the pending transcript,
//! `abort()` drops it. The permit is held by the pump task, so it is released on
//! stop, abort, stream end, transcriber error, or drop.

use crate::error::CaptureError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One unit of recognized or typed text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utterance {
    pub text: String,
    pub is_final: bool,
    pub captured_at: DateTime<Utc>,
}

impl Utterance {
    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            captured_at: Utc::now(),
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            captured_at: Utc::now(),
        }
    }
}

/// Raw output of the `transcribe` capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptUpdate {
    /// Partial recognition for the current turn (may be empty on speech onset).
    Partial(String),
    /// The turn is complete.
    Final(String),
    /// The device or recognizer failed; the stream ends after this.
    Failed(CaptureError),
}

/// A fresh, per-session sequence of transcript updates.
pub struct TranscriptStream {
    rx: mpsc::UnboundedReceiver<TranscriptUpdate>,
}

impl TranscriptStream {
    pub fn new(rx: mpsc::UnboundedReceiver<TranscriptUpdate>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<TranscriptUpdate> {
        self.rx.recv().await
    }
}

/// The `transcribe` capability. Each `open` starts an independent recognition run.
#[async_trait::async_trait]
pub trait Transcriber: Send + Sync {
    async fn open(&self) -> Result<TranscriptStream, CaptureError>;
}

/// Exclusive hold on a physical capture device, shared by every session opened on it.
#[derive(Debug, Clone)]
pub struct CaptureDevice {
    name: Arc<str>,
    permit: Arc<Semaphore>,
}

impl CaptureDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
            permit: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True while some session holds the device.
    pub fn is_held(&self) -> bool {
        self.permit.available_permits() == 0
    }

    fn try_acquire(&self) -> Result<OwnedSemaphorePermit, CaptureError> {
        Arc::clone(&self.permit)
            .try_acquire_owned()
            .map_err(|_| CaptureError::DeviceBusy)
    }
}

impl Default for CaptureDevice {
    fn default() -> Self {
        Self::new("default")
    }
}

/// Events forwarded to the orchestrator. `session` identifies the `start()` call.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Utterance { session: u64, utterance: Utterance },
    /// The session returned to Idle (stop, abort or stream end).
    Ended { session: u64 },
    /// The transcriber failed; the session is back to Idle.
    Failed { session: u64, error: CaptureError },
}

/// Observable capture state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Listening,
}

#[derive(Debug)]
enum StopMode {
    Finalize,
    Abort,
}

struct ActiveCapture {
    stop_tx: Option<oneshot::Sender<StopMode>>,
    task: JoinHandle<()>,
}

/// Wraps a [`Transcriber`] and a [`CaptureDevice`]; emits [`CaptureEvent`]s.
pub struct SpeechCaptureSession {
    transcriber: Arc<dyn Transcriber>,
    device: CaptureDevice,
    events: mpsc::UnboundedSender<CaptureEvent>,
    active: Option<ActiveCapture>,
    session_counter: u64,
}

impl SpeechCaptureSession {
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        device: CaptureDevice,
        events: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Self {
        Self {
            transcriber,
            device,
            events,
            active: None,
            session_counter: 0,
        }
    }

    pub fn state(&self) -> CaptureState {
        match &self.active {
            Some(active) if !active.task.is_finished() => CaptureState::Listening,
            _ => CaptureState::Idle,
        }
    }

    pub fn is_listening(&self) -> bool {
        self.state() == CaptureState::Listening
    }

    /// Id of the most recent `start()`.
    pub fn current_session(&self) -> u64 {
        self.session_counter
    }

    /// Idle → Listening. Returns the new session id.
    pub async fn start(&mut self) -> Result<u64, CaptureError> {
        if self.is_listening() {
            return Err(CaptureError::AlreadyListening);
        }
        self.active = None;

        let permit = self.device.try_acquire()?;
        let stream = self.transcriber.open().await?;

        self.session_counter += 1;
        let session = self.session_counter;
        let (stop_tx, stop_rx) = oneshot::channel();
        let events = self.events.clone();
        let task = tokio::spawn(pump(session, stream, stop_rx, events, permit));

        info!(session, device = %self.device.name(), "🎤 Capture started");
        self.active = Some(ActiveCapture {
            stop_tx: Some(stop_tx),
            task,
        });
        Ok(session)
    }

    /// Force finalization: emits the last known transcript as final (possibly empty).
    pub async fn stop(&mut self) {
        self.shutdown(StopMode::Finalize).await;
    }

    /// Discard pending recognition without a final utterance.
    pub async fn abort(&mut self) {
        self.shutdown(StopMode::Abort).await;
    }

    async fn shutdown(&mut self, mode: StopMode) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        if let Some(tx) = active.stop_tx.take() {
            let _ = tx.send(mode);
        }
        if let Err(e) = active.task.await {
            warn!("Capture pump ended abnormally: {}", e);
        }
    }
}

impl Drop for SpeechCaptureSession {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.task.abort();
        }
    }
}

async fn pump(
    session: u64,
    mut stream: TranscriptStream,
    mut stop_rx: oneshot::Receiver<StopMode>,
    events: mpsc::UnboundedSender<CaptureEvent>,
    _permit: OwnedSemaphorePermit,
) {
    let emit = |event: CaptureEvent| {
        if events.send(event).is_err() {
            debug!(session, "Capture event dropped: orchestrator gone");
        }
    };
    // Latest partial of the turn in progress; None once the turn is finalized.
    let mut pending: Option<String> = None;

    loop {
        tokio::select! {
            mode = &mut stop_rx => {
                match mode {
                    Ok(StopMode::Finalize) => {
                        let text = pending.take().unwrap_or_default();
                        emit(CaptureEvent::Utterance { session, utterance: Utterance::final_text(text) });
                        info!(session, "⏹️ Capture stopped (finalized)");
                    }
                    Ok(StopMode::Abort) | Err(_) => {
                        info!(session, "⏹️ Capture aborted");
                    }
                }
                emit(CaptureEvent::Ended { session });
                return;
            }
            update = stream.recv() => {
                match update {
                    Some(TranscriptUpdate::Partial(text)) => {
                        pending = Some(text.clone());
                        emit(CaptureEvent::Utterance { session, utterance: Utterance::interim(text) });
                    }
                    Some(TranscriptUpdate::Final(text)) => {
                        pending = None;
                        emit(CaptureEvent::Utterance { session, utterance: Utterance::final_text(text) });
                    }
                    Some(TranscriptUpdate::Failed(error)) => {
                        warn!(session, error = %error, "Capture failed; releasing device");
                        emit(CaptureEvent::Failed { session, error });
                        return;
                    }
                    None => {
                        if let Some(text) = pending.take().filter(|t| !t.trim().is_empty()) {
                            emit(CaptureEvent::Utterance { session, utterance: Utterance::final_text(text) });
                        }
                        debug!(session, "Transcript stream ended");
                        emit(CaptureEvent::Ended { session });
                        return;
                    }
                }
            }
        }
    }
}

/// In-process transcriber driven through a [`TranscriptFeed`]. Typed-text surfaces,
/// demos and tests push updates into whichever session is currently open.
#[derive(Clone, Default)]
pub struct ChannelTranscriber {
    shared: Arc<Mutex<FeedState>>,
}

#[derive(Default)]
struct FeedState {
    current: Option<mpsc::UnboundedSender<TranscriptUpdate>>,
    fail_next_open: Option<CaptureError>,
}

impl ChannelTranscriber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for pushing updates into the open session.
    pub fn feed(&self) -> TranscriptFeed {
        TranscriptFeed {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[async_trait::async_trait]
impl Transcriber for ChannelTranscriber {
    async fn open(&self) -> Result<TranscriptStream, CaptureError> {
        let mut state = self
            .shared
            .lock()
            .map_err(|e| CaptureError::Stream(format!("feed lock poisoned: {}", e)))?;
        if let Some(err) = state.fail_next_open.take() {
            return Err(err);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.current = Some(tx);
        Ok(TranscriptStream::new(rx))
    }
}

/// Producer side of a [`ChannelTranscriber`].
#[derive(Clone)]
pub struct TranscriptFeed {
    shared: Arc<Mutex<FeedState>>,
}

impl TranscriptFeed {
    /// Returns false when no session is open.
    pub fn partial(&self, text: impl Into<String>) -> bool {
        self.send(TranscriptUpdate::Partial(text.into()))
    }

    pub fn finalize(&self, text: impl Into<String>) -> bool {
        self.send(TranscriptUpdate::Final(text.into()))
    }

    pub fn fail(&self, error: CaptureError) -> bool {
        self.send(TranscriptUpdate::Failed(error))
    }

    /// Close the current stream as if the device went away cleanly.
    pub fn close(&self) {
        if let Ok(mut state) = self.shared.lock() {
            state.current = None;
        }
    }

    /// Make the next `open()` fail (e.g. permission denied).
    pub fn fail_next_open(&self, error: CaptureError) {
        if let Ok(mut state) = self.shared.lock() {
            state.fail_next_open = Some(error);
        }
    }

    fn send(&self, update: TranscriptUpdate) -> bool {
        match self.shared.lock() {
            Ok(state) => state
                .current
                .as_ref()
                .map(|tx| tx.send(update).is_ok())
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (
        SpeechCaptureSession,
        TranscriptFeed,
        CaptureDevice,
        mpsc::UnboundedReceiver<CaptureEvent>,
    ) {
        let transcriber = ChannelTranscriber::new();
        let feed = transcriber.feed();
        let device = CaptureDevice::new("test-mic");
        let (tx, rx) = mpsc::unbounded_channel();
        (
            SpeechCaptureSession::new(Arc::new(transcriber), device.clone(), tx),
            feed,
            device,
            rx,
        )
    }

    fn text_of(event: CaptureEvent) -> (String, bool) {
        match event {
            CaptureEvent::Utterance { utterance, .. } => (utterance.text, utterance.is_final),
            other => panic!("expected utterance, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn stop_finalizes_last_partial() {
        let (mut session, feed, device, mut rx) = session();
        session.start().await.unwrap();
        assert!(device.is_held());

        feed.partial("show me");
        feed.partial("show me labs");
        assert_eq!(text_of(rx.recv().await.unwrap()), ("show me".into(), false));
        assert_eq!(text_of(rx.recv().await.unwrap()), ("show me labs".into(), false));

        session.stop().await;
        assert_eq!(text_of(rx.recv().await.unwrap()), ("show me labs".into(), true));
        assert!(matches!(rx.recv().await, Some(CaptureEvent::Ended { .. })));
        assert!(!device.is_held());
        assert_eq!(session.state(), CaptureState::Idle);
    }

    #[tokio::test]
    async fn stop_with_nothing_heard_emits_empty_final() {
        let (mut session, _feed, _device, mut rx) = session();
        session.start().await.unwrap();
        session.stop().await;
        assert_eq!(text_of(rx.recv().await.unwrap()), (String::new(), true));
    }

    #[tokio::test]
    async fn abort_discards_pending_turn() {
        let (mut session, feed, device, mut rx) = session();
        session.start().await.unwrap();
        feed.partial("refill my");
        assert!(matches!(rx.recv().await, Some(CaptureEvent::Utterance { .. })));

        session.abort().await;
        assert!(matches!(rx.recv().await, Some(CaptureEvent::Ended { .. })));
        assert!(!device.is_held());
    }

    #[tokio::test]
    async fn device_is_exclusive_across_sessions() {
        let (mut first, _feed, device, _rx) = session();
        let (tx, _rx2) = mpsc::unbounded_channel();
        let mut second =
            SpeechCaptureSession::new(Arc::new(ChannelTranscriber::new()), device.clone(), tx);

        first.start().await.unwrap();
        assert_eq!(second.start().await, Err(CaptureError::DeviceBusy));
        first.abort().await;
        assert!(second.start().await.is_ok());
    }

    #[tokio::test]
    async fn open_failure_releases_permit_and_allows_retry() {
        let (mut session, feed, device, _rx) = session();
        feed.fail_next_open(CaptureError::PermissionDenied("blocked".into()));
        assert_eq!(
            session.start().await,
            Err(CaptureError::PermissionDenied("blocked".into()))
        );
        assert!(!device.is_held());
        assert!(session.start().await.is_ok());
    }

    #[tokio::test]
    async fn transcriber_error_ends_session() {
        let (mut session, feed, device, mut rx) = session();
        session.start().await.unwrap();
        feed.fail(CaptureError::DeviceUnavailable("unplugged".into()));
        assert!(matches!(rx.recv().await, Some(CaptureEvent::Failed { .. })));
        tokio::task::yield_now().await;
        assert!(!device.is_held());
        assert!(!session.is_listening());
    }
}
