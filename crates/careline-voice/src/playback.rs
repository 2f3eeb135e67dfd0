//! **SpeechPlaybackQueue** — strictly sequential spoken replies with instant cut-off.
//!
//! One worker task drains a FIFO of requests: synthesize, then play through an
//! [`AudioSink`]. `cancel_all()` bumps the queue epoch (queued requests from an older
//! epoch are dropped unplayed) and cancels the active request's token, which halts
//! the sink. Synthesis and device errors end that request only.

use crate::error::PlaybackError;
use crate::voice_output::SpeechSynthesizer;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identifies one enqueued reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PlaybackToken(u64);

impl PlaybackToken {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PlaybackToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A queued reply.
#[derive(Debug, Clone)]
pub struct PlaybackRequest {
    pub token: PlaybackToken,
    pub text: String,
    epoch: u64,
}

/// Text plus its encoded audio (empty when the synthesizer produced none).
#[derive(Debug, Clone)]
pub struct SynthesizedSpeech {
    pub token: PlaybackToken,
    pub text: String,
    pub audio: Vec<u8>,
}

/// Output device for synthesized speech.
#[async_trait::async_trait]
pub trait AudioSink: Send + Sync {
    /// Play to completion. The future may be dropped mid-way; `halt` follows.
    async fn play(&self, speech: SynthesizedSpeech) -> Result<(), PlaybackError>;

    /// Silence output immediately.
    fn halt(&self);
}

/// Prints replies and holds the "speaker" for as long as reading them would take.
#[derive(Debug, Clone)]
pub struct ConsoleSink {
    words_per_minute: u32,
}

impl ConsoleSink {
    pub fn new(words_per_minute: u32) -> Self {
        Self {
            words_per_minute: words_per_minute.max(1),
        }
    }

    pub fn speaking_time(&self, text: &str) -> Duration {
        let words = text.split_whitespace().count().max(1) as u64;
        Duration::from_millis(words * 60_000 / self.words_per_minute as u64)
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new(180)
    }
}

#[async_trait::async_trait]
impl AudioSink for ConsoleSink {
    async fn play(&self, speech: SynthesizedSpeech) -> Result<(), PlaybackError> {
        println!("🔊 {}", speech.text);
        tokio::time::sleep(self.speaking_time(&speech.text)).await;
        Ok(())
    }

    fn halt(&self) {
        println!("🔇 (interrupted)");
    }
}

/// How a request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    /// Halted mid-way or dropped from the queue.
    Cancelled,
    Failed(PlaybackError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    Started { token: PlaybackToken },
    Finished { token: PlaybackToken, outcome: PlaybackOutcome },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Speaking { token: PlaybackToken },
}

struct Shared {
    epoch: AtomicU64,
    /// Token of the request being played. Guarded together with `epoch` checks.
    active: Mutex<Option<CancellationToken>>,
    pending: AtomicUsize,
}

/// FIFO playback queue; at most one request is audible at a time.
pub struct SpeechPlaybackQueue {
    tx: mpsc::UnboundedSender<PlaybackRequest>,
    next_token: AtomicU64,
    shared: Arc<Shared>,
    state_rx: watch::Receiver<PlaybackState>,
    events: broadcast::Sender<PlaybackEvent>,
}

impl SpeechPlaybackQueue {
    /// Spawns the worker on the current tokio runtime.
    pub fn new(synthesizer: Arc<dyn SpeechSynthesizer>, sink: Arc<dyn AudioSink>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(PlaybackState::Idle);
        let (events, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            epoch: AtomicU64::new(0),
            active: Mutex::new(None),
            pending: AtomicUsize::new(0),
        });

        tokio::spawn(worker(
            rx,
            synthesizer,
            sink,
            Arc::clone(&shared),
            state_tx,
            events.clone(),
        ));

        Self {
            tx,
            next_token: AtomicU64::new(1),
            shared,
            state_rx,
            events,
        }
    }

    /// Append a reply to the queue.
    pub fn enqueue(&self, text: impl Into<String>) -> PlaybackToken {
        let token = PlaybackToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        let request = PlaybackRequest {
            token,
            text: text.into(),
            epoch: self.shared.epoch.load(Ordering::SeqCst),
        };
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(request).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            warn!(%token, "Playback worker gone; reply dropped");
        } else {
            debug!(%token, "Reply enqueued");
        }
        token
    }

    /// Halt the active request and discard everything queued. Idempotent.
    pub fn cancel_all(&self) {
        let Ok(active) = self.shared.active.lock() else {
            return;
        };
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = active.as_ref() {
            token.cancel();
        }
    }

    /// True while a request is audible.
    pub fn is_speaking(&self) -> bool {
        matches!(*self.state_rx.borrow(), PlaybackState::Speaking { .. })
    }

    /// True when nothing is playing or waiting.
    pub fn is_idle(&self) -> bool {
        self.shared.pending.load(Ordering::SeqCst) == 0
    }

    pub fn state(&self) -> PlaybackState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PlaybackState> {
        self.state_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events.subscribe()
    }
}

impl Drop for SpeechPlaybackQueue {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

async fn worker(
    mut rx: mpsc::UnboundedReceiver<PlaybackRequest>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    sink: Arc<dyn AudioSink>,
    shared: Arc<Shared>,
    state_tx: watch::Sender<PlaybackState>,
    events: broadcast::Sender<PlaybackEvent>,
) {
    while let Some(request) = rx.recv().await {
        let token = request.token;
        let outcome = match arm_request(&shared, &request) {
            None => {
                debug!(%token, "Dropping reply queued before cancel_all");
                PlaybackOutcome::Cancelled
            }
            Some(cancel) => {
                state_tx.send_replace(PlaybackState::Speaking { token });
                let _ = events.send(PlaybackEvent::Started { token });
                info!(%token, "🗣️ Speaking");

                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        sink.halt();
                        info!(%token, "🔇 Playback cancelled");
                        PlaybackOutcome::Cancelled
                    }
                    result = speak(synthesizer.as_ref(), sink.as_ref(), &request) => match result {
                        Ok(()) => PlaybackOutcome::Completed,
                        Err(e) => {
                            warn!(%token, error = %e, "Playback failed");
                            PlaybackOutcome::Failed(e)
                        }
                    },
                };
                if let Ok(mut active) = shared.active.lock() {
                    *active = None;
                }
                outcome
            }
        };

        state_tx.send_replace(PlaybackState::Idle);
        shared.pending.fetch_sub(1, Ordering::SeqCst);
        let _ = events.send(PlaybackEvent::Finished { token, outcome });
    }
    debug!("Playback worker stopped");
}

/// Install a fresh cancellation token unless the request predates a `cancel_all`.
fn arm_request(shared: &Shared, request: &PlaybackRequest) -> Option<CancellationToken> {
    let mut active = shared.active.lock().ok()?;
    if request.epoch != shared.epoch.load(Ordering::SeqCst) {
        return None;
    }
    let cancel = CancellationToken::new();
    *active = Some(cancel.clone());
    Some(cancel)
}

async fn speak(
    synthesizer: &dyn SpeechSynthesizer,
    sink: &dyn AudioSink,
    request: &PlaybackRequest,
) -> Result<(), PlaybackError> {
    let audio = synthesizer.synthesize(&request.text).await?;
    sink.play(SynthesizedSpeech {
        token: request.token,
        text: request.text.clone(),
        audio,
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice_output::SilentSynthesizer;
    use std::sync::atomic::AtomicBool;

    /// Records start/end marks and holds each reply for one second.
    #[derive(Default)]
    struct RecordingSink {
        log: Mutex<Vec<String>>,
        playing: AtomicBool,
        overlapped: AtomicBool,
    }

    #[async_trait::async_trait]
    impl AudioSink for RecordingSink {
        async fn play(&self, speech: SynthesizedSpeech) -> Result<(), PlaybackError> {
            if self.playing.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            self.log.lock().unwrap().push(format!("start:{}", speech.text));
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.log.lock().unwrap().push(format!("end:{}", speech.text));
            self.playing.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn halt(&self) {
            self.playing.store(false, Ordering::SeqCst);
            self.log.lock().unwrap().push("halt".to_string());
        }
    }

    struct FlakySynthesizer {
        fail_on: &'static str,
    }

    #[async_trait::async_trait]
    impl SpeechSynthesizer for FlakySynthesizer {
        async fn synthesize(&self, text: &str) -> Result<Vec<u8>, PlaybackError> {
            if text == self.fail_on {
                Err(PlaybackError::Synthesis("boom".to_string()))
            } else {
                Ok(Vec::new())
            }
        }
    }

    async fn wait_finished(
        events: &mut broadcast::Receiver<PlaybackEvent>,
        token: PlaybackToken,
    ) -> PlaybackOutcome {
        loop {
            if let Ok(PlaybackEvent::Finished { token: t, outcome }) = events.recv().await {
                if t == token {
                    return outcome;
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn plays_in_fifo_order_without_overlap() {
        let sink = Arc::new(RecordingSink::default());
        let queue = SpeechPlaybackQueue::new(Arc::new(SilentSynthesizer), sink.clone());
        let mut events = queue.subscribe();

        queue.enqueue("one");
        queue.enqueue("two");
        let last = queue.enqueue("three");
        assert_eq!(wait_finished(&mut events, last).await, PlaybackOutcome::Completed);

        let log = sink.log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec!["start:one", "end:one", "start:two", "end:two", "start:three", "end:three"]
        );
        assert!(!sink.overlapped.load(Ordering::SeqCst));
        assert!(queue.is_idle());
        assert_eq!(queue.state(), PlaybackState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_halts_active_and_discards_queued() {
        let sink = Arc::new(RecordingSink::default());
        let queue = SpeechPlaybackQueue::new(Arc::new(SilentSynthesizer), sink.clone());
        let mut events = queue.subscribe();

        let first = queue.enqueue("first");
        let second = queue.enqueue("second");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(queue.is_speaking());

        queue.cancel_all();
        queue.cancel_all();
        assert_eq!(wait_finished(&mut events, first).await, PlaybackOutcome::Cancelled);
        assert_eq!(wait_finished(&mut events, second).await, PlaybackOutcome::Cancelled);

        let next = queue.enqueue("after");
        assert_eq!(wait_finished(&mut events, next).await, PlaybackOutcome::Completed);
        let log = sink.log.lock().unwrap().clone();
        assert_eq!(log, vec!["start:first", "halt", "start:after", "end:after"]);
    }

    #[tokio::test(start_paused = true)]
    async fn synthesis_failure_does_not_block_later_replies() {
        let sink = Arc::new(RecordingSink::default());
        let queue = SpeechPlaybackQueue::new(Arc::new(FlakySynthesizer { fail_on: "bad" }), sink.clone());
        let mut events = queue.subscribe();

        let bad = queue.enqueue("bad");
        let good = queue.enqueue("good");
        assert!(matches!(
            wait_finished(&mut events, bad).await,
            PlaybackOutcome::Failed(PlaybackError::Synthesis(_))
        ));
        assert_eq!(wait_finished(&mut events, good).await, PlaybackOutcome::Completed);
        assert_eq!(sink.log.lock().unwrap().clone(), vec!["start:good", "end:good"]);
    }

    #[test]
    fn console_sink_paces_by_words() {
        let sink = ConsoleSink::new(120);
        assert_eq!(sink.speaking_time("one two three four"), Duration::from_secs(2));
        assert_eq!(sink.speaking_time(""), Duration::from_millis(500));
    }
}
