//! Voice Orchestrator - the turn-taking state machine
//!
//! One tokio task owns every piece of mutable state: the capture session, the
//! pending utterance, the generation counter and the session memory. Everything
//! else (capture pump, resolution, action dispatch, playback worker, follow-up
//! timer) runs on its own task and reports back over channels. Results are tagged
//! with the [`Generation`] they were started for; anything older than the current
//! generation is dropped on arrival.
//!
//! ```text
//!  Idle ──start──▶ Capturing ──utterance──▶ Debouncing ──quiet──▶ Resolving
//!   ▲                  ▲                        ▲                     │
//!   │                  └──────── barge-in ──────┤                     ▼
//!   └──── follow-up fired ◀── FollowUpArmed ◀── reply done ◀──── Speaking
//! ```

use crate::action::{dispatch_action, ActionDescriptor, ActionExecutor, ActionOutcome};
use crate::capture::{CaptureDevice, CaptureEvent, SpeechCaptureSession, Transcriber, Utterance};
use crate::config::VoiceConfig;
use crate::context::{CommandContext, LAST_INTENT_KEY, LAST_UTTERANCE_KEY};
use crate::error::{ActionExecutionError, CaptureError, VoiceError, VoiceResult};
use crate::playback::{PlaybackEvent, PlaybackOutcome, PlaybackToken, SpeechPlaybackQueue};
use crate::resolver::{CommandResolver, ResolvedCommand};
use crate::scheduler::FollowUpScheduler;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Monotonic turn counter. Only results tagged with the current value are applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Generation(u64);

impl Generation {
    pub fn value(&self) -> u64 {
        self.0
    }

    fn next(self) -> Self {
        Generation(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Idle,
    Capturing,
    Debouncing,
    Resolving,
    Speaking,
    FollowUpArmed,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrchestratorState::Idle => "idle",
            OrchestratorState::Capturing => "capturing",
            OrchestratorState::Debouncing => "debouncing",
            OrchestratorState::Resolving => "resolving",
            OrchestratorState::Speaking => "speaking",
            OrchestratorState::FollowUpArmed => "follow_up_armed",
        };
        f.write_str(s)
    }
}

/// What the portal UI observes.
#[derive(Debug, Clone)]
pub enum AssistantEvent {
    StateChanged {
        state: OrchestratorState,
    },
    /// Live transcript line from the capture session.
    Transcript {
        text: String,
        is_final: bool,
    },
    /// A reply was queued for playback.
    Reply {
        generation: Generation,
        command: ResolvedCommand,
        /// Text actually spoken, including any action failure note.
        spoken: String,
        token: PlaybackToken,
    },
    ActionCompleted {
        generation: Generation,
        action: ActionDescriptor,
        result: Result<ActionOutcome, ActionExecutionError>,
    },
    FollowUp {
        text: String,
    },
    /// Something the user should see but that did not produce a reply (capture errors).
    Notice {
        message: String,
    },
}

enum Command {
    StartCapture(oneshot::Sender<Result<(), CaptureError>>),
    StopCapture(oneshot::Sender<()>),
    AbortCapture(oneshot::Sender<()>),
    SubmitText(String),
    Interrupt,
    Remember { key: String, value: String },
    Shutdown(oneshot::Sender<()>),
}

/// Completions from tasks the loop spawned.
enum Internal {
    Resolved {
        generation: Generation,
        utterance: Utterance,
        command: ResolvedCommand,
    },
    ActionDone {
        generation: Generation,
        command: ResolvedCommand,
        result: Result<ActionOutcome, ActionExecutionError>,
    },
    /// The turn went stale while its action waited for the gate.
    ActionSkipped {
        generation: Generation,
        action: ActionDescriptor,
    },
    FollowUpFired {
        generation: Generation,
    },
}

/// Cloneable control surface for a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<OrchestratorState>,
    events: broadcast::Sender<AssistantEvent>,
}

impl OrchestratorHandle {
    /// Open the microphone. Barges in on any reply or pending turn.
    pub async fn start_capture(&self) -> VoiceResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::StartCapture(tx))?;
        let result = rx
            .await
            .map_err(|_| VoiceError::ChannelClosed("start_capture".to_string()))?;
        Ok(result?)
    }

    /// Finalize the current capture; the last transcript becomes a final utterance.
    pub async fn stop_capture(&self) -> VoiceResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::StopCapture(tx))?;
        rx.await
            .map_err(|_| VoiceError::ChannelClosed("stop_capture".to_string()))
    }

    /// Close the capture without producing an utterance.
    pub async fn abort_capture(&self) -> VoiceResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::AbortCapture(tx))?;
        rx.await
            .map_err(|_| VoiceError::ChannelClosed("abort_capture".to_string()))
    }

    /// Typed input; handled like a final utterance.
    pub fn submit_text(&self, text: impl Into<String>) -> VoiceResult<()> {
        self.send(Command::SubmitText(text.into()))
    }

    /// Stop speaking, drop the follow-up and abandon the pending turn.
    pub fn interrupt(&self) -> VoiceResult<()> {
        self.send(Command::Interrupt)
    }

    /// Store a value in session memory before the next turn.
    pub fn remember(&self, key: impl Into<String>, value: impl Into<String>) -> VoiceResult<()> {
        self.send(Command::Remember {
            key: key.into(),
            value: value.into(),
        })
    }

    /// Release the microphone, silence output and stop the event loop.
    pub async fn shutdown(&self) -> VoiceResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx))?;
        rx.await
            .map_err(|_| VoiceError::ChannelClosed("shutdown".to_string()))
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<OrchestratorState> {
        self.state_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AssistantEvent> {
        self.events.subscribe()
    }

    fn send(&self, command: Command) -> VoiceResult<()> {
        self.commands
            .send(command)
            .map_err(|_| VoiceError::ChannelClosed("orchestrator stopped".to_string()))
    }
}

/// The main voice orchestration system
///
/// This coordinates:
/// - Speech capture (any [`Transcriber`])
/// - Command resolution (shortcuts, then the intent interpreter)
/// - Action dispatch (one at a time)
/// - Reply playback and the follow-up prompt
pub struct VoiceOrchestrator {
    config: VoiceConfig,
    context: CommandContext,
    resolver: Arc<CommandResolver>,
    playback: SpeechPlaybackQueue,
    executor: Arc<dyn ActionExecutor>,
    transcriber: Arc<dyn Transcriber>,
    device: CaptureDevice,
}

impl VoiceOrchestrator {
    pub fn new(
        config: VoiceConfig,
        context: CommandContext,
        resolver: CommandResolver,
        playback: SpeechPlaybackQueue,
        executor: Arc<dyn ActionExecutor>,
        transcriber: Arc<dyn Transcriber>,
    ) -> Self {
        Self {
            config,
            context,
            resolver: Arc::new(resolver),
            playback,
            executor,
            transcriber,
            device: CaptureDevice::default(),
        }
    }

    /// Share a capture device with other orchestrators (only one may listen at a time).
    pub fn with_device(mut self, device: CaptureDevice) -> Self {
        self.device = device;
        self
    }

    /// Start the event loop on the current runtime.
    pub fn spawn(self) -> OrchestratorHandle {
        info!(role = %self.context.role, "🎭 Starting voice orchestrator");

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(OrchestratorState::Idle);
        let (events, _) = broadcast::channel(256);
        let (live_generation, _) = watch::channel(Generation::default());
        let playback_rx = self.playback.subscribe();

        let event_loop = EventLoop {
            capture: SpeechCaptureSession::new(self.transcriber, self.device, capture_tx),
            listening: false,
            config: self.config,
            context: self.context,
            resolver: self.resolver,
            playback: self.playback,
            executor: self.executor,
            action_gate: Arc::new(Mutex::new(())),
            scheduler: FollowUpScheduler::new(),
            state: OrchestratorState::Idle,
            generation: Generation::default(),
            live_generation,
            pending: None,
            debounce_at: None,
            reply: None,
            suggestion: None,
            provisional: None,
            internal_tx,
            state_tx,
            events: events.clone(),
        };
        tokio::spawn(event_loop.run(commands_rx, capture_rx, internal_rx, playback_rx));

        OrchestratorHandle {
            commands: commands_tx,
            state_rx,
            events,
        }
    }
}

struct Provisional {
    generation: Generation,
    utterance: Utterance,
    command: ResolvedCommand,
}

struct EventLoop {
    capture: SpeechCaptureSession,
    listening: bool,
    config: VoiceConfig,
    context: CommandContext,
    resolver: Arc<CommandResolver>,
    playback: SpeechPlaybackQueue,
    executor: Arc<dyn ActionExecutor>,
    action_gate: Arc<Mutex<()>>,
    scheduler: FollowUpScheduler,

    state: OrchestratorState,
    generation: Generation,
    /// Mirror of `generation` for action tasks waiting on the gate.
    live_generation: watch::Sender<Generation>,
    /// Latest utterance of the burst being debounced.
    pending: Option<Utterance>,
    debounce_at: Option<Instant>,
    /// Reply of the current generation that is queued or playing.
    reply: Option<(PlaybackToken, Generation)>,
    /// Follow-up prompt being spoken; never re-arms the scheduler.
    suggestion: Option<PlaybackToken>,
    /// Resolution of an interim, held until the capture turn's final arrives.
    provisional: Option<Provisional>,

    internal_tx: mpsc::UnboundedSender<Internal>,
    state_tx: watch::Sender<OrchestratorState>,
    events: broadcast::Sender<AssistantEvent>,
}

impl EventLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut capture_events: mpsc::UnboundedReceiver<CaptureEvent>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut playback_events: broadcast::Receiver<PlaybackEvent>,
    ) {
        loop {
            let debounce_at = self.debounce_at;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(ack)) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = capture_events.recv() => self.on_capture_event(event),
                Some(message) = internal.recv() => self.on_internal(message),
                event = playback_events.recv() => match event {
                    Ok(event) => self.on_playback_event(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Orchestrator lagged behind playback events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },
                _ = sleep_until(debounce_at), if debounce_at.is_some() => self.on_debounce_elapsed(),
            }
        }
        info!("🛑 Voice orchestrator stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::StartCapture(reply) => {
                self.halt_turn("capture started");
                let result = if self.listening && self.capture.is_listening() {
                    Ok(())
                } else {
                    match self.capture.start().await {
                        Ok(session) => {
                            self.listening = true;
                            debug!(session, "Capture session open");
                            Ok(())
                        }
                        Err(e) => {
                            warn!(error = %e, "Could not start capture");
                            self.notice(capture_notice(&e));
                            Err(e)
                        }
                    }
                };
                self.settle();
                let _ = reply.send(result);
            }
            Command::StopCapture(reply) => {
                // The final utterance arrives through the capture channel.
                self.capture.stop().await;
                self.listening = false;
                let _ = reply.send(());
            }
            Command::AbortCapture(reply) => {
                self.capture.abort().await;
                self.listening = false;
                self.provisional = None;
                if self.state == OrchestratorState::Capturing {
                    self.set_state(OrchestratorState::Idle);
                }
                let _ = reply.send(());
            }
            Command::SubmitText(text) => {
                self.on_utterance(Utterance::final_text(text));
            }
            Command::Interrupt => {
                self.halt_turn("interrupted");
                self.settle();
            }
            Command::Remember { key, value } => {
                let version = self.context.session_memory.remember(key, value);
                debug!(version, "Session memory updated");
            }
            Command::Shutdown(_) => {}
        }
    }

    fn on_capture_event(&mut self, event: CaptureEvent) {
        let current = self.capture.current_session();
        match event {
            CaptureEvent::Utterance { session, utterance } if session == current => {
                let _ = self.events.send(AssistantEvent::Transcript {
                    text: utterance.text.clone(),
                    is_final: utterance.is_final,
                });
                self.on_utterance(utterance);
            }
            CaptureEvent::Ended { session } if session == current => {
                self.listening = false;
                if let Some(held) = self.provisional.take() {
                    if held.generation == self.generation {
                        self.commit(held.generation, held.utterance, held.command);
                        return;
                    }
                }
                if self.state == OrchestratorState::Capturing {
                    self.set_state(OrchestratorState::Idle);
                }
            }
            CaptureEvent::Failed { session, error } if session == current => {
                self.listening = false;
                self.provisional = None;
                self.notice(capture_notice(&error));
                if self.state == OrchestratorState::Capturing {
                    self.set_state(OrchestratorState::Idle);
                }
            }
            other => debug!(?other, "Ignoring event from an old capture session"),
        }
    }

    fn on_utterance(&mut self, utterance: Utterance) {
        if !self.config.is_substantive(&utterance.text) {
            // Speech onset from the microphone: stop talking over the user.
            if !utterance.is_final
                && matches!(
                    self.state,
                    OrchestratorState::Speaking | OrchestratorState::FollowUpArmed
                )
            {
                self.halt_turn("barge-in");
                self.settle();
            }
            return;
        }
        if !utterance.is_final && !self.config.interim_debounce {
            return;
        }
        if let Some(held) = self.provisional.take() {
            if utterance.is_final
                && held.generation == self.generation
                && same_words(&held.utterance.text, &utterance.text)
            {
                debug!(generation = %held.generation, "Final matches the held interim; committing");
                self.commit(held.generation, utterance, held.command);
                return;
            }
        }

        self.scheduler.cancel_current();
        self.playback.cancel_all();
        self.reply = None;
        self.suggestion = None;
        self.advance_generation();
        debug!(generation = %self.generation, is_final = utterance.is_final, text = %utterance.text, "Utterance accepted");

        self.pending = Some(utterance);
        self.debounce_at = Some(Instant::now() + self.config.debounce());
        self.set_state(OrchestratorState::Debouncing);
    }

    fn on_debounce_elapsed(&mut self) {
        self.debounce_at = None;
        let Some(utterance) = self.pending.take() else {
            return;
        };
        let generation = self.generation;
        let ctx = Arc::new(self.context.clone());
        let resolver = Arc::clone(&self.resolver);
        let tx = self.internal_tx.clone();

        info!(%generation, role = %ctx.role, "🧠 Resolving command");
        self.set_state(OrchestratorState::Resolving);
        tokio::spawn(async move {
            let command = resolver.resolve(&utterance, &ctx).await;
            let _ = tx.send(Internal::Resolved {
                generation,
                utterance,
                command,
            });
        });
    }

    fn on_internal(&mut self, message: Internal) {
        match message {
            Internal::Resolved {
                generation,
                utterance,
                command,
            } => self.on_resolved(generation, utterance, command),
            Internal::ActionDone {
                generation,
                command,
                result,
            } => {
                if let Some(action) = command.action.clone() {
                    let _ = self.events.send(AssistantEvent::ActionCompleted {
                        generation,
                        action,
                        result: result.clone(),
                    });
                }
                if generation != self.generation {
                    debug!(%generation, current = %self.generation, "Action finished for a stale turn; reply dropped");
                    return;
                }
                let spoken = match &result {
                    Ok(outcome) => match outcome.detail.as_deref() {
                        Some(detail) if !detail.trim().is_empty() => {
                            format!("{} {}", command.reply, detail)
                        }
                        _ => command.reply.clone(),
                    },
                    Err(_) => format!("{} {}", command.reply, self.config.action_failure_note),
                };
                self.speak(generation, command, spoken);
            }
            Internal::ActionSkipped { generation, action } => {
                debug!(%generation, ?action, "Action skipped: turn superseded while queued");
            }
            Internal::FollowUpFired { generation } => {
                if generation != self.generation || self.state != OrchestratorState::FollowUpArmed {
                    debug!(%generation, "Follow-up fired for a finished turn; ignored");
                    return;
                }
                let text = self.config.follow_up_prompt.clone();
                self.suggestion = Some(self.playback.enqueue(text.clone()));
                let _ = self.events.send(AssistantEvent::FollowUp { text });
                self.settle();
            }
        }
    }

    fn on_resolved(&mut self, generation: Generation, utterance: Utterance, command: ResolvedCommand) {
        if generation != self.generation {
            debug!(%generation, current = %self.generation, "Discarding stale resolution");
            return;
        }
        info!(%generation, source = ?command.source, intent = %command.intent, "✅ Command resolved");
        if !utterance.is_final && self.listening {
            // Side effects wait for the final of this capture turn.
            self.provisional = Some(Provisional {
                generation,
                utterance,
                command,
            });
            self.settle();
            return;
        }
        self.commit(generation, utterance, command);
    }

    /// Record the turn in session memory, then run its action or speak its reply.
    fn commit(&mut self, generation: Generation, utterance: Utterance, command: ResolvedCommand) {
        self.context
            .session_memory
            .remember(LAST_INTENT_KEY, command.intent.clone());
        self.context
            .session_memory
            .remember(LAST_UTTERANCE_KEY, utterance.text);

        match command.action.clone() {
            Some(action) => {
                // Stays Resolving until the reply is queued.
                self.set_state(OrchestratorState::Resolving);
                let executor = Arc::clone(&self.executor);
                let gate = Arc::clone(&self.action_gate);
                let live = self.live_generation.subscribe();
                let ctx = Arc::new(self.context.clone());
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let _serial = gate.lock().await;
                    let current = *live.borrow();
                    if current != generation {
                        let _ = tx.send(Internal::ActionSkipped { generation, action });
                        return;
                    }
                    let result = dispatch_action(executor, action, ctx).await;
                    let _ = tx.send(Internal::ActionDone {
                        generation,
                        command,
                        result,
                    });
                });
            }
            None => {
                let spoken = command.reply.clone();
                self.speak(generation, command, spoken);
            }
        }
    }

    fn speak(&mut self, generation: Generation, command: ResolvedCommand, spoken: String) {
        let token = self.playback.enqueue(spoken.clone());
        self.reply = Some((token, generation));
        let _ = self.events.send(AssistantEvent::Reply {
            generation,
            command,
            spoken,
            token,
        });
        self.set_state(OrchestratorState::Speaking);
    }

    fn on_playback_event(&mut self, event: PlaybackEvent) {
        let PlaybackEvent::Finished { token, outcome } = event else {
            return;
        };
        if self.suggestion == Some(token) {
            self.suggestion = None;
            return;
        }
        let Some((reply_token, generation)) = self.reply else {
            return;
        };
        if reply_token != token || generation != self.generation {
            return;
        }
        self.reply = None;
        match outcome {
            PlaybackOutcome::Cancelled => {}
            PlaybackOutcome::Completed | PlaybackOutcome::Failed(_) => {
                if !self.playback.is_idle() {
                    return;
                }
                let tx = self.internal_tx.clone();
                let token = self.scheduler.arm(self.config.follow_up_delay(), move || {
                    let _ = tx.send(Internal::FollowUpFired { generation });
                });
                debug!(%generation, %token, "Follow-up armed");
                self.set_state(OrchestratorState::FollowUpArmed);
            }
        }
    }

    /// Abandon the current turn: silence, disarm, and invalidate in-flight work.
    fn halt_turn(&mut self, reason: &str) {
        self.scheduler.cancel_current();
        self.playback.cancel_all();
        self.pending = None;
        self.debounce_at = None;
        self.reply = None;
        self.suggestion = None;
        self.provisional = None;
        self.advance_generation();
        debug!(generation = %self.generation, reason, "Turn halted");
    }

    fn advance_generation(&mut self) {
        self.generation = self.generation.next();
        self.live_generation.send_replace(self.generation);
    }

    /// Back to Capturing or Idle, depending on the microphone.
    fn settle(&mut self) {
        let rest = if self.listening {
            OrchestratorState::Capturing
        } else {
            OrchestratorState::Idle
        };
        self.set_state(rest);
    }

    async fn shutdown(&mut self) {
        self.capture.abort().await;
        self.listening = false;
        self.halt_turn("shutdown");
        self.set_state(OrchestratorState::Idle);
    }

    fn notice(&self, message: String) {
        let _ = self.events.send(AssistantEvent::Notice { message });
    }

    fn set_state(&mut self, state: OrchestratorState) {
        if self.state == state {
            return;
        }
        debug!(from = %self.state, to = %state, "State change");
        self.state = state;
        self.state_tx.send_replace(state);
        let _ = self.events.send(AssistantEvent::StateChanged { state });
    }
}

fn capture_notice(error: &CaptureError) -> String {
    match error {
        CaptureError::PermissionDenied(_) => {
            "Microphone access was denied. You can type your request instead.".to_string()
        }
        CaptureError::DeviceBusy | CaptureError::AlreadyListening => {
            "The microphone is already in use.".to_string()
        }
        CaptureError::DeviceUnavailable(_) => {
            "No microphone is available. You can type your request instead.".to_string()
        }
        CaptureError::Stream(_) | CaptureError::Transcription(_) => {
            "I lost the microphone. Please try again.".to_string()
        }
    }
}

/// Same words ignoring case, spacing and trailing punctuation.
fn same_words(a: &str, b: &str) -> bool {
    let words = |s: &str| {
        s.split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
            .filter(|w| !w.is_empty())
            .collect::<Vec<_>>()
    };
    words(a) == words(b)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generations_are_ordered() {
        let g = Generation::default();
        assert!(g.next() > g);
        assert_eq!(g.next().next().value(), 2);
        assert_eq!(g.next().to_string(), "gen-1");
    }

    #[test]
    fn final_matches_interim_ignoring_case_and_punctuation() {
        assert!(same_words("show my patients", "Show my  patients."));
        assert!(!same_words("show me my lab", "show me my lab results"));
    }

    #[test]
    fn permission_notice_suggests_typing() {
        let msg = capture_notice(&CaptureError::PermissionDenied("denied".into()));
        assert!(msg.contains("type"));
    }
}
