//! Example: speak to the assistant through the default microphone
//!
//! Requires the `device` feature, an input device, and an STT key
//! (`STT_API_KEY` or `OPENAI_API_KEY`). Replies play through the speakers when a
//! TTS key is set, otherwise they are printed.
//!
//! ```text
//! cargo run --example microphone_console --features device
//! ```

use careline_voice::{
    create_best_stt, AssistantEvent, AudioSink, ChatIntentInterpreter, CommandContext,
    CommandResolver, ConsoleSink, IntentInterpreter, LoggingActionExecutor, MicrophoneConfig,
    MicrophoneTranscriber, OfflineInterpreter, OpenAiSpeechSynthesizer, Role, RodioSink,
    ShortcutTable, SilentSynthesizer, SpeechPlaybackQueue, SpeechSynthesizer, VoiceConfig,
    VoiceOrchestrator,
};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = VoiceConfig::load()?;

    let interpreter: Arc<dyn IntentInterpreter> = match ChatIntentInterpreter::from_env() {
        Some(chat) => Arc::new(chat),
        None => Arc::new(OfflineInterpreter),
    };
    let resolver = CommandResolver::new(
        ShortcutTable::portal_defaults(),
        interpreter,
        config.interpreter_timeout(),
        config.apology_reply.clone(),
    );

    let (synthesizer, sink): (Arc<dyn SpeechSynthesizer>, Arc<dyn AudioSink>) =
        match (OpenAiSpeechSynthesizer::from_env(), RodioSink::new()) {
            (Some(tts), Ok(speaker)) => (Arc::new(tts), Arc::new(speaker)),
            (_, Err(e)) => {
                warn!("Speaker unavailable ({}); printing replies", e);
                (Arc::new(SilentSynthesizer), Arc::new(ConsoleSink::new(config.console_words_per_minute)))
            }
            (None, Ok(_)) => (
                Arc::new(SilentSynthesizer),
                Arc::new(ConsoleSink::new(config.console_words_per_minute)),
            ),
        };
    let playback = SpeechPlaybackQueue::new(synthesizer, sink);

    let microphone = MicrophoneTranscriber::new(MicrophoneConfig::default(), Arc::from(create_best_stt()));
    let handle = VoiceOrchestrator::new(
        config,
        CommandContext::new(Role::Patient, "mic-user"),
        resolver,
        playback,
        Arc::new(LoggingActionExecutor),
        Arc::new(microphone),
    )
    .spawn();

    let mut events = handle.subscribe();
    handle.start_capture().await?;
    info!("✅ Listening... speak into your microphone! Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(AssistantEvent::Transcript { text, is_final: true }) => info!("📝 {}", text),
                Ok(AssistantEvent::Notice { message }) => warn!("{}", message),
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    handle.shutdown().await?;
    Ok(())
}
