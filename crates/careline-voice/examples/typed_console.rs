//! Example: typed voice-assistant console
//!
//! Type a request per line as if you had said it. Replies are "spoken" by the
//! console sink; the follow-up prompt appears after the configured delay.
//!
//! ```text
//! CARELINE_ROLE=provider INTERPRETER_API_KEY=sk-... cargo run --example typed_console
//! ```

use careline_voice::{
    AssistantEvent, ChannelTranscriber, ChatIntentInterpreter, CommandContext, CommandResolver,
    ConsoleSink, IntentInterpreter, LoggingActionExecutor, OfflineInterpreter, Role,
    ShortcutTable, SilentSynthesizer, SpeechPlaybackQueue, VoiceConfig, VoiceOrchestrator,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn role_from_env() -> Role {
    match std::env::var("CARELINE_ROLE").as_deref() {
        Ok("provider") => Role::Provider,
        Ok("owner") => Role::Owner,
        Ok("admin") => Role::Admin,
        _ => Role::Patient,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = VoiceConfig::load()?;
    let role = role_from_env();

    let interpreter: Arc<dyn IntentInterpreter> = match ChatIntentInterpreter::from_env() {
        Some(chat) => Arc::new(chat),
        None => {
            warn!("No INTERPRETER_API_KEY; only shortcuts will work");
            Arc::new(OfflineInterpreter)
        }
    };
    let resolver = CommandResolver::new(
        ShortcutTable::portal_defaults(),
        interpreter,
        config.interpreter_timeout(),
        config.apology_reply.clone(),
    );
    let playback = SpeechPlaybackQueue::new(
        Arc::new(SilentSynthesizer),
        Arc::new(ConsoleSink::new(config.console_words_per_minute)),
    );

    let handle = VoiceOrchestrator::new(
        config,
        CommandContext::new(role, "console-user"),
        resolver,
        playback,
        Arc::new(LoggingActionExecutor),
        Arc::new(ChannelTranscriber::new()),
    )
    .spawn();

    let mut events = handle.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                AssistantEvent::StateChanged { state } => info!("state → {}", state),
                AssistantEvent::ActionCompleted { action, result, .. } => match result {
                    Ok(_) => info!("✅ {}", action),
                    Err(e) => warn!("❌ {}: {}", action, e),
                },
                AssistantEvent::Notice { message } => warn!("{}", message),
                _ => {}
            }
        }
    });

    info!("🎤 Careline voice console ({}). Type a request, Ctrl+D to quit.", role);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            handle.interrupt()?;
            continue;
        }
        handle.submit_text(line)?;
    }

    handle.shutdown().await?;
    Ok(())
}
