//! Conversation demo — full voice loop with optional production backends.
//!
//! - **Recognition**: `HttpTranscriber` if `STT_API_KEY` is set, else a
//!   placeholder that describes each utterance.
//! - **Synthesis**: `HttpSynthesizer` if `TTS_API_URL` is set, else a
//!   placeholder that plays nothing.
//!
//! Speak, pause, and the assistant echoes what it heard. Interrupt it
//! mid-sentence to hear the barge-in cut. Press Ctrl+C to stop.

use futures::StreamExt;
use pitchline_voice::{
    create_best_recognizer, HttpSynthesizer, PlaceholderSynthesizer, SessionConfig,
    SessionEvent, SpeechSynthesizer, VoiceSession,
};
use std::sync::Arc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Pitchline voice demo — speak, pause, interrupt.");
    info!("Set STT_API_KEY / TTS_API_URL for production backends.\n");

    let recognizer = create_best_recognizer();
    let synthesizer: Arc<dyn SpeechSynthesizer> = match HttpSynthesizer::from_env() {
        Ok(s) => {
            info!("synthesis: remote endpoint");
            Arc::new(s)
        }
        Err(_) => {
            info!("synthesis: placeholder (set TTS_API_URL to hear replies)");
            Arc::new(PlaceholderSynthesizer)
        }
    };

    let (session, handle, events) =
        VoiceSession::new(SessionConfig::from_env(), recognizer, synthesizer)?;

    handle.start_conversation()?;

    let shutdown = handle.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown.shutdown();
    });

    tokio::spawn(async move {
        let mut events = UnboundedReceiverStream::new(events);
        while let Some(event) = events.next().await {
            match event {
                SessionEvent::StateChanged { from, to, .. } => {
                    info!("state: {:?} -> {:?}", from, to);
                }
                SessionEvent::InterimTranscript { text } => info!("hearing: {text}"),
                SessionEvent::UtteranceComplete { text, .. } => info!("you said: {text}"),
                SessionEvent::Notification(n) => info!("[{:?}] {}: {}", n.severity, n.title, n.description),
                _ => {}
            }
        }
    });

    let on_text = |text: String| async move {
        format!("You said: {}.", text.trim())
    };

    session.run(on_text).await?;
    Ok(())
}
