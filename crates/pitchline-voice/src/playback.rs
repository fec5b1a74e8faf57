//! Speech synthesis and playback — and the barge-in kill-switch.
//!
//! `speak` fetches synthesized audio from the synthesis endpoint, then plays
//! it through a single generation-counted `rodio` sink. Acquiring a new
//! playback handle always tears down the previous one, and `stop` is the
//! idempotent primitive the interruption path calls.

use crate::error::{SynthesisError, VoiceError, VoiceResult};
use async_trait::async_trait;
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Turns assistant text into an audio payload (WAV/MP3 bytes). Return an
/// empty vec to skip playback.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, SynthesisError>;
}

/// Placeholder synthesizer: returns empty audio so nothing plays.
#[derive(Debug, Default)]
pub struct PlaceholderSynthesizer;

#[async_trait]
impl SpeechSynthesizer for PlaceholderSynthesizer {
    async fn synthesize(&self, _text: &str, _voice_id: &str) -> Result<Vec<u8>, SynthesisError> {
        Ok(Vec::new())
    }
}

fn classify_status(status: reqwest::StatusCode) -> SynthesisError {
    match status.as_u16() {
        408 => SynthesisError::TooLong,
        503 => SynthesisError::ServiceUnavailable,
        code => SynthesisError::Unknown(format!("synthesis endpoint returned {code}")),
    }
}

/// Tailored user-facing message for each synthesis failure. The engine never
/// retries; the conversation handler decides what to do next.
pub fn synthesis_user_message(err: &SynthesisError) -> &'static str {
    match err {
        SynthesisError::TooLong => {
            "That reply was too long to read aloud. Try asking for a shorter answer."
        }
        SynthesisError::ServiceUnavailable => {
            "The voice service is busy right now. Please try again in a moment."
        }
        SynthesisError::Network(_) => "Could not reach the voice service. Check your connection.",
        SynthesisError::Unknown(_) => "Speech playback failed.",
    }
}

/// Remote synthesis endpoint: `POST { "text": ..., "voiceId": ... }`, audio
/// bytes on success.
#[derive(Debug, Clone)]
pub struct HttpSynthesizer {
    /// Full endpoint URL.
    pub endpoint: String,
    /// Optional bearer API key.
    pub api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpSynthesizer {
    /// Build from environment: TTS_API_URL (required), TTS_API_KEY.
    pub fn from_env() -> VoiceResult<Self> {
        let endpoint = std::env::var("TTS_API_URL")
            .map_err(|_| VoiceError::Config("synthesis requires TTS_API_URL".to_string()))?;
        let api_key = std::env::var("TTS_API_KEY").ok();
        let mut s = Self::new(endpoint)?;
        s.api_key = api_key;
        Ok(s)
    }

    pub fn new(endpoint: impl Into<String>) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::Config(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.into(),
            api_key: None,
            client,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, SynthesisError> {
        let body = serde_json::json!({
            "text": text,
            "voiceId": voice_id,
        });
        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        let res = req
            .send()
            .await
            .map_err(|e| SynthesisError::Network(e.to_string()))?;
        if !res.status().is_success() {
            return Err(classify_status(res.status()));
        }
        let bytes = res
            .bytes()
            .await
            .map_err(|e| SynthesisError::Network(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Playback lifecycle of the current utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    /// Awaiting the synthesis response; nothing is audible yet.
    Generating,
    /// Audio buffered but held (`auto_play` off).
    Ready,
    Playing,
}

/// Reported by the completion watcher when a handle drains.
#[derive(Debug, Clone, Copy)]
pub enum PlaybackEvent {
    Finished(u64),
}

/// Playback knobs from the session config.
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Start playback as soon as the payload is buffered (default: true)
    pub auto_play: bool,

    /// Fixed post-load playback-rate multiplier (default: 1.0)
    pub playback_rate: f32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            auto_play: true,
            playback_rate: 1.0,
        }
    }
}

struct PlaybackHandle {
    sink: Arc<Sink>,
    generation: u64,
}

struct OutputAudio {
    _stream: OutputStream,
    handle: OutputStreamHandle,
}

/// Manages synthesis requests and the single live playback handle.
pub struct SpeechSynthesisPlayer {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    config: PlaybackConfig,
    voice_id: String,
    /// Output device, opened on the first audible payload.
    output: Option<OutputAudio>,
    current: Option<PlaybackHandle>,
    generation: u64,
    state: PlayerState,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

impl SpeechSynthesisPlayer {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        config: PlaybackConfig,
        voice_id: impl Into<String>,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Self {
        Self {
            synthesizer,
            config,
            voice_id: voice_id.into(),
            output: None,
            current: None,
            generation: 0,
            state: PlayerState::Idle,
            events,
        }
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    /// Generating, armed, or playing.
    pub fn is_active(&self) -> bool {
        self.state != PlayerState::Idle
    }

    /// Fetch synthesized audio for `text` and start (or arm) playback.
    ///
    /// Suspends at the synthesis request; playback begins only once the full
    /// payload is buffered into the sink, never on response arrival.
    pub async fn speak(&mut self, text: &str) -> VoiceResult<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(VoiceError::Config("cannot synthesize empty text".to_string()));
        }

        self.state = PlayerState::Generating;
        let bytes = match self.synthesizer.synthesize(text, &self.voice_id).await {
            Ok(b) => b,
            Err(e) => {
                self.state = PlayerState::Idle;
                return Err(e.into());
            }
        };

        if bytes.is_empty() {
            debug!("synthesizer returned no audio; nothing to play");
            self.state = PlayerState::Idle;
            return Ok(());
        }

        // A new handle always displaces the previous one.
        self.teardown_current();

        if self.output.is_none() {
            match OutputStream::try_default() {
                Ok((stream, handle)) => {
                    info!("audio output opened");
                    self.output = Some(OutputAudio {
                        _stream: stream,
                        handle,
                    });
                }
                Err(e) => {
                    self.state = PlayerState::Idle;
                    return Err(VoiceError::Playback(e.to_string()));
                }
            }
        }
        let Some(output) = self.output.as_ref() else {
            self.state = PlayerState::Idle;
            return Err(VoiceError::Playback("audio output unavailable".to_string()));
        };

        let sink = match Sink::try_new(&output.handle) {
            Ok(sink) => sink,
            Err(e) => {
                self.state = PlayerState::Idle;
                return Err(VoiceError::Playback(e.to_string()));
            }
        };
        let source = match Decoder::new(Cursor::new(bytes)) {
            Ok(source) => source,
            Err(e) => {
                self.state = PlayerState::Idle;
                return Err(VoiceError::Playback(format!("decode failed: {e}")));
            }
        };

        sink.set_speed(self.config.playback_rate);
        if !self.config.auto_play {
            sink.pause();
        }
        sink.append(source.convert_samples::<f32>());

        self.generation += 1;
        let generation = self.generation;
        let sink = Arc::new(sink);

        // Completion watcher: reports once the sink drains. Stale reports
        // from displaced handles are filtered by generation.
        let watcher = Arc::clone(&sink);
        let events = self.events.clone();
        std::thread::spawn(move || {
            watcher.sleep_until_end();
            let _ = events.send(PlaybackEvent::Finished(generation));
        });

        self.current = Some(PlaybackHandle { sink, generation });
        self.state = if self.config.auto_play {
            PlayerState::Playing
        } else {
            PlayerState::Ready
        };
        Ok(())
    }

    /// Begin playback of an armed utterance (`auto_play` off).
    pub fn play(&mut self) {
        if let Some(ref handle) = self.current {
            handle.sink.play();
            self.state = PlayerState::Playing;
        }
    }

    /// Stop playback and release the active handle. Idempotent and always
    /// safe to call, even when nothing is playing — this is the primitive
    /// the interruption path uses.
    pub fn stop(&mut self) {
        self.teardown_current();
        if self.state != PlayerState::Idle {
            info!("playback stopped");
        }
        self.state = PlayerState::Idle;
    }

    fn teardown_current(&mut self) {
        if let Some(handle) = self.current.take() {
            handle.sink.stop();
            debug!("playback handle {} released", handle.generation);
        }
    }

    /// True when this completion report belongs to the live handle; stale
    /// reports from displaced or stopped handles return false.
    pub fn acknowledge_finished(&mut self, generation: u64) -> bool {
        match self.current {
            Some(ref handle) if handle.generation == generation => {
                self.current = None;
                self.state = PlayerState::Idle;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player() -> (SpeechSynthesisPlayer, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let player = SpeechSynthesisPlayer::new(
            Arc::new(PlaceholderSynthesizer),
            PlaybackConfig::default(),
            "amber",
            tx,
        );
        (player, rx)
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            classify_status(reqwest::StatusCode::REQUEST_TIMEOUT),
            SynthesisError::TooLong
        ));
        assert!(matches!(
            classify_status(reqwest::StatusCode::SERVICE_UNAVAILABLE),
            SynthesisError::ServiceUnavailable
        ));
        assert!(matches!(
            classify_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR),
            SynthesisError::Unknown(_)
        ));
    }

    #[test]
    fn user_messages_are_distinct() {
        let msgs = [
            synthesis_user_message(&SynthesisError::TooLong),
            synthesis_user_message(&SynthesisError::ServiceUnavailable),
            synthesis_user_message(&SynthesisError::Network(String::new())),
            synthesis_user_message(&SynthesisError::Unknown(String::new())),
        ];
        for (i, a) in msgs.iter().enumerate() {
            for b in msgs.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[tokio::test]
    async fn placeholder_synthesizer_returns_empty() {
        let out = PlaceholderSynthesizer
            .synthesize("hello", "amber")
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn empty_text_is_rejected() {
        let (mut player, _rx) = player();
        assert!(player.speak("   ").await.is_err());
        assert_eq!(player.state(), PlayerState::Idle);
    }

    #[tokio::test]
    async fn empty_payload_plays_nothing() {
        let (mut player, _rx) = player();
        player.speak("hello there").await.unwrap();
        assert!(!player.is_active());
    }

    #[test]
    fn stop_is_idempotent_when_nothing_is_playing() {
        let (mut player, _rx) = player();
        player.stop();
        player.stop();
        assert_eq!(player.state(), PlayerState::Idle);
    }

    #[test]
    fn stale_completion_reports_are_ignored() {
        let (mut player, _rx) = player();
        assert!(!player.acknowledge_finished(1));
        assert_eq!(player.state(), PlayerState::Idle);
    }
}
