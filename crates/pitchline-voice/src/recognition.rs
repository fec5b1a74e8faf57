//! Speech recognition behind a uniform start/stop/event contract.
//!
//! The engine does not implement recognition itself: the host platform
//! supplies a [`RecognitionBackend`], and [`SpeechRecognitionAdapter`] is a
//! pure event relay over it. Streaming backends push interim and final
//! transcripts as they arrive; batch backends (`wants_audio`) transcribe
//! whole utterances of PCM handed to them when silence completes a turn.

use crate::error::{RecognitionErrorKind, VoiceError, VoiceResult};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Single-utterance or continuous listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionMode {
    /// Stop after the first final result.
    SingleShot,
    /// Keep listening across utterances until stopped.
    Continuous,
}

/// Events pushed by a recognition backend.
#[derive(Debug, Clone)]
pub enum RecognitionEvent {
    Interim(String),
    Final(String),
    Error(RecognitionErrorKind),
    /// The backend's session terminated, whether stopped or unsolicited.
    Ended,
}

/// One committed utterance of PCM for batch transcription.
#[derive(Debug, Clone)]
pub struct UtteranceAudio {
    /// PCM samples (f32, -1.0..1.0, mono).
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Approximate speech duration.
    pub duration: Duration,
    /// When the utterance was committed.
    pub captured_at: DateTime<Utc>,
}

/// Contract the platform's speech-to-text engine is wrapped behind.
pub trait RecognitionBackend: Send {
    /// Begin a recognition session, pushing events into `events`. The
    /// backend must emit `Ended` exactly once when the session terminates.
    fn start(
        &mut self,
        mode: RecognitionMode,
        events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> VoiceResult<()>;

    /// End the session.
    fn stop(&mut self);

    /// Whether this backend transcribes utterance PCM handed to it rather
    /// than listening on its own.
    fn wants_audio(&self) -> bool {
        false
    }

    /// Hand a committed utterance's PCM to a batch backend.
    fn feed_utterance(&mut self, _audio: UtteranceAudio) {}
}

/// Pure event relay over a backend.
///
/// Duplicate `start` calls while a session is active are a no-op, and in
/// single-shot mode the adapter stops itself after the first final result.
/// It holds no conversational state beyond the active mode.
pub struct SpeechRecognitionAdapter {
    backend: Box<dyn RecognitionBackend>,
    events: mpsc::UnboundedSender<RecognitionEvent>,
    mode: Option<RecognitionMode>,
}

impl SpeechRecognitionAdapter {
    pub fn new(
        backend: Box<dyn RecognitionBackend>,
        events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> Self {
        Self {
            backend,
            events,
            mode: None,
        }
    }

    pub fn start(&mut self, mode: RecognitionMode) -> VoiceResult<()> {
        if self.mode.is_some() {
            debug!("recognition already active; duplicate start ignored");
            return Ok(());
        }
        self.backend.start(mode, self.events.clone())?;
        self.mode = Some(mode);
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.mode.take().is_some() {
            self.backend.stop();
        }
    }

    pub fn is_active(&self) -> bool {
        self.mode.is_some()
    }

    /// Bookkeeping on the relayed event stream. Called by the session loop
    /// for every event before it reaches the state machine.
    pub fn observe(&mut self, event: &RecognitionEvent) {
        match event {
            RecognitionEvent::Final(_) if self.mode == Some(RecognitionMode::SingleShot) => {
                self.stop();
            }
            RecognitionEvent::Ended => {
                self.mode = None;
            }
            RecognitionEvent::Error(kind) if !kind.is_transient() => {
                self.mode = None;
            }
            _ => {}
        }
    }

    pub fn wants_audio(&self) -> bool {
        self.backend.wants_audio()
    }

    pub fn feed_utterance(&mut self, audio: UtteranceAudio) {
        if self.mode.is_some() && self.backend.wants_audio() {
            self.backend.feed_utterance(audio);
        }
    }
}

/// Encode f32 PCM (mono) to 16-bit WAV bytes for multipart upload.
fn encode_wav_pcm16(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut buf = Vec::with_capacity(44 + samples.len() * 2);
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes()); // fmt subchunk size
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
    buf.extend_from_slice(&2u16.to_le_bytes()); // block align
    buf.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    for &s in samples {
        let i = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        buf.extend_from_slice(&i.to_le_bytes());
    }
    buf
}

/// Batch transcription backend for an OpenAI-compatible endpoint.
///
/// Receives committed-utterance PCM, encodes 16-bit WAV, and posts it as
/// multipart form data to `{base_url}/audio/transcriptions`.
pub struct HttpTranscriber {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    /// Bearer API key.
    pub api_key: String,
    /// Model: whisper-1, gpt-4o-transcribe, etc.
    pub model: String,
    client: reqwest::Client,
    events: Option<mpsc::UnboundedSender<RecognitionEvent>>,
}

impl HttpTranscriber {
    /// Build from environment: STT_API_URL, STT_API_KEY, STT_MODEL
    /// (default whisper-1).
    pub fn from_env() -> VoiceResult<Self> {
        let base_url = std::env::var("STT_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("STT_API_KEY")
            .map_err(|_| VoiceError::Config("transcription requires STT_API_KEY".to_string()))?;
        let model = std::env::var("STT_MODEL").unwrap_or_else(|_| "whisper-1".to_string());
        Self::new(base_url, api_key, model)
    }

    /// Create with explicit config.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VoiceError::Config(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
            events: None,
        })
    }
}

impl RecognitionBackend for HttpTranscriber {
    fn start(
        &mut self,
        mode: RecognitionMode,
        events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> VoiceResult<()> {
        info!("transcription backend ready ({:?}, model {})", mode, self.model);
        self.events = Some(events);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(events) = self.events.take() {
            let _ = events.send(RecognitionEvent::Ended);
        }
    }

    fn wants_audio(&self) -> bool {
        true
    }

    fn feed_utterance(&mut self, audio: UtteranceAudio) {
        let Some(events) = self.events.clone() else {
            return;
        };
        if audio.samples.is_empty() {
            return;
        }
        let wav = encode_wav_pcm16(&audio.samples, audio.sample_rate);
        let url = format!(
            "{}/audio/transcriptions",
            self.base_url.trim_end_matches('/')
        );
        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let model = self.model.clone();

        tokio::spawn(async move {
            let part = match reqwest::multipart::Part::bytes(wav)
                .file_name("utterance.wav")
                .mime_str("audio/wav")
            {
                Ok(p) => p,
                Err(e) => {
                    warn!("transcription upload failed: {}", e);
                    let _ = events.send(RecognitionEvent::Error(RecognitionErrorKind::Other));
                    return;
                }
            };
            let form = reqwest::multipart::Form::new()
                .part("file", part)
                .text("model", model);
            let res = match client
                .post(&url)
                .bearer_auth(&api_key)
                .multipart(form)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!("transcription request failed: {}", e);
                    let _ = events.send(RecognitionEvent::Error(RecognitionErrorKind::Other));
                    return;
                }
            };
            if !res.status().is_success() {
                warn!("transcription endpoint returned {}", res.status());
                let _ = events.send(RecognitionEvent::Error(RecognitionErrorKind::Other));
                return;
            }
            let text = res
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("text").and_then(|t| t.as_str()).map(str::to_string))
                .unwrap_or_default();
            let text = text.trim().to_string();
            if text.is_empty() {
                // The service heard nothing; an expected transient.
                let _ = events.send(RecognitionEvent::Error(RecognitionErrorKind::NoSpeech));
            } else {
                let _ = events.send(RecognitionEvent::Final(text));
            }
        });
    }
}

/// Placeholder backend: echoes a description of each utterance instead of
/// transcribing it. Use for exercising the loop without an API key.
#[derive(Debug, Default)]
pub struct PlaceholderRecognizer {
    /// If set, emitted as the final transcript for every utterance.
    pub response: Option<String>,
    events: Option<mpsc::UnboundedSender<RecognitionEvent>>,
}

impl PlaceholderRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(response: String) -> Self {
        Self {
            response: Some(response),
            events: None,
        }
    }
}

impl RecognitionBackend for PlaceholderRecognizer {
    fn start(
        &mut self,
        _mode: RecognitionMode,
        events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> VoiceResult<()> {
        self.events = Some(events);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(events) = self.events.take() {
            let _ = events.send(RecognitionEvent::Ended);
        }
    }

    fn wants_audio(&self) -> bool {
        true
    }

    fn feed_utterance(&mut self, audio: UtteranceAudio) {
        let Some(events) = &self.events else {
            return;
        };
        let text = match &self.response {
            Some(r) => r.clone(),
            None => format!(
                "[placeholder transcript: {} samples, {:.1}s]",
                audio.samples.len(),
                audio.duration.as_secs_f32()
            ),
        };
        let _ = events.send(RecognitionEvent::Final(text));
    }
}

/// Test backend that replays a scripted event sequence when started.
pub struct ScriptedRecognizer {
    script: Vec<RecognitionEvent>,
    pub starts: usize,
    pub stops: usize,
}

impl ScriptedRecognizer {
    pub fn new(script: Vec<RecognitionEvent>) -> Self {
        Self {
            script,
            starts: 0,
            stops: 0,
        }
    }
}

impl RecognitionBackend for ScriptedRecognizer {
    fn start(
        &mut self,
        _mode: RecognitionMode,
        events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> VoiceResult<()> {
        self.starts += 1;
        for event in self.script.drain(..) {
            let _ = events.send(event);
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.stops += 1;
    }
}

/// Create the best available recognition backend from the environment:
/// `HttpTranscriber` when `STT_API_KEY` is set, placeholder otherwise.
pub fn create_best_recognizer() -> Box<dyn RecognitionBackend> {
    match HttpTranscriber::from_env() {
        Ok(t) => Box::new(t),
        Err(_) => Box::new(PlaceholderRecognizer::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_header_layout() {
        let wav = encode_wav_pcm16(&[0.0, 0.5, -0.5, 1.0], 16000);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(wav.len(), 44 + 8);
        // data length field
        assert_eq!(u32::from_le_bytes([wav[40], wav[41], wav[42], wav[43]]), 8);
    }

    #[test]
    fn wav_clamps_out_of_range_samples() {
        let wav = encode_wav_pcm16(&[2.0], 16000);
        let sample = i16::from_le_bytes([wav[44], wav[45]]);
        assert_eq!(sample, i16::MAX);
    }

    #[test]
    fn adapter_duplicate_start_is_noop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let backend = ScriptedRecognizer::new(vec![RecognitionEvent::Interim("hi".into())]);
        let mut adapter = SpeechRecognitionAdapter::new(Box::new(backend), tx);

        adapter.start(RecognitionMode::Continuous).unwrap();
        adapter.start(RecognitionMode::Continuous).unwrap();
        assert!(adapter.is_active());

        // The script ran once, so exactly one event arrived.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn single_shot_stops_after_final() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let backend = ScriptedRecognizer::new(vec![RecognitionEvent::Final("done".into())]);
        let mut adapter = SpeechRecognitionAdapter::new(Box::new(backend), tx);

        adapter.start(RecognitionMode::SingleShot).unwrap();
        let event = rx.try_recv().unwrap();
        adapter.observe(&event);
        assert!(!adapter.is_active());
    }

    #[test]
    fn continuous_final_keeps_listening() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let backend = ScriptedRecognizer::new(vec![RecognitionEvent::Final("first".into())]);
        let mut adapter = SpeechRecognitionAdapter::new(Box::new(backend), tx);

        adapter.start(RecognitionMode::Continuous).unwrap();
        let event = rx.try_recv().unwrap();
        adapter.observe(&event);
        assert!(adapter.is_active());
    }

    #[test]
    fn ended_clears_active_mode() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let backend = ScriptedRecognizer::new(vec![RecognitionEvent::Ended]);
        let mut adapter = SpeechRecognitionAdapter::new(Box::new(backend), tx);

        adapter.start(RecognitionMode::Continuous).unwrap();
        let event = rx.try_recv().unwrap();
        adapter.observe(&event);
        assert!(!adapter.is_active());
    }

    #[test]
    fn placeholder_describes_the_utterance() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut backend = PlaceholderRecognizer::new();
        backend.start(RecognitionMode::Continuous, tx).unwrap();
        backend.feed_utterance(UtteranceAudio {
            samples: vec![0.0; 480],
            sample_rate: 16000,
            duration: Duration::from_millis(30),
            captured_at: Utc::now(),
        });
        let Ok(RecognitionEvent::Final(text)) = rx.try_recv() else {
            panic!("expected a final transcript");
        };
        assert!(text.contains("480"));
    }
}
