//! The voice session: one explicit object owning every resource, one
//! serialized state-transition path, one idempotent teardown.
//!
//! Three asynchronous sources feed the same state — the VAD timer tick,
//! recognition events, and playback events. All of them are funneled through
//! [`TurnEngine::handle`] from a single `select!` loop, so an interrupt
//! decision is always made against the state it was observed in and side
//! effects are never split across ticks.
//!
//! `VoiceSession` is not `Send` (the playback output stream is platform
//! audio); await `run` on the task that created it rather than spawning it.

use crate::audio::{AnalysisGraph, AudioCaptureManager, CaptureConfig};
use crate::error::{VoiceError, VoiceResult};
use crate::playback::{
    synthesis_user_message, PlaybackConfig, PlaybackEvent, SpeechSynthesisPlayer,
    SpeechSynthesizer,
};
use crate::recognition::{
    RecognitionBackend, RecognitionEvent, SpeechRecognitionAdapter, UtteranceAudio,
};
use crate::turn::{Action, Notification, Severity, TurnConfig, TurnEngine, TurnInput, TurnState};
use crate::vad::{EnergyVad, VadConfig, VoiceActivityState};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Immutable per-session configuration. Set once at session start.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Voice identifier sent to the synthesis endpoint (default: "amber")
    pub voice_id: String,

    /// Start playback as soon as synthesized audio is buffered (default: true)
    pub auto_play: bool,

    /// Fixed post-load playback-rate multiplier (default: 1.0)
    pub playback_rate: f32,

    /// Silence run that completes an utterance (default: 2000ms)
    pub silence_threshold_ms: u64,

    /// RMS above this while the assistant speaks triggers barge-in
    /// (default: 0.02)
    pub interrupt_threshold_rms: f32,

    /// RMS below this is classified as silence (default: 0.008)
    pub noise_gate_rms: f32,

    /// VAD tick period (default: 50ms)
    pub vad_tick_ms: u64,

    /// Capture sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Analysis window size in samples (default: 256)
    pub analysis_window: usize,

    /// Exponential smoothing factor for the published level (default: 0.8)
    pub level_smoothing: f32,

    /// Pause after barge-in before recognition restarts (default: 200ms)
    pub guard_delay_ms: u64,

    /// Delay before recognition auto-restart (default: 250ms)
    pub restart_delay_ms: u64,

    /// Hard cap on one utterance before auto-commit (default: 30000ms)
    pub max_utterance_ms: u64,

    /// Utterances shorter than this are dropped, not transcribed
    /// (default: 200ms)
    pub min_utterance_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            voice_id: "amber".to_string(),
            auto_play: true,
            playback_rate: 1.0,
            silence_threshold_ms: 2000,
            interrupt_threshold_rms: 0.02,
            noise_gate_rms: 0.008,
            vad_tick_ms: 50,
            sample_rate: 16000,
            analysis_window: 256,
            level_smoothing: 0.8,
            guard_delay_ms: 200,
            restart_delay_ms: 250,
            max_utterance_ms: 30_000,
            min_utterance_ms: 200,
        }
    }
}

impl SessionConfig {
    /// Build from `PITCHLINE_*` environment variables, falling back to the
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            voice_id: std::env::var("PITCHLINE_VOICE_ID").unwrap_or(d.voice_id),
            auto_play: env_or("PITCHLINE_AUTO_PLAY", d.auto_play),
            playback_rate: env_or("PITCHLINE_PLAYBACK_RATE", d.playback_rate),
            silence_threshold_ms: env_or("PITCHLINE_SILENCE_THRESHOLD_MS", d.silence_threshold_ms),
            interrupt_threshold_rms: env_or("PITCHLINE_INTERRUPT_RMS", d.interrupt_threshold_rms),
            noise_gate_rms: env_or("PITCHLINE_NOISE_GATE_RMS", d.noise_gate_rms),
            vad_tick_ms: env_or("PITCHLINE_VAD_TICK_MS", d.vad_tick_ms),
            sample_rate: env_or("PITCHLINE_SAMPLE_RATE", d.sample_rate),
            analysis_window: env_or("PITCHLINE_ANALYSIS_WINDOW", d.analysis_window),
            level_smoothing: env_or("PITCHLINE_LEVEL_SMOOTHING", d.level_smoothing),
            guard_delay_ms: env_or("PITCHLINE_GUARD_DELAY_MS", d.guard_delay_ms),
            restart_delay_ms: env_or("PITCHLINE_RESTART_DELAY_MS", d.restart_delay_ms),
            max_utterance_ms: env_or("PITCHLINE_MAX_UTTERANCE_MS", d.max_utterance_ms),
            min_utterance_ms: env_or("PITCHLINE_MIN_UTTERANCE_MS", d.min_utterance_ms),
        }
    }

    pub fn validate(&self) -> VoiceResult<()> {
        if self.noise_gate_rms >= self.interrupt_threshold_rms {
            return Err(VoiceError::Config(format!(
                "interrupt threshold ({}) must exceed the noise gate ({})",
                self.interrupt_threshold_rms, self.noise_gate_rms
            )));
        }
        if self.vad_tick_ms == 0 {
            return Err(VoiceError::Config("vad_tick_ms must be non-zero".to_string()));
        }
        if self.playback_rate <= 0.0 {
            return Err(VoiceError::Config("playback_rate must be positive".to_string()));
        }
        if self.sample_rate == 0 || self.analysis_window == 0 {
            return Err(VoiceError::Config(
                "sample_rate and analysis_window must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            sample_rate: self.sample_rate,
            channels: 1,
            analysis_window: self.analysis_window,
        }
    }

    fn vad_config(&self) -> VadConfig {
        VadConfig {
            noise_gate_rms: self.noise_gate_rms,
            interrupt_threshold_rms: self.interrupt_threshold_rms,
            silence_threshold: Duration::from_millis(self.silence_threshold_ms),
            max_utterance: Duration::from_millis(self.max_utterance_ms),
            level_smoothing: self.level_smoothing,
        }
    }

    fn turn_config(&self) -> TurnConfig {
        TurnConfig {
            guard_delay: Duration::from_millis(self.guard_delay_ms),
            restart_delay: Duration::from_millis(self.restart_delay_ms),
        }
    }

    fn playback_config(&self) -> PlaybackConfig {
        PlaybackConfig {
            auto_play: self.auto_play,
            playback_rate: self.playback_rate,
        }
    }
}

/// Events published by the session. The host application renders these; no
/// component in this crate does.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged {
        from: TurnState,
        to: TurnState,
        timestamp: DateTime<Utc>,
    },
    InterimTranscript {
        text: String,
    },
    UtteranceComplete {
        text: String,
        timestamp: DateTime<Utc>,
    },
    PlaybackStarted,
    PlaybackFinished,
    Notification(Notification),
}

enum SessionCommand {
    StartListening,
    StartConversation,
    StopListening,
    Speak(String),
    Shutdown,
}

/// Command surface for a running session. Cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    activity: watch::Receiver<VoiceActivityState>,
}

impl SessionHandle {
    fn send(&self, cmd: SessionCommand) -> VoiceResult<()> {
        self.commands
            .send(cmd)
            .map_err(|_| VoiceError::ChannelSend("session is gone".to_string()))
    }

    /// Manual press-to-talk: listen for a single utterance.
    pub fn start_listening(&self) -> VoiceResult<()> {
        self.send(SessionCommand::StartListening)
    }

    /// Enter continuous conversation mode (acquires the microphone on first
    /// use).
    pub fn start_conversation(&self) -> VoiceResult<()> {
        self.send(SessionCommand::StartConversation)
    }

    /// Manual release.
    pub fn stop_listening(&self) -> VoiceResult<()> {
        self.send(SessionCommand::StopListening)
    }

    /// Synthesize and play assistant text.
    pub fn speak(&self, text: impl Into<String>) -> VoiceResult<()> {
        self.send(SessionCommand::Speak(text.into()))
    }

    /// Tear the session down. `run` returns after cleanup completes.
    pub fn shutdown(&self) -> VoiceResult<()> {
        self.send(SessionCommand::Shutdown)
    }

    /// Per-tick voice activity state, for level meters and the like.
    pub fn activity(&self) -> watch::Receiver<VoiceActivityState> {
        self.activity.clone()
    }
}

/// A full-duplex voice session.
///
/// Owns the capture manager, detector, turn engine, recognition adapter, and
/// player; everything is created here and released in [`teardown`], nowhere
/// else.
pub struct VoiceSession {
    config: SessionConfig,
    engine: TurnEngine,
    vad: EnergyVad,
    capture: Option<AudioCaptureManager>,
    graph: Option<AnalysisGraph>,
    adapter: SpeechRecognitionAdapter,
    player: SpeechSynthesisPlayer,

    recognition_rx: mpsc::UnboundedReceiver<RecognitionEvent>,
    playback_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
    command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    pcm_rx: mpsc::UnboundedReceiver<Vec<f32>>,
    /// Handed to the capture callback on acquisition.
    pcm_tx: Option<mpsc::UnboundedSender<Vec<f32>>>,

    /// PCM accumulated for the current utterance (batch backends only).
    utterance_buf: Vec<f32>,

    events: mpsc::UnboundedSender<SessionEvent>,
    activity_tx: watch::Sender<VoiceActivityState>,

    guard_deadline: Option<Instant>,
    restart_deadline: Option<Instant>,
}

impl VoiceSession {
    /// Build a session. Callbacks and channels are wired here, at
    /// construction — there is no late registration and no module state.
    /// No audio device is touched until conversation mode first needs one.
    pub fn new(
        config: SessionConfig,
        recognizer: Box<dyn RecognitionBackend>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
    ) -> VoiceResult<(
        Self,
        SessionHandle,
        mpsc::UnboundedReceiver<SessionEvent>,
    )> {
        config.validate()?;

        let (recognition_tx, recognition_rx) = mpsc::unbounded_channel();
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (pcm_tx, pcm_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (activity_tx, activity_rx) = watch::channel(VoiceActivityState::default());

        let adapter = SpeechRecognitionAdapter::new(recognizer, recognition_tx);
        let player = SpeechSynthesisPlayer::new(
            synthesizer,
            config.playback_config(),
            config.voice_id.clone(),
            playback_tx,
        );

        let session = Self {
            engine: TurnEngine::new(config.turn_config()),
            vad: EnergyVad::new(config.vad_config()),
            capture: None,
            graph: None,
            adapter,
            player,
            recognition_rx,
            playback_rx,
            command_rx,
            pcm_rx,
            pcm_tx: Some(pcm_tx),
            utterance_buf: Vec::new(),
            events: events_tx,
            activity_tx,
            guard_deadline: None,
            restart_deadline: None,
            config,
        };

        let handle = SessionHandle {
            commands: command_tx,
            activity: activity_rx,
        };

        Ok((session, handle, events_rx))
    }

    pub fn state(&self) -> TurnState {
        self.engine.state()
    }

    /// Drive the session until shutdown. `on_text` receives each completed
    /// utterance and returns the assistant's reply to speak (empty for
    /// nothing).
    pub async fn run<F, Fut>(mut self, on_text: F) -> VoiceResult<()>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = String>,
    {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.vad_tick_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("voice session running ({}ms tick)", self.config.vad_tick_ms);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Instant::now();
                    // Deadline timers ride the tick so every transition goes
                    // through the same serialized path as everything else.
                    if self.guard_deadline.is_some_and(|d| now >= d) {
                        self.guard_deadline = None;
                        self.dispatch(TurnInput::GuardElapsed, now, &on_text).await;
                    }
                    if self.restart_deadline.is_some_and(|d| now >= d) {
                        self.restart_deadline = None;
                        self.dispatch(TurnInput::RestartElapsed, now, &on_text).await;
                    }
                    if let Some(graph) = self.graph.clone() {
                        let window = graph.snapshot();
                        let speaking = self.engine.state() == TurnState::Speaking;
                        let tick = self.vad.tick(&window, now, speaking);
                        let _ = self.activity_tx.send(self.vad.state());
                        self.dispatch(TurnInput::Tick(tick), now, &on_text).await;
                    }
                }

                Some(event) = self.recognition_rx.recv() => {
                    self.adapter.observe(&event);
                    let input = match event {
                        RecognitionEvent::Interim(text) => {
                            let _ = self.events.send(SessionEvent::InterimTranscript {
                                text: text.clone(),
                            });
                            TurnInput::Interim(text)
                        }
                        RecognitionEvent::Final(text) => TurnInput::Final(text),
                        RecognitionEvent::Error(kind) => TurnInput::RecognitionError(kind),
                        RecognitionEvent::Ended => TurnInput::RecognitionEnded,
                    };
                    self.dispatch(input, Instant::now(), &on_text).await;
                }

                Some(event) = self.playback_rx.recv() => {
                    let PlaybackEvent::Finished(generation) = event;
                    if self.player.acknowledge_finished(generation) {
                        let _ = self.events.send(SessionEvent::PlaybackFinished);
                        self.dispatch(TurnInput::PlaybackFinished, Instant::now(), &on_text).await;
                    } else {
                        // A displaced or stopped handle drained; nothing to do.
                        debug!("stale playback completion for handle {generation}");
                    }
                }

                Some(chunk) = self.pcm_rx.recv() => {
                    self.buffer_pcm(chunk);
                }

                command = self.command_rx.recv() => {
                    match command {
                        Some(SessionCommand::StartListening) => {
                            self.dispatch(TurnInput::StartManual, Instant::now(), &on_text).await;
                        }
                        Some(SessionCommand::StartConversation) => {
                            match self.ensure_capture() {
                                Ok(()) => {
                                    self.dispatch(
                                        TurnInput::StartConversation,
                                        Instant::now(),
                                        &on_text,
                                    ).await;
                                }
                                Err(e) => {
                                    warn!("microphone acquisition failed: {e}");
                                    self.notify(Notification::new(
                                        "Microphone unavailable",
                                        "Could not access the microphone. Check permissions and try again.",
                                        Severity::Error,
                                    ));
                                }
                            }
                        }
                        Some(SessionCommand::StopListening) => {
                            self.dispatch(TurnInput::StopListening, Instant::now(), &on_text).await;
                        }
                        Some(SessionCommand::Speak(text)) => {
                            if let Some(input) = self.speak_now(&text).await {
                                self.dispatch(input, Instant::now(), &on_text).await;
                            }
                        }
                        Some(SessionCommand::Shutdown) | None => {
                            self.dispatch(TurnInput::Stop, Instant::now(), &on_text).await;
                            break;
                        }
                    }
                }
            }
        }

        self.teardown();
        Ok(())
    }

    /// Apply an input and every input it cascades into, performing side
    /// effects in the order the engine returned them.
    async fn dispatch<F, Fut>(&mut self, input: TurnInput, now: Instant, on_text: &F)
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = String>,
    {
        let mut queue = VecDeque::from([input]);
        while let Some(input) = queue.pop_front() {
            let before = self.engine.state();
            let actions = self.engine.handle(input, now);
            for action in actions {
                match action {
                    Action::StartRecognition(mode) => {
                        if let Err(e) = self.adapter.start(mode) {
                            warn!("recognition start failed: {e}");
                            self.notify(Notification::new(
                                "Speech recognition unavailable",
                                "Could not start speech recognition.",
                                Severity::Error,
                            ));
                        }
                    }
                    Action::StopRecognition => self.adapter.stop(),
                    Action::CancelPlayback => self.player.stop(),
                    Action::CompleteUtterance(text) => {
                        self.vad.reset_utterance();
                        self.utterance_buf.clear();
                        let _ = self.events.send(SessionEvent::UtteranceComplete {
                            text: text.clone(),
                            timestamp: Utc::now(),
                        });
                        let reply = on_text(text).await;
                        if !reply.trim().is_empty() {
                            if let Some(next) = self.speak_now(&reply).await {
                                queue.push_back(next);
                            }
                        }
                    }
                    Action::CommitAudio => {
                        self.vad.reset_utterance();
                        self.commit_utterance_audio();
                    }
                    Action::ScheduleGuard(delay) => {
                        self.guard_deadline = Some(now + delay);
                    }
                    Action::ScheduleRestart(delay) => {
                        self.restart_deadline = Some(now + delay);
                    }
                    Action::Notify(notification) => self.notify(notification),
                }
            }
            let after = self.engine.state();
            if before != after {
                let _ = self.events.send(SessionEvent::StateChanged {
                    from: before,
                    to: after,
                    timestamp: Utc::now(),
                });
            }
        }
    }

    /// Synthesize and start playback. Returns the input to feed the engine
    /// when audio actually started.
    async fn speak_now(&mut self, text: &str) -> Option<TurnInput> {
        match self.player.speak(text).await {
            Ok(()) if self.player.is_active() => {
                let _ = self.events.send(SessionEvent::PlaybackStarted);
                Some(TurnInput::PlaybackStarted)
            }
            Ok(()) => None,
            Err(VoiceError::Synthesis(err)) => {
                warn!("synthesis failed: {err}");
                self.notify(Notification::new(
                    "Voice playback",
                    synthesis_user_message(&err),
                    Severity::Warning,
                ));
                None
            }
            Err(e) => {
                warn!("playback failed: {e}");
                self.notify(Notification::new(
                    "Voice playback",
                    "Speech playback failed.",
                    Severity::Error,
                ));
                None
            }
        }
    }

    fn buffer_pcm(&mut self, chunk: Vec<f32>) {
        if self.engine.state() != TurnState::Listening
            || !self.adapter.wants_audio()
            || !self.adapter.is_active()
        {
            return;
        }
        self.utterance_buf.extend_from_slice(&chunk);
        // Bounded by the utterance cap; anything older is of no use.
        let cap = (self.config.sample_rate as u64 * self.config.max_utterance_ms / 1000) as usize;
        if self.utterance_buf.len() > cap {
            let excess = self.utterance_buf.len() - cap;
            self.utterance_buf.drain(..excess);
        }
    }

    fn commit_utterance_audio(&mut self) {
        let samples = std::mem::take(&mut self.utterance_buf);
        let min_samples =
            (self.config.sample_rate as u64 * self.config.min_utterance_ms / 1000) as usize;
        if samples.len() < min_samples {
            debug!("utterance too short ({} samples), dropped", samples.len());
            return;
        }
        if !self.adapter.wants_audio() || !self.adapter.is_active() {
            return;
        }
        let duration =
            Duration::from_secs_f64(samples.len() as f64 / self.config.sample_rate as f64);
        info!("committing {} samples ({:?}) for transcription", samples.len(), duration);
        self.adapter.feed_utterance(UtteranceAudio {
            samples,
            sample_rate: self.config.sample_rate,
            duration,
            captured_at: Utc::now(),
        });
    }

    fn ensure_capture(&mut self) -> VoiceResult<()> {
        if self.graph.is_some() {
            return Ok(());
        }
        if self.capture.is_none() {
            self.capture = Some(AudioCaptureManager::new(self.config.capture_config())?);
        }
        if let Some(capture) = self.capture.as_mut() {
            self.graph = Some(capture.acquire(self.pcm_tx.take())?);
        }
        Ok(())
    }

    fn notify(&self, notification: Notification) {
        let _ = self.events.send(SessionEvent::Notification(notification));
    }

    /// One idempotent cleanup: timers, recognition, playback, capture graph.
    /// Partial cleanup is a resource leak and must not occur, so everything
    /// is released here and only here.
    fn teardown(&mut self) {
        self.guard_deadline = None;
        self.restart_deadline = None;
        self.adapter.stop();
        self.player.stop();
        self.utterance_buf.clear();
        self.graph = None;
        if let Some(mut capture) = self.capture.take() {
            capture.release();
        }
        info!("voice session torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::PlaceholderSynthesizer;
    use crate::recognition::ScriptedRecognizer;

    #[test]
    fn config_defaults_match_reference() {
        let config = SessionConfig::default();
        assert_eq!(config.silence_threshold_ms, 2000);
        assert!((config.interrupt_threshold_rms - 0.02).abs() < 1e-9);
        assert!((config.noise_gate_rms - 0.008).abs() < 1e-9);
        assert_eq!(config.vad_tick_ms, 50);
        assert_eq!(config.guard_delay_ms, 200);
        assert!(config.auto_play);
    }

    #[test]
    fn config_rejects_inverted_thresholds() {
        let config = SessionConfig {
            noise_gate_rms: 0.05,
            interrupt_threshold_rms: 0.02,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn session_construction_is_headless() {
        // No audio device is touched until conversation mode starts.
        let (session, handle, _events) = VoiceSession::new(
            SessionConfig::default(),
            Box::new(ScriptedRecognizer::new(Vec::new())),
            Arc::new(PlaceholderSynthesizer),
        )
        .expect("construction must not need audio hardware");
        assert_eq!(session.state(), TurnState::Idle);
        assert!(!handle.activity().borrow().is_user_speaking);
    }
}
