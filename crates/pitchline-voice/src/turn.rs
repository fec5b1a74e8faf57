//! Turn-taking state machine.
//!
//! Every mutation of conversational state — VAD tick, recognition event,
//! playback event, or user command — funnels through [`TurnEngine::handle`],
//! which returns the side effects for the session loop to perform in order.
//! Side effects are never split across ticks: an interrupt decision and its
//! playback teardown happen within the tick that detected the spike.

use crate::error::RecognitionErrorKind;
use crate::recognition::RecognitionMode;
use crate::vad::VadTick;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Conversational mode of the session. Exactly one state is active at any
/// time; it is the single source of truth for whether microphone input or
/// assistant audio is currently authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// Nothing in flight.
    Idle,
    /// Recognition owns the floor.
    Listening,
    /// Assistant playback owns the floor.
    Speaking,
    /// Barge-in detected; waiting out the guard interval before listening.
    Interrupted,
}

/// Severity for the notification sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Event for the notification sink. No component in this crate renders UI;
/// the host application decides how to display these.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub title: String,
    pub description: String,
    pub severity: Severity,
}

impl Notification {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            severity,
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone)]
pub enum TurnInput {
    /// Periodic VAD classification.
    Tick(VadTick),
    /// Recognition produced an interim transcript.
    Interim(String),
    /// Recognition produced a final transcript.
    Final(String),
    /// The recognition session terminated, solicited or not.
    RecognitionEnded,
    RecognitionError(RecognitionErrorKind),
    /// Synthesized audio is buffered and playing.
    PlaybackStarted,
    /// Playback ran to natural completion.
    PlaybackFinished,
    /// The post-interruption guard interval elapsed.
    GuardElapsed,
    /// The recognition auto-restart delay elapsed.
    RestartElapsed,
    /// Manual press-to-talk.
    StartManual,
    /// Enter continuous conversation mode.
    StartConversation,
    /// Manual release.
    StopListening,
    /// Explicit stop/cleanup.
    Stop,
}

/// Side effects the session must perform, in the order returned.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    StartRecognition(RecognitionMode),
    StopRecognition,
    CancelPlayback,
    /// Dispatch a completed utterance to the conversation handler and clear
    /// the transcript buffer.
    CompleteUtterance(String),
    /// Hand the buffered utterance PCM to a batch transcription backend.
    CommitAudio,
    ScheduleGuard(Duration),
    ScheduleRestart(Duration),
    Notify(Notification),
}

/// Timing knobs for the state machine.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Pause after barge-in before recognition restarts, so the tail of the
    /// cut-off audio is not picked up as user speech (default: 200ms)
    pub guard_delay: Duration,

    /// Delay before restarting recognition after an unsolicited end
    /// (default: 250ms)
    pub restart_delay: Duration,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            guard_delay: Duration::from_millis(200),
            restart_delay: Duration::from_millis(250),
        }
    }
}

/// Most recent recognition text for the current utterance. Cleared the
/// instant a completed utterance is dispatched.
#[derive(Debug, Default)]
pub struct TranscriptBuffer {
    text: String,
}

impl TranscriptBuffer {
    pub fn update(&mut self, text: String) {
        self.text = text;
    }

    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.text)
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

/// The serialized state-transition function for the whole session.
pub struct TurnEngine {
    config: TurnConfig,
    state: TurnState,
    /// Continuous conversation mode is active.
    conversation: bool,
    /// A recognition session is currently running.
    recognition_active: bool,
    transcript: TranscriptBuffer,
}

impl TurnEngine {
    pub fn new(config: TurnConfig) -> Self {
        Self {
            config,
            state: TurnState::Idle,
            conversation: false,
            recognition_active: false,
            transcript: TranscriptBuffer::default(),
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn conversation_active(&self) -> bool {
        self.conversation
    }

    /// Apply one input and return the side effects to perform. The session
    /// loop is the only caller; no other path mutates turn state.
    pub fn handle(&mut self, input: TurnInput, _now: Instant) -> Vec<Action> {
        match input {
            TurnInput::StartManual => self.on_start_manual(),
            TurnInput::StartConversation => self.on_start_conversation(),
            TurnInput::StopListening => self.on_stop_listening(),
            TurnInput::Tick(tick) => self.on_tick(tick),
            TurnInput::Interim(text) => self.on_interim(text),
            TurnInput::Final(text) => self.on_final(text),
            TurnInput::RecognitionEnded => self.on_recognition_ended(),
            TurnInput::RecognitionError(kind) => self.on_recognition_error(kind),
            TurnInput::PlaybackStarted => self.on_playback_started(),
            TurnInput::PlaybackFinished => self.on_playback_finished(),
            TurnInput::GuardElapsed => self.on_guard_elapsed(),
            TurnInput::RestartElapsed => self.on_restart_elapsed(),
            TurnInput::Stop => self.on_stop(),
        }
    }

    fn on_start_manual(&mut self) -> Vec<Action> {
        if self.state != TurnState::Idle {
            debug!("start ignored in state {:?}", self.state);
            return Vec::new();
        }
        self.conversation = false;
        self.state = TurnState::Listening;
        self.recognition_active = true;
        self.transcript.clear();
        info!("listening (single-shot)");
        vec![Action::StartRecognition(RecognitionMode::SingleShot)]
    }

    fn on_start_conversation(&mut self) -> Vec<Action> {
        if self.conversation {
            // Already in conversation mode; duplicate start is a no-op.
            return Vec::new();
        }
        self.conversation = true;
        if self.state != TurnState::Idle {
            return Vec::new();
        }
        self.state = TurnState::Listening;
        self.recognition_active = true;
        self.transcript.clear();
        info!("conversation mode: listening");
        vec![Action::StartRecognition(RecognitionMode::Continuous)]
    }

    fn on_stop_listening(&mut self) -> Vec<Action> {
        // Manual release: the backend flushes its pending final result and
        // then reports Ended, which takes the state to Idle.
        if self.state == TurnState::Listening && !self.conversation {
            return vec![Action::StopRecognition];
        }
        Vec::new()
    }

    fn on_tick(&mut self, tick: VadTick) -> Vec<Action> {
        // Interruption check comes first and preempts the rest of the tick:
        // cancellation must be synchronous with the spike that triggered it.
        if self.state == TurnState::Speaking && tick.interrupt {
            self.state = TurnState::Interrupted;
            info!("barge-in: cancelling playback (rms {:.4})", tick.rms);
            return vec![
                Action::CancelPlayback,
                Action::ScheduleGuard(self.config.guard_delay),
            ];
        }

        if self.state == TurnState::Listening
            && self.recognition_active
            && (tick.silence_elapsed || tick.utterance_capped)
        {
            if tick.utterance_capped {
                warn!("utterance hit the duration cap, committing");
            }
            if !self.transcript.is_empty() {
                return self.complete_utterance();
            }
            // Nothing transcribed yet: a batch backend gets the PCM now.
            return vec![Action::CommitAudio];
        }

        Vec::new()
    }

    fn on_interim(&mut self, text: String) -> Vec<Action> {
        if self.state == TurnState::Listening && !text.trim().is_empty() {
            self.transcript.update(text);
        }
        Vec::new()
    }

    fn on_final(&mut self, text: String) -> Vec<Action> {
        if self.state != TurnState::Listening {
            debug!("final transcript ignored in state {:?}", self.state);
            return Vec::new();
        }
        if !text.trim().is_empty() {
            self.transcript.update(text);
        }
        if self.transcript.is_empty() {
            return Vec::new();
        }
        self.complete_utterance()
    }

    fn complete_utterance(&mut self) -> Vec<Action> {
        let text = self.transcript.take();
        info!("utterance complete ({} chars)", text.len());
        vec![Action::CompleteUtterance(text)]
    }

    fn on_recognition_ended(&mut self) -> Vec<Action> {
        self.recognition_active = false;
        match self.state {
            TurnState::Listening if self.conversation => {
                // Unsolicited end (network blip, engine timeout): restart
                // after a short delay.
                debug!("recognition ended unsolicited, scheduling restart");
                vec![Action::ScheduleRestart(self.config.restart_delay)]
            }
            TurnState::Listening => {
                // Manual session finished.
                self.state = TurnState::Idle;
                self.transcript.clear();
                Vec::new()
            }
            // While the assistant is speaking or interrupted, an ended
            // recognition session is expected; the return to Listening
            // restarts it.
            _ => Vec::new(),
        }
    }

    fn on_recognition_error(&mut self, kind: RecognitionErrorKind) -> Vec<Action> {
        if kind.is_transient() {
            debug!("transient recognition error: {}", kind);
            return Vec::new();
        }
        self.recognition_active = false;
        if kind.is_fatal() {
            // Permission revoked: the session cannot continue.
            self.conversation = false;
            self.state = TurnState::Idle;
            self.transcript.clear();
            return vec![
                Action::CancelPlayback,
                Action::Notify(Notification::new(
                    "Microphone unavailable",
                    "Microphone permission was denied. Voice input is disabled.",
                    Severity::Error,
                )),
            ];
        }
        vec![Action::Notify(Notification::new(
            "Speech recognition error",
            format!("Speech recognition failed ({kind}). Please try again."),
            Severity::Warning,
        ))]
    }

    fn on_playback_started(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.recognition_active {
            // The assistant's own voice must not be transcribed.
            self.recognition_active = false;
            actions.push(Action::StopRecognition);
        }
        self.state = TurnState::Speaking;
        actions
    }

    fn on_playback_finished(&mut self) -> Vec<Action> {
        if self.state != TurnState::Speaking {
            return Vec::new();
        }
        if self.conversation {
            self.state = TurnState::Listening;
            self.ensure_recognition()
        } else {
            self.state = TurnState::Idle;
            Vec::new()
        }
    }

    fn on_guard_elapsed(&mut self) -> Vec<Action> {
        if self.state != TurnState::Interrupted {
            return Vec::new();
        }
        self.state = TurnState::Listening;
        info!("guard interval over, listening again");
        self.ensure_recognition()
    }

    fn on_restart_elapsed(&mut self) -> Vec<Action> {
        if self.conversation && self.state == TurnState::Listening && !self.recognition_active {
            return self.ensure_recognition();
        }
        Vec::new()
    }

    fn ensure_recognition(&mut self) -> Vec<Action> {
        if self.conversation && !self.recognition_active {
            self.recognition_active = true;
            vec![Action::StartRecognition(RecognitionMode::Continuous)]
        } else {
            Vec::new()
        }
    }

    fn on_stop(&mut self) -> Vec<Action> {
        self.conversation = false;
        self.transcript.clear();
        let was_idle = self.state == TurnState::Idle && !self.recognition_active;
        self.recognition_active = false;
        self.state = TurnState::Idle;
        if was_idle {
            return Vec::new();
        }
        vec![Action::StopRecognition, Action::CancelPlayback]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> TurnEngine {
        TurnEngine::new(TurnConfig::default())
    }

    fn now() -> Instant {
        Instant::now()
    }

    fn quiet_tick() -> VadTick {
        VadTick {
            rms: 0.0,
            is_speaking: false,
            interrupt: false,
            silence_elapsed: false,
            utterance_capped: false,
        }
    }

    fn interrupt_tick() -> VadTick {
        VadTick {
            rms: 0.05,
            is_speaking: true,
            interrupt: true,
            silence_elapsed: false,
            utterance_capped: false,
        }
    }

    fn silence_done_tick() -> VadTick {
        VadTick {
            silence_elapsed: true,
            ..quiet_tick()
        }
    }

    #[test]
    fn manual_flow_ends_idle() {
        let mut e = engine();

        let actions = e.handle(TurnInput::StartManual, now());
        assert_eq!(
            actions,
            vec![Action::StartRecognition(RecognitionMode::SingleShot)]
        );
        assert_eq!(e.state(), TurnState::Listening);

        let actions = e.handle(TurnInput::Interim("create a banner".into()), now());
        assert!(actions.is_empty());

        let actions = e.handle(TurnInput::Final("create a banner ad".into()), now());
        assert_eq!(
            actions,
            vec![Action::CompleteUtterance("create a banner ad".into())]
        );

        let actions = e.handle(TurnInput::RecognitionEnded, now());
        assert!(actions.is_empty());
        assert_eq!(e.state(), TurnState::Idle);
    }

    #[test]
    fn duplicate_starts_are_noops() {
        let mut e = engine();
        assert_eq!(e.handle(TurnInput::StartConversation, now()).len(), 1);
        assert!(e.handle(TurnInput::StartConversation, now()).is_empty());
        assert!(e.handle(TurnInput::StartManual, now()).is_empty());
    }

    #[test]
    fn barge_in_cancels_within_one_tick() {
        let mut e = engine();
        e.handle(TurnInput::StartConversation, now());
        e.handle(TurnInput::PlaybackStarted, now());
        assert_eq!(e.state(), TurnState::Speaking);

        // Tick 1: playback must be torn down synchronously.
        let actions = e.handle(TurnInput::Tick(interrupt_tick()), now());
        assert_eq!(actions[0], Action::CancelPlayback);
        assert!(matches!(actions[1], Action::ScheduleGuard(_)));
        assert_eq!(e.state(), TurnState::Interrupted);

        // Ticks 2 and 3: spike continues, nothing left to cancel.
        assert!(e.handle(TurnInput::Tick(interrupt_tick()), now()).is_empty());
        assert!(e.handle(TurnInput::Tick(interrupt_tick()), now()).is_empty());

        // Guard elapses: back to listening with recognition restarted.
        let actions = e.handle(TurnInput::GuardElapsed, now());
        assert_eq!(
            actions,
            vec![Action::StartRecognition(RecognitionMode::Continuous)]
        );
        assert_eq!(e.state(), TurnState::Listening);
    }

    #[test]
    fn interrupt_tick_is_inert_while_listening() {
        let mut e = engine();
        e.handle(TurnInput::StartConversation, now());
        let actions = e.handle(TurnInput::Tick(interrupt_tick()), now());
        assert!(actions.is_empty());
        assert_eq!(e.state(), TurnState::Listening);
    }

    #[test]
    fn silence_completion_fires_exactly_once() {
        let mut e = engine();
        e.handle(TurnInput::StartConversation, now());
        e.handle(TurnInput::Interim("book a demo".into()), now());

        let actions = e.handle(TurnInput::Tick(silence_done_tick()), now());
        assert_eq!(actions, vec![Action::CompleteUtterance("book a demo".into())]);

        // Buffer was cleared on dispatch; further elapsed-silence ticks have
        // nothing to complete and fall through to an audio commit.
        let actions = e.handle(TurnInput::Tick(silence_done_tick()), now());
        assert_eq!(actions, vec![Action::CommitAudio]);
    }

    #[test]
    fn empty_transcript_commits_audio_for_batch_backends() {
        let mut e = engine();
        e.handle(TurnInput::StartConversation, now());
        let actions = e.handle(TurnInput::Tick(silence_done_tick()), now());
        assert_eq!(actions, vec![Action::CommitAudio]);
    }

    #[test]
    fn playback_started_stops_recognition() {
        let mut e = engine();
        e.handle(TurnInput::StartConversation, now());
        let actions = e.handle(TurnInput::PlaybackStarted, now());
        assert_eq!(actions, vec![Action::StopRecognition]);
        assert_eq!(e.state(), TurnState::Speaking);
    }

    #[test]
    fn playback_finished_resumes_listening_in_conversation() {
        let mut e = engine();
        e.handle(TurnInput::StartConversation, now());
        e.handle(TurnInput::PlaybackStarted, now());
        let actions = e.handle(TurnInput::PlaybackFinished, now());
        assert_eq!(
            actions,
            vec![Action::StartRecognition(RecognitionMode::Continuous)]
        );
        assert_eq!(e.state(), TurnState::Listening);
    }

    #[test]
    fn playback_finished_goes_idle_in_manual_mode() {
        let mut e = engine();
        e.handle(TurnInput::StartManual, now());
        e.handle(TurnInput::Final("hi".into()), now());
        e.handle(TurnInput::RecognitionEnded, now());
        e.handle(TurnInput::PlaybackStarted, now());
        e.handle(TurnInput::PlaybackFinished, now());
        assert_eq!(e.state(), TurnState::Idle);
    }

    #[test]
    fn unsolicited_end_schedules_restart() {
        let mut e = engine();
        e.handle(TurnInput::StartConversation, now());
        let actions = e.handle(TurnInput::RecognitionEnded, now());
        assert!(matches!(actions[0], Action::ScheduleRestart(_)));

        let actions = e.handle(TurnInput::RestartElapsed, now());
        assert_eq!(
            actions,
            vec![Action::StartRecognition(RecognitionMode::Continuous)]
        );
    }

    #[test]
    fn end_during_speaking_defers_restart_to_playback_finish() {
        let mut e = engine();
        e.handle(TurnInput::StartConversation, now());
        e.handle(TurnInput::PlaybackStarted, now());

        let actions = e.handle(TurnInput::RecognitionEnded, now());
        assert!(actions.is_empty());

        let actions = e.handle(TurnInput::PlaybackFinished, now());
        assert_eq!(
            actions,
            vec![Action::StartRecognition(RecognitionMode::Continuous)]
        );
    }

    #[test]
    fn transient_errors_are_swallowed() {
        let mut e = engine();
        e.handle(TurnInput::StartConversation, now());
        assert!(e
            .handle(
                TurnInput::RecognitionError(RecognitionErrorKind::NoSpeech),
                now()
            )
            .is_empty());
        assert!(e
            .handle(
                TurnInput::RecognitionError(RecognitionErrorKind::Aborted),
                now()
            )
            .is_empty());
        assert_eq!(e.state(), TurnState::Listening);
    }

    #[test]
    fn not_allowed_is_fatal() {
        let mut e = engine();
        e.handle(TurnInput::StartConversation, now());
        let actions = e.handle(
            TurnInput::RecognitionError(RecognitionErrorKind::NotAllowed),
            now(),
        );
        assert_eq!(actions[0], Action::CancelPlayback);
        let Action::Notify(n) = &actions[1] else {
            panic!("expected notification, got {actions:?}");
        };
        assert_eq!(n.severity, Severity::Error);
        assert_eq!(e.state(), TurnState::Idle);
        assert!(!e.conversation_active());
    }

    #[test]
    fn unknown_errors_are_surfaced() {
        let mut e = engine();
        e.handle(TurnInput::StartConversation, now());
        let actions = e.handle(
            TurnInput::RecognitionError(RecognitionErrorKind::Other),
            now(),
        );
        let Action::Notify(n) = &actions[0] else {
            panic!("expected notification, got {actions:?}");
        };
        assert_eq!(n.severity, Severity::Warning);
    }

    #[test]
    fn stop_from_any_state_goes_idle() {
        let mut e = engine();
        e.handle(TurnInput::StartConversation, now());
        e.handle(TurnInput::PlaybackStarted, now());
        let actions = e.handle(TurnInput::Stop, now());
        assert_eq!(
            actions,
            vec![Action::StopRecognition, Action::CancelPlayback]
        );
        assert_eq!(e.state(), TurnState::Idle);

        // Stop on an already-idle engine is a no-op.
        assert!(e.handle(TurnInput::Stop, now()).is_empty());
    }
}
