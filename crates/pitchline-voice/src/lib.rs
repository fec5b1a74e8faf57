//! # Pitchline Voice — full-duplex conversation engine
//!
//! This crate turns a microphone stream and a synthesized-speech player into
//! a natural spoken conversation for the Pitchline marketing assistant:
//! continuous listening, utterance segmentation, and barge-in (the user
//! interrupting the assistant mid-sentence).
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        Voice Session                          │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐      │
//! │  │   Capture    │ → │  Energy VAD  │ → │ Turn Engine  │      │
//! │  │    (cpal)    │   │ (50ms tick)  │   │ (st. machine)│      │
//! │  └──────────────┘   └──────────────┘   └──────────────┘      │
//! │         ↓                                      ↓              │
//! │  ┌──────────────┐                     ┌──────────────┐       │
//! │  │  Recognition │                     │   Playback   │       │
//! │  │   (adapter)  │    barge-in cut     │   (rodio)    │       │
//! │  └──────────────┘         ←───────────┴──────────────┘       │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The session polls signal energy every tick, classifies speech against a
//! noise gate, and — while the assistant is speaking — watches for an energy
//! spike above the interrupt threshold. A spike cancels playback within the
//! same tick and returns the floor to the user after a short guard interval.
//! Every state transition flows through one serialized entry point, so the
//! polling loop and the event-driven recognition/playback callbacks can
//! never race each other into an inconsistent state.

pub mod audio;
pub mod error;
pub mod playback;
pub mod recognition;
pub mod session;
pub mod turn;
pub mod vad;

pub use audio::{AnalysisGraph, AudioCaptureManager, CaptureConfig};
pub use error::{RecognitionErrorKind, SynthesisError, VoiceError, VoiceResult};
pub use playback::{
    synthesis_user_message, HttpSynthesizer, PlaceholderSynthesizer, PlaybackConfig,
    PlayerState, SpeechSynthesisPlayer, SpeechSynthesizer,
};
pub use recognition::{
    create_best_recognizer, HttpTranscriber, PlaceholderRecognizer, RecognitionBackend,
    RecognitionEvent, RecognitionMode, ScriptedRecognizer, SpeechRecognitionAdapter,
    UtteranceAudio,
};
pub use session::{SessionConfig, SessionEvent, SessionHandle, VoiceSession};
pub use turn::{Action, Notification, Severity, TurnConfig, TurnEngine, TurnInput, TurnState};
pub use vad::{EnergyVad, VadConfig, VadTick, VoiceActivityState};
