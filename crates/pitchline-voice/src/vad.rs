//! Voice activity detection over RMS signal energy.
//!
//! RMS over the analysis window is cheap enough to run at 20 Hz without
//! perceptible CPU load. A fixed noise gate keeps ambient hiss from reading
//! as speech; a materially higher interrupt threshold keeps background noise
//! from triggering barge-in while the assistant is talking.

use std::time::{Duration, Instant};
use tracing::debug;

/// Detector thresholds and timing.
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// RMS above this classifies the user as speaking (default: 0.008)
    pub noise_gate_rms: f32,

    /// RMS above this while the assistant is speaking raises the interrupt
    /// flag (default: 0.02)
    pub interrupt_threshold_rms: f32,

    /// Silence run length that completes an utterance (default: 2000ms)
    pub silence_threshold: Duration,

    /// Hard cap on one utterance before auto-commit (default: 30s)
    pub max_utterance: Duration,

    /// Exponential smoothing factor for the published level (default: 0.8)
    pub level_smoothing: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            noise_gate_rms: 0.008,
            interrupt_threshold_rms: 0.02,
            silence_threshold: Duration::from_millis(2000),
            max_utterance: Duration::from_secs(30),
            level_smoothing: 0.8,
        }
    }
}

/// What the detector saw on one tick. Consumed by the turn engine within
/// the same tick; never carried across ticks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadTick {
    pub rms: f32,
    pub is_speaking: bool,
    /// Energy spike above the interrupt threshold while the assistant was
    /// speaking.
    pub interrupt: bool,
    /// Silence after speech has exceeded the silence threshold.
    pub silence_elapsed: bool,
    /// The current utterance hit the max-duration cap.
    pub utterance_capped: bool,
}

/// Per-session activity state, updated once per tick and published to
/// observers (the session loop and whatever renders a level meter).
#[derive(Debug, Clone, Copy, Default)]
pub struct VoiceActivityState {
    pub is_user_speaking: bool,
    /// First tick at which speech stopped; not reset on later silent ticks.
    pub silence_started: Option<Instant>,
    pub last_speech: Option<Instant>,
    /// Smoothed signal level in [0, 1].
    pub audio_level: f32,
    pub interrupt_detected: bool,
}

/// Energy-gate voice activity detector.
pub struct EnergyVad {
    config: VadConfig,
    state: VoiceActivityState,
    /// Start of the current utterance's speech, if any.
    speech_started: Option<Instant>,
}

impl EnergyVad {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            state: VoiceActivityState::default(),
            speech_started: None,
        }
    }

    /// Root-mean-square energy of a sample window: normalize, square,
    /// average, square-root. Zero for an empty window.
    pub fn rms(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum: f32 = samples.iter().map(|s| s * s).sum();
        (sum / samples.len() as f32).sqrt()
    }

    /// Classify one tick. Ordering inside a tick is fixed: classification,
    /// then silence bookkeeping, then the interrupt flag. The caller acts on
    /// the returned tick before the next one fires.
    pub fn tick(&mut self, samples: &[f32], now: Instant, assistant_speaking: bool) -> VadTick {
        let rms = Self::rms(samples);

        let s = self.config.level_smoothing.clamp(0.0, 1.0);
        self.state.audio_level = s * self.state.audio_level + (1.0 - s) * rms.min(1.0);

        let is_speaking = rms > self.config.noise_gate_rms;
        if is_speaking {
            if !self.state.is_user_speaking {
                debug!("speech onset (rms {:.4})", rms);
            }
            if self.speech_started.is_none() {
                self.speech_started = Some(now);
            }
            self.state.last_speech = Some(now);
            self.state.silence_started = None;
        } else if self.state.is_user_speaking {
            // First silent tick after speech; later silent ticks keep the
            // original timestamp so the silence run is measured from here.
            self.state.silence_started = Some(now);
        }
        self.state.is_user_speaking = is_speaking;

        let silence_elapsed = match (self.state.silence_started, self.speech_started) {
            (Some(started), Some(_)) => {
                now.duration_since(started) >= self.config.silence_threshold
            }
            _ => false,
        };

        let utterance_capped = self
            .speech_started
            .map(|started| now.duration_since(started) >= self.config.max_utterance)
            .unwrap_or(false);

        let interrupt = assistant_speaking && rms > self.config.interrupt_threshold_rms;
        self.state.interrupt_detected = interrupt;

        VadTick {
            rms,
            is_speaking,
            interrupt,
            silence_elapsed,
            utterance_capped,
        }
    }

    pub fn state(&self) -> VoiceActivityState {
        self.state
    }

    /// Reset utterance bookkeeping after a completion, commit, or mode
    /// change, so the next utterance is measured from scratch.
    pub fn reset_utterance(&mut self) {
        self.speech_started = None;
        self.state.silence_started = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vad() -> EnergyVad {
        EnergyVad::new(VadConfig {
            silence_threshold: Duration::from_millis(100),
            ..Default::default()
        })
    }

    fn loud() -> Vec<f32> {
        vec![0.5; 256]
    }

    fn quiet() -> Vec<f32> {
        vec![0.001; 256]
    }

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(EnergyVad::rms(&[0.0; 256]), 0.0);
        assert_eq!(EnergyVad::rms(&[]), 0.0);
    }

    #[test]
    fn rms_of_constant_signal() {
        let r = EnergyVad::rms(&[0.5; 256]);
        assert!((r - 0.5).abs() < 1e-6);
    }

    #[test]
    fn noise_gate_holds_over_long_runs() {
        let mut vad = vad();
        let now = Instant::now();
        // An arbitrarily long run below the gate must never flap to speaking.
        for i in 0..10_000 {
            let tick = vad.tick(&quiet(), now + Duration::from_millis(i * 50), false);
            assert!(!tick.is_speaking);
            assert!(!vad.state().is_user_speaking);
        }
        assert!(vad.state().silence_started.is_none());
    }

    #[test]
    fn silence_start_is_set_once() {
        let mut vad = vad();
        let t0 = Instant::now();
        vad.tick(&loud(), t0, false);
        assert!(vad.state().silence_started.is_none());

        let t1 = t0 + Duration::from_millis(50);
        vad.tick(&quiet(), t1, false);
        assert_eq!(vad.state().silence_started, Some(t1));

        // Later silent ticks keep the original timestamp.
        let t2 = t0 + Duration::from_millis(100);
        vad.tick(&quiet(), t2, false);
        assert_eq!(vad.state().silence_started, Some(t1));
    }

    #[test]
    fn silence_elapsed_after_threshold() {
        let mut vad = vad();
        let t0 = Instant::now();
        vad.tick(&loud(), t0, false);
        let tick = vad.tick(&quiet(), t0 + Duration::from_millis(50), false);
        assert!(!tick.silence_elapsed);

        let tick = vad.tick(&quiet(), t0 + Duration::from_millis(200), false);
        assert!(tick.silence_elapsed);
    }

    #[test]
    fn silence_without_prior_speech_never_completes() {
        let mut vad = vad();
        let t0 = Instant::now();
        for i in 0..100 {
            let tick = vad.tick(&quiet(), t0 + Duration::from_millis(i * 50), false);
            assert!(!tick.silence_elapsed);
        }
    }

    #[test]
    fn interrupt_requires_assistant_speaking() {
        let mut vad = vad();
        let now = Instant::now();

        let tick = vad.tick(&loud(), now, false);
        assert!(!tick.interrupt);

        let tick = vad.tick(&loud(), now + Duration::from_millis(50), true);
        assert!(tick.interrupt);
        assert!(vad.state().interrupt_detected);
    }

    #[test]
    fn interrupt_threshold_is_above_noise_gate() {
        let mut vad = vad();
        let now = Instant::now();
        // Above the gate but below the interrupt threshold: speech, no barge-in.
        let tick = vad.tick(&vec![0.01; 256], now, true);
        assert!(tick.is_speaking);
        assert!(!tick.interrupt);
    }

    #[test]
    fn level_smoothing_converges() {
        let mut vad = vad();
        let t0 = Instant::now();
        for i in 0..50 {
            vad.tick(&loud(), t0 + Duration::from_millis(i * 50), false);
        }
        let level = vad.state().audio_level;
        assert!((level - 0.5).abs() < 0.01, "level {level} did not converge");
    }

    #[test]
    fn utterance_cap_fires() {
        let mut vad = EnergyVad::new(VadConfig {
            max_utterance: Duration::from_millis(200),
            ..Default::default()
        });
        let t0 = Instant::now();
        vad.tick(&loud(), t0, false);
        let tick = vad.tick(&loud(), t0 + Duration::from_millis(250), false);
        assert!(tick.utterance_capped);

        vad.reset_utterance();
        let tick = vad.tick(&quiet(), t0 + Duration::from_millis(300), false);
        assert!(!tick.utterance_capped);
    }
}
