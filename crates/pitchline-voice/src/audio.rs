//! Microphone capture and the shared analysis window.
//!
//! One cpal input stream per session, acquired lazily on the first use of
//! conversation mode and released exactly once at teardown. The stream
//! callback folds samples into a fixed-size analysis window that the VAD
//! tick snapshots, and forwards raw chunks to an optional PCM tap for
//! backends that transcribe whole utterances.

use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Capture configuration.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Number of channels (default: 1 for mono)
    pub channels: u16,

    /// Size of the analysis window in samples (default: 256)
    pub analysis_window: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            analysis_window: 256,
        }
    }
}

#[derive(Debug)]
struct WindowInner {
    samples: Vec<f32>,
    write_pos: usize,
    filled: bool,
}

/// Shared handle to the analysis window the capture callback writes into.
///
/// The window holds the most recent `analysis_window` samples; order within
/// the window does not matter to the energy metric, so writes wrap in place.
#[derive(Debug, Clone)]
pub struct AnalysisGraph {
    window: Arc<Mutex<WindowInner>>,
    sample_rate: u32,
}

impl AnalysisGraph {
    fn new(analysis_window: usize, sample_rate: u32) -> Self {
        Self {
            window: Arc::new(Mutex::new(WindowInner {
                samples: vec![0.0; analysis_window.max(1)],
                write_pos: 0,
                filled: false,
            })),
            sample_rate,
        }
    }

    fn push(&self, data: &[f32]) {
        let Ok(mut inner) = self.window.lock() else {
            return;
        };
        let len = inner.samples.len();
        for &sample in data {
            let pos = inner.write_pos;
            inner.samples[pos] = sample;
            inner.write_pos = (pos + 1) % len;
            if inner.write_pos == 0 {
                inner.filled = true;
            }
        }
    }

    /// Copy out the most recent window. Empty until the first window fills.
    pub fn snapshot(&self) -> Vec<f32> {
        let Ok(inner) = self.window.lock() else {
            return Vec::new();
        };
        if inner.filled {
            inner.samples.clone()
        } else {
            inner.samples[..inner.write_pos].to_vec()
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

struct ActiveCapture {
    graph: AnalysisGraph,
    _stream: Stream,
}

/// Owns the microphone stream and analysis graph for the session.
///
/// Singleton-per-session: no other component touches the stream directly,
/// and `acquire` while a graph is already open returns the existing graph
/// instead of opening a second stream.
pub struct AudioCaptureManager {
    config: CaptureConfig,
    device: Device,
    stream_config: StreamConfig,
    active: Option<ActiveCapture>,
}

impl AudioCaptureManager {
    /// Probe the host once for an input device. Fails fast with
    /// `UnsupportedPlatform` when the host has no input at all; the hot path
    /// performs no further availability checks.
    pub fn new(config: CaptureConfig) -> VoiceResult<Self> {
        let device = cpal::default_host().default_input_device().ok_or_else(|| {
            VoiceError::UnsupportedPlatform("no default input device".to_string())
        })?;

        info!(
            "input device: {}",
            device.name().unwrap_or_else(|_| "unknown".to_string())
        );

        // Probing the default config is also the permission check on hosts
        // that gate device access.
        let _ = device.default_input_config()?;

        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        Ok(Self {
            config,
            device,
            stream_config,
            active: None,
        })
    }

    /// Open the capture stream and return the analysis graph. Idempotent:
    /// while a stream is already open this returns the existing graph.
    ///
    /// `pcm_tap`, when set, receives every captured chunk for utterance
    /// buffering; it is wired only on the call that actually opens a stream.
    pub fn acquire(
        &mut self,
        pcm_tap: Option<mpsc::UnboundedSender<Vec<f32>>>,
    ) -> VoiceResult<AnalysisGraph> {
        if let Some(ref active) = self.active {
            return Ok(active.graph.clone());
        }

        let graph = AnalysisGraph::new(self.config.analysis_window, self.config.sample_rate);
        let writer = graph.clone();

        let stream = self.device.build_input_stream(
            &self.stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                writer.push(data);
                if let Some(ref tap) = pcm_tap {
                    let _ = tap.send(data.to_vec());
                }
            },
            move |err| {
                warn!("capture stream error: {}", err);
            },
            None,
        )?;

        stream.play()?;

        info!(
            "microphone capture started ({} Hz, {}-sample analysis window)",
            self.config.sample_rate, self.config.analysis_window
        );

        self.active = Some(ActiveCapture {
            graph: graph.clone(),
            _stream: stream,
        });

        Ok(graph)
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Drop the stream and analysis graph. Idempotent; the one release that
    /// balances a successful `acquire`.
    pub fn release(&mut self) {
        if self.active.take().is_some() {
            info!("microphone capture released");
        }
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;

        let mut device_names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                device_names.push(name);
            }
        }

        Ok(device_names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_config_defaults() {
        let config = CaptureConfig::default();
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.channels, 1);
        assert_eq!(config.analysis_window, 256);
    }

    #[test]
    fn window_snapshot_grows_then_wraps() {
        let graph = AnalysisGraph::new(4, 16000);
        assert!(graph.snapshot().is_empty());

        graph.push(&[0.1, 0.2]);
        assert_eq!(graph.snapshot(), vec![0.1, 0.2]);

        graph.push(&[0.3, 0.4, 0.5]);
        let snap = graph.snapshot();
        assert_eq!(snap.len(), 4);
        assert!(snap.contains(&0.5));
    }

    #[test]
    fn list_devices_does_not_panic() {
        // May be empty or Err in CI environments without audio devices
        let _ = AudioCaptureManager::list_input_devices();
    }

    #[test]
    #[ignore] // Requires a microphone; run manually.
    fn acquire_is_idempotent_and_release_balances_it() {
        let mut manager =
            AudioCaptureManager::new(CaptureConfig::default()).expect("input device");
        let first = manager.acquire(None).expect("acquire");
        let second = manager.acquire(None).expect("second acquire");
        assert_eq!(first.sample_rate(), second.sample_rate());
        assert!(manager.is_active());

        manager.release();
        assert!(!manager.is_active());
        manager.release(); // idempotent
    }
}
