use std::time::{Duration, Instant};

use tokio::sync::watch;
use voiceloop_core::config::VadSettings;
use voiceloop_core::types::ImagePayload;

use crate::traits::{Outbound, Payload};

/// RMS amplitude of a little-endian 16-bit PCM frame.
///
/// A trailing odd byte is ignored. An empty frame has RMS 0.
pub fn rms_s16le(frame: &[u8]) -> u32 {
    let mut sum_sq: f64 = 0.0;
    let mut n: usize = 0;
    for pair in frame.chunks_exact(2) {
        let s = i16::from_le_bytes([pair[0], pair[1]]) as f64;
        sum_sq += s * s;
        n += 1;
    }
    if n == 0 {
        return 0;
    }
    (sum_sq / n as f64).sqrt() as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    Silent,
    Speaking,
}

/// Speech/silence classifier with a silence hang-over window.
#[derive(Debug)]
pub struct VadGate {
    threshold: u32,
    silence_window: Duration,
    state: VadState,
    // Set on the first below-threshold frame while speaking.
    silence_started: Option<Instant>,
}

impl VadGate {
    pub fn new(threshold: u32, silence_window: Duration) -> Self {
        Self {
            threshold,
            silence_window,
            state: VadState::Silent,
            silence_started: None,
        }
    }

    pub fn from_settings(settings: &VadSettings) -> Self {
        Self::new(
            settings.rms_threshold,
            Duration::from_millis(settings.silence_window_ms),
        )
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    /// Feeds one frame observed at `now`. Returns `true` only on the
    /// `Silent -> Speaking` edge.
    pub fn process(&mut self, frame: &[u8], now: Instant) -> bool {
        let loud = rms_s16le(frame) > self.threshold;

        match (self.state, loud) {
            (VadState::Silent, true) => {
                self.state = VadState::Speaking;
                self.silence_started = None;
                true
            }
            (VadState::Silent, false) => false,
            (VadState::Speaking, true) => {
                self.silence_started = None;
                false
            }
            (VadState::Speaking, false) => {
                let started = *self.silence_started.get_or_insert(now);
                if now.duration_since(started) > self.silence_window {
                    self.state = VadState::Silent;
                    self.silence_started = None;
                }
                false
            }
        }
    }
}

/// Shared single-slot holder for the freshest captured frame.
///
/// Writers overwrite; readers only ever see the latest frame.
pub type FrameSlot = watch::Receiver<Option<ImagePayload>>;

pub fn frame_slot() -> (watch::Sender<Option<ImagePayload>>, FrameSlot) {
    watch::channel(None)
}

/// Runs one captured audio frame through the gate and returns what to enqueue:
/// the audio itself, preceded by a single image on a rising edge.
pub fn capture_step(
    gate: &mut VadGate,
    frame: Vec<u8>,
    sample_rate_hz: u32,
    latest_frame: &FrameSlot,
    now: Instant,
) -> Vec<Outbound> {
    let mut out = Vec::with_capacity(2);
    if gate.process(&frame, now) {
        if let Some(image) = latest_frame.borrow().clone() {
            log::debug!("speech onset; attaching latest video frame");
            out.push(Outbound::Send {
                payload: Payload::Image(image),
                end_of_turn: false,
            });
        }
    }
    out.push(Outbound::Send {
        payload: Payload::Audio {
            pcm_s16le: frame,
            sample_rate_hz,
        },
        end_of_turn: false,
    });
    out
}
