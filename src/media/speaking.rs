//! Speaking detection: voice activity from signal energy, or push-to-talk.
//!
//! Voice-activity mode keeps a short-window RMS energy plus a zero-crossing
//! metric (rejects DC hum that carries energy but no signal content). A
//! transition is confirmed only after a cooldown since the previous one, and
//! the speaking state is held for a configurable time after energy drops, so
//! brief pauses don't flap the indicator. Push-to-talk ignores the audio
//! entirely and follows the configured key chord, exact modifier match
//! required.

use tokio::time::Instant;

use crate::config::{SpeakingConfig, SpeakingMode};

/// Minimum zero-crossing rate for a frame to count as voiced. A constant
/// hum or DC offset sits below this even when loud.
const MIN_ZERO_CROSSING_RATE: f64 = 0.001;

/// Meter scaling: pegs well before an actually-loud mic, which reads
/// better in the UI than a strict dBFS mapping.
const LEVEL_SCALE: f64 = 600.0;

#[derive(Debug, Clone, Copy)]
pub struct FrameOutcome {
    /// 0-100 RMS meter value for the frame.
    pub level: f64,
    /// `Some(new_state)` when the speaking state changed on this frame.
    pub transition: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct KeyEvent {
    pub key: String,
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
    pub meta: bool,
    pub is_down: bool,
}

pub struct SpeakingDetector {
    config: SpeakingConfig,
    speaking: bool,
    last_transition: Option<Instant>,
    last_above: Option<Instant>,
}

impl SpeakingDetector {
    pub fn new(config: SpeakingConfig) -> Self {
        Self {
            config,
            speaking: false,
            last_transition: None,
            last_above: None,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Energy threshold in dBFS. Sensitivity 0 requires a loud -20 dBFS
    /// signal; sensitivity 100 trips at -60 dBFS.
    pub fn threshold_db(&self) -> f64 {
        -20.0 - 0.4 * f64::from(self.config.sensitivity.min(100))
    }

    pub fn process_frame(&mut self, samples: &[i16], now: Instant) -> FrameOutcome {
        let (rms, zero_crossing_rate) = frame_metrics(samples);
        let level = (rms * LEVEL_SCALE).min(100.0);

        if self.config.mode == SpeakingMode::PushToTalk {
            // Key chord drives the state; the meter still works.
            return FrameOutcome {
                level,
                transition: None,
            };
        }

        let db = 20.0 * rms.max(1e-10).log10();
        let voiced = db > self.threshold_db() && zero_crossing_rate >= MIN_ZERO_CROSSING_RATE;

        if voiced {
            self.last_above = Some(now);
        }

        let within_hold = self
            .last_above
            .map(|at| now.duration_since(at).as_millis() as u64 <= self.config.hold_ms)
            .unwrap_or(false);
        let desired = voiced || (self.speaking && within_hold);

        let transition = if desired != self.speaking && self.cooldown_elapsed(now) {
            self.speaking = desired;
            self.last_transition = Some(now);
            Some(desired)
        } else {
            None
        };

        FrameOutcome { level, transition }
    }

    /// Push-to-talk input. Returns `Some(new_state)` on a transition.
    /// Ignored entirely in voice-activity mode.
    pub fn handle_key_event(&mut self, event: &KeyEvent) -> Option<bool> {
        if self.config.mode != SpeakingMode::PushToTalk {
            return None;
        }
        let combo = &self.config.push_to_talk_key;
        let exact = event.key == combo.key
            && event.ctrl == combo.ctrl
            && event.alt == combo.alt
            && event.shift == combo.shift
            && event.meta == combo.meta;

        if event.key != combo.key && !exact {
            return None;
        }

        // An exact chord press engages; releasing the key, or pressing it
        // with the wrong modifiers, disengages.
        let desired = exact && event.is_down;
        if desired != self.speaking {
            self.speaking = desired;
            return Some(desired);
        }
        None
    }

    pub fn update_config(&mut self, config: SpeakingConfig) {
        self.config = config;
    }

    fn cooldown_elapsed(&self, now: Instant) -> bool {
        self.last_transition
            .map(|at| now.duration_since(at).as_millis() as u64 >= self.config.cooldown_ms)
            .unwrap_or(true)
    }
}

/// Normalized RMS (0..1) and zero-crossing rate for one frame.
fn frame_metrics(samples: &[i16]) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }

    let mut sum_sq = 0.0f64;
    let mut crossings = 0usize;
    let mut prev_positive = samples[0] >= 0;
    for &sample in samples {
        let s = f64::from(sample) / f64::from(i16::MAX);
        sum_sq += s * s;
        let positive = sample >= 0;
        if positive != prev_positive {
            crossings += 1;
        }
        prev_positive = positive;
    }

    let rms = (sum_sq / samples.len() as f64).sqrt();
    let zcr = crossings as f64 / samples.len() as f64;
    (rms, zcr)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::config::KeyCombo;

    use super::*;

    fn sine_frame(amplitude: f64) -> Vec<i16> {
        (0..480)
            .map(|i| {
                let t = i as f64 / 48_000.0;
                (amplitude * (std::f64::consts::TAU * 440.0 * t).sin() * 32_767.0) as i16
            })
            .collect()
    }

    fn silence() -> Vec<i16> {
        vec![0; 480]
    }

    fn va_config(sensitivity: u8, hold_ms: u64, cooldown_ms: u64) -> SpeakingConfig {
        SpeakingConfig {
            mode: SpeakingMode::VoiceActivity,
            sensitivity,
            hold_ms,
            cooldown_ms,
            push_to_talk_key: KeyCombo::default(),
        }
    }

    #[test]
    fn loud_frame_starts_speaking_and_hold_keeps_it() {
        let mut det = SpeakingDetector::new(va_config(50, 600, 0));
        let t0 = Instant::now();

        let out = det.process_frame(&sine_frame(0.5), t0);
        assert_eq!(out.transition, Some(true));
        assert!(out.level > 0.0);

        // Silence inside the hold window: still speaking.
        let out = det.process_frame(&silence(), t0 + Duration::from_millis(300));
        assert_eq!(out.transition, None);
        assert!(det.is_speaking());

        // Silence past the hold window: released.
        let out = det.process_frame(&silence(), t0 + Duration::from_millis(1_000));
        assert_eq!(out.transition, Some(false));
        assert!(!det.is_speaking());
    }

    #[test]
    fn higher_sensitivity_lowers_the_threshold() {
        let quiet = sine_frame(0.002);
        let t0 = Instant::now();

        let mut strict = SpeakingDetector::new(va_config(0, 0, 0));
        assert_eq!(strict.process_frame(&quiet, t0).transition, None);

        let mut lenient = SpeakingDetector::new(va_config(100, 0, 0));
        assert_eq!(lenient.process_frame(&quiet, t0).transition, Some(true));
    }

    #[test]
    fn cooldown_suppresses_rapid_flapping() {
        let mut det = SpeakingDetector::new(va_config(50, 0, 150));
        let t0 = Instant::now();

        assert_eq!(det.process_frame(&sine_frame(0.5), t0).transition, Some(true));

        // Energy drops right away, but the transition is inside the cooldown.
        let out = det.process_frame(&silence(), t0 + Duration::from_millis(50));
        assert_eq!(out.transition, None);
        assert!(det.is_speaking());

        // After the cooldown the release goes through.
        let out = det.process_frame(&silence(), t0 + Duration::from_millis(200));
        assert_eq!(out.transition, Some(false));
    }

    #[test]
    fn dc_offset_is_not_speech() {
        let mut det = SpeakingDetector::new(va_config(100, 0, 0));
        let hum = vec![20_000i16; 480];
        assert_eq!(det.process_frame(&hum, Instant::now()).transition, None);
    }

    #[test]
    fn push_to_talk_requires_exact_modifiers() {
        let mut det = SpeakingDetector::new(SpeakingConfig {
            mode: SpeakingMode::PushToTalk,
            push_to_talk_key: KeyCombo {
                key: "space".into(),
                ctrl: true,
                ..Default::default()
            },
            ..Default::default()
        });

        let press = |ctrl: bool, shift: bool, is_down: bool| KeyEvent {
            key: "space".into(),
            ctrl,
            alt: false,
            shift,
            meta: false,
            is_down,
        };

        // Extra modifier: no match.
        assert_eq!(det.handle_key_event(&press(true, true, true)), None);
        assert!(!det.is_speaking());

        assert_eq!(det.handle_key_event(&press(true, false, true)), Some(true));
        assert!(det.is_speaking());

        assert_eq!(det.handle_key_event(&press(true, false, false)), Some(false));
        assert!(!det.is_speaking());
    }

    #[test]
    fn push_to_talk_ignores_audio_energy() {
        let mut det = SpeakingDetector::new(SpeakingConfig {
            mode: SpeakingMode::PushToTalk,
            push_to_talk_key: KeyCombo {
                key: "f13".into(),
                ..Default::default()
            },
            ..Default::default()
        });

        let out = det.process_frame(&sine_frame(0.8), Instant::now());
        assert_eq!(out.transition, None);
        assert!(!det.is_speaking());
        assert!(out.level > 0.0);
    }
}
