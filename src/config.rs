//! Engine configuration.
//!
//! Every tunable lives here with defaults matching production behavior.
//! `EngineConfig::load()` layers an optional config file under
//! `NATTER`-prefixed environment overrides, so `NATTER__QUALITY__SAMPLE_INTERVAL_MS=1000`
//! works the same way it does for the server.

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub session: SessionConfig,
    pub quality: QualityConfig,
    pub speaking: SpeakingConfig,
    pub devices: DeviceConfig,
    pub suppression: SuppressionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a session may sit in `connecting` before the attempt is
    /// treated as failed.
    pub connect_timeout_ms: u64,
    /// Retries after a failed attempt. The backoff before retry `n` is
    /// `retry_backoff_base_ms * 2^(n-1)`.
    pub max_retries: u32,
    pub retry_backoff_base_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            max_retries: 3,
            retry_backoff_base_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub sample_interval_ms: u64,
    /// Consecutive high-loss/jitter samples before stepping the video
    /// ladder down one rung.
    pub step_down_streak: u32,
    /// How long conditions must stay excellent before stepping up.
    pub step_up_hold_ms: u64,
    pub loss_critical: f64,
    pub jitter_critical_s: f64,
    pub loss_poor: f64,
    pub jitter_poor_s: f64,
    pub loss_excellent: f64,
    pub jitter_excellent_s: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 5_000,
            step_down_streak: 3,
            step_up_hold_ms: 30_000,
            loss_critical: 0.10,
            jitter_critical_s: 0.10,
            loss_poor: 0.05,
            jitter_poor_s: 0.05,
            loss_excellent: 0.01,
            jitter_excellent_s: 0.02,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpeakingMode {
    VoiceActivity,
    PushToTalk,
}

/// A key chord for push-to-talk. Matching is exact: a configured
/// `ctrl+space` does not fire on `ctrl+shift+space`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct KeyCombo {
    pub key: String,
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
    pub meta: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeakingConfig {
    pub mode: SpeakingMode,
    /// 0-100. Higher sensitivity means a lower energy threshold.
    pub sensitivity: u8,
    /// Keep reporting "speaking" this long after energy drops.
    pub hold_ms: u64,
    /// Minimum gap between speaking transitions, to suppress chatter.
    pub cooldown_ms: u64,
    pub push_to_talk_key: KeyCombo,
}

impl Default for SpeakingConfig {
    fn default() -> Self {
        Self {
            mode: SpeakingMode::VoiceActivity,
            sensitivity: 50,
            hold_ms: 600,
            cooldown_ms: 150,
            push_to_talk_key: KeyCombo::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Poll interval when the enumerator has no change notifications.
    pub poll_interval_ms: u64,
    /// Minimum gap between emitted device-change notifications.
    pub change_throttle_ms: u64,
    /// User-preferred device ids, persisted by the app layer.
    pub preferred_input: Option<String>,
    pub preferred_output: Option<String>,
    pub preferred_camera: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            change_throttle_ms: 1_000,
            preferred_input: None,
            preferred_output: None,
            preferred_camera: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SuppressionMethod {
    Rnnoise,
    None,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SuppressionConfig {
    pub method: SuppressionMethod,
    /// 0.0 = passthrough, 1.0 = fully denoised output.
    pub intensity: f32,
}

impl Default for SuppressionConfig {
    fn default() -> Self {
        Self {
            method: SuppressionMethod::Rnnoise,
            intensity: 1.0,
        }
    }
}

impl EngineConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/voice").required(false))
            .add_source(
                config::Environment::with_prefix("NATTER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
