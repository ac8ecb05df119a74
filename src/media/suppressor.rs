//! Pluggable noise suppression.
//!
//! Implementations process fixed-size frames of f32 PCM audio. The f32
//! values use the i16 range ([-32768, 32767]) to match the capture frame
//! format used by the audio task.
//!
//! Suppression is best-effort: if the configured backend fails to
//! initialize, acquisition continues with the unprocessed stream.

use crate::config::{SuppressionConfig, SuppressionMethod};

#[derive(Debug, Clone, Copy, Default)]
pub struct SuppressorStats {
    pub frames_processed: u64,
    /// Voice probability of the last processed frame, when the backend
    /// reports one.
    pub last_voice_probability: Option<f32>,
}

pub trait NoiseSuppressor: Send + 'static {
    /// Number of samples per processing frame.
    fn frame_size(&self) -> usize;

    /// Process one frame of audio. `input` has exactly `frame_size()`
    /// samples; write the denoised output to `output`.
    fn process_frame(&mut self, input: &[f32], output: &mut [f32]);

    /// Apply a changed intensity without rebuilding the backend.
    fn update_config(&mut self, config: &SuppressionConfig);

    fn stats(&self) -> SuppressorStats;
}

/// RNNoise-based suppressor using the nnnoiseless crate (pure Rust).
/// Intensity blends the denoised signal with the original: 0.0 is
/// passthrough, 1.0 is fully denoised.
pub struct RnnoiseSuppressor {
    state: Box<nnnoiseless::DenoiseState<'static>>,
    intensity: f32,
    denoised: Vec<f32>,
    stats: SuppressorStats,
}

impl RnnoiseSuppressor {
    pub fn new(config: &SuppressionConfig) -> Self {
        Self {
            state: nnnoiseless::DenoiseState::new(),
            intensity: config.intensity.clamp(0.0, 1.0),
            denoised: vec![0.0; nnnoiseless::DenoiseState::<'static>::FRAME_SIZE],
            stats: SuppressorStats::default(),
        }
    }
}

impl NoiseSuppressor for RnnoiseSuppressor {
    fn frame_size(&self) -> usize {
        nnnoiseless::DenoiseState::<'static>::FRAME_SIZE // 480 samples = 10ms at 48kHz
    }

    fn process_frame(&mut self, input: &[f32], output: &mut [f32]) {
        let voice_prob = self.state.process_frame(&mut self.denoised, input);
        for (i, out) in output.iter_mut().enumerate() {
            *out = input[i] + (self.denoised[i] - input[i]) * self.intensity;
        }
        self.stats.frames_processed += 1;
        self.stats.last_voice_probability = Some(voice_prob);
    }

    fn update_config(&mut self, config: &SuppressionConfig) {
        self.intensity = config.intensity.clamp(0.0, 1.0);
    }

    fn stats(&self) -> SuppressorStats {
        self.stats
    }
}

/// Build the configured suppressor. `Ok(None)` means suppression is off;
/// an `Err` from a backend makes the pipeline fall back to the unprocessed
/// stream instead of failing acquisition.
pub fn create_suppressor(
    config: &SuppressionConfig,
) -> anyhow::Result<Option<Box<dyn NoiseSuppressor>>> {
    match config.method {
        SuppressionMethod::None => Ok(None),
        SuppressionMethod::Rnnoise => Ok(Some(Box::new(RnnoiseSuppressor::new(config)))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_intensity_is_passthrough() {
        let config = SuppressionConfig {
            method: SuppressionMethod::Rnnoise,
            intensity: 0.0,
        };
        let mut suppressor = RnnoiseSuppressor::new(&config);
        let frame_size = suppressor.frame_size();

        let input: Vec<f32> = (0..frame_size).map(|i| (i % 100) as f32 * 10.0).collect();
        let mut output = vec![0.0; frame_size];
        suppressor.process_frame(&input, &mut output);

        for (a, b) in input.iter().zip(output.iter()) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn stats_count_processed_frames() {
        let config = SuppressionConfig::default();
        let mut suppressor = RnnoiseSuppressor::new(&config);
        let frame_size = suppressor.frame_size();
        let input = vec![0.0; frame_size];
        let mut output = vec![0.0; frame_size];

        suppressor.process_frame(&input, &mut output);
        suppressor.process_frame(&input, &mut output);

        let stats = suppressor.stats();
        assert_eq!(stats.frames_processed, 2);
        assert!(stats.last_voice_probability.is_some());
    }

    #[test]
    fn method_none_disables_suppression() {
        let config = SuppressionConfig {
            method: SuppressionMethod::None,
            intensity: 1.0,
        };
        assert!(create_suppressor(&config).unwrap().is_none());
    }
}
