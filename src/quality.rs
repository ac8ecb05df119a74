//! Connection quality monitoring and the adaptive video ladder.
//!
//! Every session's transport stats are sampled on a fixed interval and
//! classified; the worst sample drives an AIMD-flavored ladder over
//! resolution × frame rate: step down immediately once bad conditions are
//! sustained, step up only after a long uninterrupted stretch of excellent
//! ones, so the rung doesn't oscillate.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::QualityConfig;
use crate::events::{EngineEvent, EventBus};
use crate::session::{PeerSessionManager, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum QualityLevel {
    Excellent,
    Good,
    Poor,
    Critical,
    /// Session still establishing; no stats yet.
    Connecting,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoomQuality {
    Excellent,
    Good,
    Poor,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualitySample {
    pub loss_rate: f64,
    pub jitter_seconds: f64,
    pub classification: QualityLevel,
}

pub fn classify(config: &QualityConfig, loss: f64, jitter: f64) -> QualityLevel {
    if loss > config.loss_critical || jitter > config.jitter_critical_s {
        QualityLevel::Critical
    } else if loss > config.loss_poor || jitter > config.jitter_poor_s {
        QualityLevel::Poor
    } else if loss < config.loss_excellent && jitter < config.jitter_excellent_s {
        QualityLevel::Excellent
    } else {
        QualityLevel::Good
    }
}

/// Worst-case reduction over the room.
pub fn aggregate(samples: &[QualitySample]) -> RoomQuality {
    if samples.is_empty() {
        return RoomQuality::Disconnected;
    }
    let any_poor = samples
        .iter()
        .any(|s| matches!(s.classification, QualityLevel::Poor | QualityLevel::Critical));
    if any_poor {
        return RoomQuality::Poor;
    }
    let all_excellent = samples
        .iter()
        .all(|s| s.classification == QualityLevel::Excellent);
    if all_excellent {
        RoomQuality::Excellent
    } else {
        RoomQuality::Good
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

/// The quality ladder, ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VideoRung {
    #[serde(rename = "360p@15")]
    R360At15,
    #[serde(rename = "360p@30")]
    R360At30,
    #[serde(rename = "480p@30")]
    R480At30,
    #[serde(rename = "720p@30")]
    R720At30,
}

impl VideoRung {
    pub fn up(self) -> Option<Self> {
        match self {
            VideoRung::R360At15 => Some(VideoRung::R360At30),
            VideoRung::R360At30 => Some(VideoRung::R480At30),
            VideoRung::R480At30 => Some(VideoRung::R720At30),
            VideoRung::R720At30 => None,
        }
    }

    pub fn down(self) -> Option<Self> {
        match self {
            VideoRung::R360At15 => None,
            VideoRung::R360At30 => Some(VideoRung::R360At15),
            VideoRung::R480At30 => Some(VideoRung::R360At30),
            VideoRung::R720At30 => Some(VideoRung::R480At30),
        }
    }

    pub fn constraints(self) -> VideoConstraints {
        let (width, height, frame_rate) = match self {
            VideoRung::R360At15 => (640, 360, 15),
            VideoRung::R360At30 => (640, 360, 30),
            VideoRung::R480At30 => (854, 480, 30),
            VideoRung::R720At30 => (1280, 720, 30),
        };
        VideoConstraints {
            width,
            height,
            frame_rate,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            VideoRung::R360At15 => "360p@15",
            VideoRung::R360At30 => "360p@30",
            VideoRung::R480At30 => "480p@30",
            VideoRung::R720At30 => "720p@30",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderStep {
    Down(VideoRung),
    Up(VideoRung),
}

/// Pure stepping logic, one call per sample tick.
#[derive(Debug)]
pub struct LadderState {
    rung: VideoRung,
    high_streak: u32,
    good_since: Option<Instant>,
}

impl LadderState {
    pub fn new(rung: VideoRung) -> Self {
        Self {
            rung,
            high_streak: 0,
            good_since: None,
        }
    }

    pub fn rung(&self) -> VideoRung {
        self.rung
    }

    /// `any_high`: some peer crossed the critical loss/jitter thresholds
    /// this tick. `all_excellent`: every peer is step-up eligible.
    pub fn on_tick(
        &mut self,
        any_high: bool,
        all_excellent: bool,
        now: Instant,
        config: &QualityConfig,
    ) -> Option<LadderStep> {
        if any_high {
            // Any pending step-up is cancelled by degradation.
            self.good_since = None;
            self.high_streak += 1;
            if self.high_streak >= config.step_down_streak {
                self.high_streak = 0;
                if let Some(lower) = self.rung.down() {
                    self.rung = lower;
                    return Some(LadderStep::Down(lower));
                }
            }
            return None;
        }

        self.high_streak = 0;
        if all_excellent {
            let since = *self.good_since.get_or_insert(now);
            if now.duration_since(since) >= Duration::from_millis(config.step_up_hold_ms) {
                // Restart the hold; the next rung needs its own 30s.
                self.good_since = Some(now);
                if let Some(higher) = self.rung.up() {
                    self.rung = higher;
                    return Some(LadderStep::Up(higher));
                }
            }
        } else {
            self.good_since = None;
        }
        None
    }
}

pub struct QualityMonitor {
    config: QualityConfig,
    events: EventBus,
    warnings: Arc<Mutex<Vec<String>>>,
    overall: Arc<Mutex<RoomQuality>>,
    ladder: Arc<Mutex<LadderState>>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl QualityMonitor {
    pub fn new(config: QualityConfig, events: EventBus) -> Self {
        Self {
            config,
            events,
            warnings: Arc::new(Mutex::new(Vec::new())),
            overall: Arc::new(Mutex::new(RoomQuality::Disconnected)),
            ladder: Arc::new(Mutex::new(LadderState::new(VideoRung::R720At30))),
            shutdown_tx: Mutex::new(None),
        }
    }

    pub fn overall(&self) -> RoomQuality {
        *self.overall.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn current_rung(&self) -> VideoRung {
        self.ladder.lock().unwrap_or_else(|e| e.into_inner()).rung()
    }

    /// Start the sampling loop. Constraint changes from ladder steps are
    /// sent on `constraints_tx` for the media pipeline to apply.
    pub fn start(
        &self,
        manager: Arc<PeerSessionManager>,
        constraints_tx: mpsc::UnboundedSender<VideoConstraints>,
    ) {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *self
            .shutdown_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(shutdown_tx);

        let config = self.config.clone();
        let events = self.events.clone();
        let warnings = Arc::clone(&self.warnings);
        let overall = Arc::clone(&self.overall);
        let ladder = Arc::clone(&self.ladder);

        tokio::spawn(async move {
            let interval = Duration::from_millis(config.sample_interval_ms);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick would sample before any stats exist.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let samples = Self::sample_all(&config, &manager).await;

                        let reduced = aggregate(&samples);
                        let changed = {
                            let mut current = overall.lock().unwrap_or_else(|e| e.into_inner());
                            let changed = *current != reduced;
                            *current = reduced;
                            changed
                        };
                        if changed {
                            events.emit(EngineEvent::RoomQualityChanged { quality: reduced });
                        }

                        let any_high = samples
                            .iter()
                            .any(|s| s.classification == QualityLevel::Critical);
                        let all_excellent = !samples.is_empty()
                            && samples
                                .iter()
                                .all(|s| s.classification == QualityLevel::Excellent);

                        let step = ladder
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .on_tick(any_high, all_excellent, Instant::now(), &config);

                        match step {
                            Some(LadderStep::Down(rung)) => {
                                let message = format!(
                                    "Connection quality is poor — reduced video to {}",
                                    rung.label()
                                );
                                log::warn!("quality: step down to {}", rung.label());
                                warnings
                                    .lock()
                                    .unwrap_or_else(|e| e.into_inner())
                                    .push(message.clone());
                                events.emit(EngineEvent::QualityWarning { message });
                                events.emit(EngineEvent::VideoRungChanged { rung });
                                let _ = constraints_tx.send(rung.constraints());
                            }
                            Some(LadderStep::Up(rung)) => {
                                log::info!("quality: step up to {}", rung.label());
                                events.emit(EngineEvent::VideoRungChanged { rung });
                                let _ = constraints_tx.send(rung.constraints());
                            }
                            None => {}
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    pub fn stop(&self) {
        self.shutdown_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    async fn sample_all(
        config: &QualityConfig,
        manager: &Arc<PeerSessionManager>,
    ) -> Vec<QualitySample> {
        let mut samples = Vec::new();
        for (user_id, conn, state) in manager.connections() {
            let sample = match state {
                SessionState::Connecting => QualitySample {
                    loss_rate: 0.0,
                    jitter_seconds: 0.0,
                    classification: QualityLevel::Connecting,
                },
                _ => match conn.stats().await {
                    Ok(stats) => {
                        let loss = stats.loss_rate();
                        let jitter = stats.jitter_seconds;
                        QualitySample {
                            loss_rate: loss,
                            jitter_seconds: jitter,
                            classification: classify(config, loss, jitter),
                        }
                    }
                    Err(e) => {
                        log::debug!("quality: stats unavailable for {user_id}: {e}");
                        QualitySample {
                            loss_rate: 0.0,
                            jitter_seconds: 0.0,
                            classification: QualityLevel::Unknown,
                        }
                    }
                },
            };

            manager.record_sample(user_id, sample);
            match sample.classification {
                QualityLevel::Poor | QualityLevel::Critical => {
                    manager.set_degraded(user_id, true);
                }
                QualityLevel::Excellent | QualityLevel::Good => {
                    manager.set_degraded(user_id, false);
                }
                _ => {}
            }
            samples.push(sample);
        }
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> QualityConfig {
        QualityConfig::default()
    }

    fn sample(level: QualityLevel) -> QualitySample {
        QualitySample {
            loss_rate: 0.0,
            jitter_seconds: 0.0,
            classification: level,
        }
    }

    #[test]
    fn classification_thresholds() {
        let c = cfg();
        assert_eq!(classify(&c, 0.15, 0.0), QualityLevel::Critical);
        assert_eq!(classify(&c, 0.0, 0.15), QualityLevel::Critical);
        assert_eq!(classify(&c, 0.07, 0.0), QualityLevel::Poor);
        assert_eq!(classify(&c, 0.0, 0.07), QualityLevel::Poor);
        assert_eq!(classify(&c, 0.005, 0.01), QualityLevel::Excellent);
        assert_eq!(classify(&c, 0.02, 0.03), QualityLevel::Good);
        // Excellent needs both loss and jitter under their floors.
        assert_eq!(classify(&c, 0.005, 0.04), QualityLevel::Good);
    }

    #[test]
    fn aggregate_is_worst_case_with_explicit_disconnected() {
        assert_eq!(aggregate(&[]), RoomQuality::Disconnected);
        assert_eq!(
            aggregate(&[sample(QualityLevel::Excellent), sample(QualityLevel::Excellent)]),
            RoomQuality::Excellent
        );
        assert_eq!(
            aggregate(&[sample(QualityLevel::Excellent), sample(QualityLevel::Good)]),
            RoomQuality::Good
        );
        assert_eq!(
            aggregate(&[sample(QualityLevel::Good), sample(QualityLevel::Critical)]),
            RoomQuality::Poor
        );
        // Still-connecting peers hold the room at "good", not "excellent".
        assert_eq!(
            aggregate(&[sample(QualityLevel::Excellent), sample(QualityLevel::Connecting)]),
            RoomQuality::Good
        );
    }

    #[test]
    fn three_high_samples_step_down_exactly_one_rung() {
        let c = cfg();
        let mut ladder = LadderState::new(VideoRung::R720At30);
        let t0 = Instant::now();

        assert_eq!(ladder.on_tick(true, false, t0, &c), None);
        assert_eq!(
            ladder.on_tick(true, false, t0 + Duration::from_secs(5), &c),
            None
        );
        assert_eq!(
            ladder.on_tick(true, false, t0 + Duration::from_secs(10), &c),
            Some(LadderStep::Down(VideoRung::R480At30))
        );
        assert_eq!(ladder.rung(), VideoRung::R480At30);
    }

    #[test]
    fn step_up_needs_thirty_uninterrupted_seconds() {
        let c = cfg();
        let mut ladder = LadderState::new(VideoRung::R480At30);
        let t0 = Instant::now();

        for k in 0..6 {
            let at = t0 + Duration::from_secs(5 * k);
            assert_eq!(ladder.on_tick(false, true, at, &c), None);
        }
        assert_eq!(
            ladder.on_tick(false, true, t0 + Duration::from_secs(30), &c),
            Some(LadderStep::Up(VideoRung::R720At30))
        );
    }

    #[test]
    fn interruption_at_second_29_cancels_the_pending_step_up() {
        let c = cfg();
        let mut ladder = LadderState::new(VideoRung::R480At30);
        let t0 = Instant::now();

        for k in 0..6 {
            let at = t0 + Duration::from_secs(5 * k);
            assert_eq!(ladder.on_tick(false, true, at, &c), None);
        }
        // One bad tick just before the timer would have fired.
        assert_eq!(
            ladder.on_tick(false, false, t0 + Duration::from_secs(29), &c),
            None
        );
        // Excellent again at the 30s mark: the hold restarted, no step.
        assert_eq!(
            ladder.on_tick(false, true, t0 + Duration::from_secs(30), &c),
            None
        );
        // It takes another full hold from the restart to step up.
        assert_eq!(
            ladder.on_tick(false, true, t0 + Duration::from_secs(60), &c),
            Some(LadderStep::Up(VideoRung::R720At30))
        );
    }

    #[test]
    fn ladder_saturates_at_both_ends() {
        let c = cfg();
        let mut ladder = LadderState::new(VideoRung::R360At15);
        let t0 = Instant::now();
        for k in 0..6 {
            assert_eq!(
                ladder.on_tick(true, false, t0 + Duration::from_secs(5 * k), &c),
                None
            );
        }
        assert_eq!(ladder.rung(), VideoRung::R360At15);

        let mut top = LadderState::new(VideoRung::R720At30);
        assert_eq!(top.on_tick(false, true, t0, &c), None);
        assert_eq!(
            top.on_tick(false, true, t0 + Duration::from_secs(30), &c),
            None
        );
    }
}
