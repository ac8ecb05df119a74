//! Local media pipeline: owns the microphone, camera, and screen-capture
//! tracks.
//!
//! The video slot always holds exactly one track. Camera and screen share
//! swap the underlying track in place (a replace, which the transport does
//! without renegotiation); turning both off swaps the placeholder back in.
//! Only adding or removing an audio sender (desktop audio during screen
//! share) renegotiates, and that goes through the negotiation coordinator —
//! the pipeline itself only emits directives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::error::MediaError;
use crate::events::{EngineEvent, EventBus};
use crate::quality::VideoConstraints;
use crate::transport::{AudioFrame, TrackHandle, TrackSlot};

use super::placeholder;
use super::speaking::{KeyEvent, SpeakingDetector};
use super::suppressor::{create_suppressor, NoiseSuppressor};
use super::{AudioCapture, CaptureBackend, ScreenCapture, VideoCapture};

/// Requests the pipeline makes of the rest of the engine. The pipeline owns
/// the tracks; sessions attach them but never mutate them, so every swap
/// flows out of here.
#[derive(Debug)]
pub enum MediaDirective {
    /// Swap the video-slot track on every session. Replace, never
    /// add/remove: no renegotiation.
    ReplaceVideoTrack(TrackHandle),
    /// New audio sender (screen-share audio). Needs renegotiation.
    AddAudioTrack(TrackHandle),
    /// Drop an audio sender. Needs renegotiation.
    RemoveAudioTrack(TrackSlot),
    BroadcastMute(bool),
    BroadcastCamera(bool),
    BroadcastSpeaking(bool),
}

enum VideoSource {
    Placeholder,
    Camera(VideoCapture),
    Screen(ScreenCapture),
}

struct AudioState {
    device_id: Option<String>,
    track: TrackHandle,
    task_shutdown: mpsc::Sender<()>,
    _capture_stop: super::CaptureStop,
}

struct PipelineInner {
    audio: Option<AudioState>,
    video: VideoSource,
    placeholder: TrackHandle,
    muted: bool,
    deafened: bool,
    /// Mute flag as it was when deafen engaged; un-deafen restores it.
    pre_deafen_muted: Option<bool>,
    constraints: VideoConstraints,
}

pub struct LocalMediaPipeline {
    backend: Arc<dyn CaptureBackend>,
    config: EngineConfig,
    events: EventBus,
    directives: mpsc::UnboundedSender<MediaDirective>,
    inner: Mutex<PipelineInner>,
    /// Shared with the audio task; checked per frame.
    mic_muted: Arc<AtomicBool>,
    detector: Arc<Mutex<SpeakingDetector>>,
    suppressor: Arc<Mutex<Option<Box<dyn NoiseSuppressor>>>>,
    processed_tx: mpsc::UnboundedSender<AudioFrame>,
    processed_rx: Mutex<Option<mpsc::UnboundedReceiver<AudioFrame>>>,
}

impl LocalMediaPipeline {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        config: EngineConfig,
        events: EventBus,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<MediaDirective>) {
        let (directives_tx, directives_rx) = mpsc::unbounded_channel();
        let (processed_tx, processed_rx) = mpsc::unbounded_channel();
        let detector = SpeakingDetector::new(config.speaking.clone());
        let pipeline = Arc::new(Self {
            backend,
            events,
            directives: directives_tx,
            inner: Mutex::new(PipelineInner {
                audio: None,
                video: VideoSource::Placeholder,
                placeholder: placeholder::placeholder_track(),
                muted: false,
                deafened: false,
                pre_deafen_muted: None,
                constraints: crate::quality::VideoRung::R720At30.constraints(),
            }),
            mic_muted: Arc::new(AtomicBool::new(false)),
            detector: Arc::new(Mutex::new(detector)),
            suppressor: Arc::new(Mutex::new(None)),
            processed_tx,
            processed_rx: Mutex::new(Some(processed_rx)),
            config,
        });
        (pipeline, directives_rx)
    }

    /// Processed (denoised) microphone frames, for the transport adapter to
    /// feed into the local audio track. Take-once.
    pub fn take_processed_audio(&self) -> Option<mpsc::UnboundedReceiver<AudioFrame>> {
        self.lock_inner_rx().take()
    }

    // ── Audio acquisition ──────────────────────────────────

    /// Open the microphone and start the processing task. Failure to build
    /// the noise suppressor is not fatal; the stream runs unprocessed.
    pub async fn acquire_audio(&self, device_id: Option<&str>) -> Result<(), MediaError> {
        self.release_audio();

        let capture = self.backend.open_audio(device_id).await?;
        log::info!(
            "pipeline: acquired audio device {:?}",
            capture.device_id.as_deref().unwrap_or("default")
        );

        match create_suppressor(&self.config.suppression) {
            Ok(suppressor) => {
                *self.lock_suppressor() = suppressor;
            }
            Err(e) => {
                log::warn!("pipeline: noise suppression unavailable, running unprocessed: {e}");
                *self.lock_suppressor() = None;
            }
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let AudioCapture {
            device_id,
            track,
            frames,
            stop,
        } = capture;

        self.spawn_audio_task(frames, shutdown_rx);

        let mut inner = self.lock();
        inner.audio = Some(AudioState {
            device_id,
            track,
            task_shutdown: shutdown_tx,
            _capture_stop: stop,
        });
        Ok(())
    }

    /// Switch to another capture device, falling back to the previous one
    /// when the new device can't be opened.
    pub async fn switch_audio_device(&self, device_id: Option<&str>) -> Result<(), MediaError> {
        let previous = self.lock().audio.as_ref().map(|a| a.device_id.clone());

        match self.acquire_audio(device_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(prev) = previous {
                    log::warn!("pipeline: device switch failed ({e}), restoring previous device");
                    if let Err(restore) = self.acquire_audio(prev.as_deref()).await {
                        log::error!("pipeline: fallback to previous device failed: {restore}");
                    }
                }
                Err(e)
            }
        }
    }

    pub fn release_audio(&self) {
        let mut inner = self.lock();
        if let Some(audio) = inner.audio.take() {
            let _ = audio.task_shutdown.try_send(());
        }
    }

    // ── Mute / deafen ──────────────────────────────────────

    pub fn set_muted(&self, muted: bool) {
        {
            let mut inner = self.lock();
            if inner.muted == muted {
                return;
            }
            inner.muted = muted;
        }
        self.mic_muted.store(muted, Ordering::Relaxed);
        let _ = self.directives.send(MediaDirective::BroadcastMute(muted));
    }

    /// Deafening implies muting. Un-deafening restores the mute flag as it
    /// was before the deafen — it never force-unmutes. Both directions
    /// broadcast the resulting mute state to peers.
    pub fn set_deafened(&self, deafened: bool) {
        let muted_now;
        {
            let mut inner = self.lock();
            if inner.deafened == deafened {
                return;
            }
            inner.deafened = deafened;
            if deafened {
                inner.pre_deafen_muted = Some(inner.muted);
                inner.muted = true;
            } else {
                inner.muted = inner.pre_deafen_muted.take().unwrap_or(false);
            }
            muted_now = inner.muted;
        }
        self.mic_muted.store(muted_now, Ordering::Relaxed);
        let _ = self
            .directives
            .send(MediaDirective::BroadcastMute(muted_now));
    }

    pub fn is_muted(&self) -> bool {
        self.lock().muted
    }

    pub fn is_deafened(&self) -> bool {
        self.lock().deafened
    }

    // ── Camera / screen share ──────────────────────────────

    /// Camera and screen share are mutually exclusive; enabling one
    /// disables the other first.
    pub async fn enable_camera(&self, device_id: Option<&str>) -> Result<(), MediaError> {
        if matches!(self.lock().video, VideoSource::Screen(_)) {
            self.disable_screen_share();
        }
        if matches!(self.lock().video, VideoSource::Camera(_)) {
            return Ok(());
        }

        let constraints = self.lock().constraints;
        let capture = self.backend.open_camera(device_id, &constraints).await?;
        let track = capture.track.clone();

        self.lock().video = VideoSource::Camera(capture);
        let _ = self
            .directives
            .send(MediaDirective::ReplaceVideoTrack(track));
        let _ = self.directives.send(MediaDirective::BroadcastCamera(true));
        log::info!("pipeline: camera enabled");
        Ok(())
    }

    pub fn disable_camera(&self) {
        let placeholder = {
            let mut inner = self.lock();
            match std::mem::replace(&mut inner.video, VideoSource::Placeholder) {
                VideoSource::Camera(mut capture) => {
                    capture.stop.stop();
                    inner.placeholder.clone()
                }
                other => {
                    inner.video = other;
                    return;
                }
            }
        };
        let _ = self
            .directives
            .send(MediaDirective::ReplaceVideoTrack(placeholder));
        let _ = self.directives.send(MediaDirective::BroadcastCamera(false));
        log::info!("pipeline: camera disabled");
    }

    pub async fn enable_screen_share(&self, capture_audio: bool) -> Result<(), MediaError> {
        if matches!(self.lock().video, VideoSource::Camera(_)) {
            self.disable_camera();
        }
        if matches!(self.lock().video, VideoSource::Screen(_)) {
            return Ok(());
        }

        let capture = self.backend.open_screen(capture_audio).await?;
        let video_track = capture.video_track.clone();
        let audio_track = capture.audio_track.clone();

        self.lock().video = VideoSource::Screen(capture);
        let _ = self
            .directives
            .send(MediaDirective::ReplaceVideoTrack(video_track));
        if let Some(audio) = audio_track {
            // The one genuinely renegotiating operation in here.
            let _ = self.directives.send(MediaDirective::AddAudioTrack(audio));
        }
        let _ = self.directives.send(MediaDirective::BroadcastCamera(true));
        log::info!("pipeline: screen share enabled (audio: {capture_audio})");
        Ok(())
    }

    pub fn disable_screen_share(&self) {
        let (placeholder, had_audio) = {
            let mut inner = self.lock();
            match std::mem::replace(&mut inner.video, VideoSource::Placeholder) {
                VideoSource::Screen(mut capture) => {
                    capture.stop.stop();
                    (inner.placeholder.clone(), capture.audio_track.is_some())
                }
                other => {
                    inner.video = other;
                    return;
                }
            }
        };
        let _ = self
            .directives
            .send(MediaDirective::ReplaceVideoTrack(placeholder));
        if had_audio {
            let _ = self
                .directives
                .send(MediaDirective::RemoveAudioTrack(TrackSlot::ScreenAudio));
        }
        let _ = self.directives.send(MediaDirective::BroadcastCamera(false));
        log::info!("pipeline: screen share disabled");
    }

    pub fn camera_enabled(&self) -> bool {
        matches!(self.lock().video, VideoSource::Camera(_))
    }

    pub fn screen_share_active(&self) -> bool {
        matches!(self.lock().video, VideoSource::Screen(_))
    }

    // ── Track accessors (for attaching to new sessions) ────

    pub fn current_video_track(&self) -> TrackHandle {
        let inner = self.lock();
        match &inner.video {
            VideoSource::Placeholder => inner.placeholder.clone(),
            VideoSource::Camera(capture) => capture.track.clone(),
            VideoSource::Screen(capture) => capture.video_track.clone(),
        }
    }

    pub fn current_audio_track(&self) -> Option<TrackHandle> {
        self.lock().audio.as_ref().map(|a| a.track.clone())
    }

    pub fn screen_audio_track(&self) -> Option<TrackHandle> {
        match &self.lock().video {
            VideoSource::Screen(capture) => capture.audio_track.clone(),
            _ => None,
        }
    }

    // ── Quality / speaking plumbing ────────────────────────

    /// Apply new capture constraints (quality ladder steps land here).
    pub async fn apply_video_constraints(&self, constraints: VideoConstraints) {
        let active = {
            let mut inner = self.lock();
            inner.constraints = constraints;
            !matches!(inner.video, VideoSource::Placeholder)
        };
        if active {
            if let Err(e) = self.backend.apply_video_constraints(&constraints).await {
                log::warn!("pipeline: constraint update failed: {e}");
            }
        }
    }

    /// Push-to-talk input from the app shell.
    pub fn key_event(&self, event: &KeyEvent) {
        let transition = self
            .detector
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .handle_key_event(event);
        if let Some(speaking) = transition {
            self.events.emit(EngineEvent::LocalSpeaking { speaking });
            let _ = self
                .directives
                .send(MediaDirective::BroadcastSpeaking(speaking));
        }
    }

    pub fn set_suppression_intensity(&self, intensity: f32) {
        let mut config = self.config.suppression.clone();
        config.intensity = intensity;
        if let Some(suppressor) = self.lock_suppressor().as_mut() {
            suppressor.update_config(&config);
        }
    }

    /// Tear everything down on room exit.
    pub fn release_all(&self) {
        self.release_audio();
        let mut inner = self.lock();
        match std::mem::replace(&mut inner.video, VideoSource::Placeholder) {
            VideoSource::Camera(mut capture) => capture.stop.stop(),
            VideoSource::Screen(mut capture) => capture.stop.stop(),
            VideoSource::Placeholder => {}
        }
    }

    // ── Internals ──────────────────────────────────────────

    fn spawn_audio_task(
        &self,
        mut frames: mpsc::UnboundedReceiver<AudioFrame>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let mic_muted = Arc::clone(&self.mic_muted);
        let detector = Arc::clone(&self.detector);
        let suppressor = Arc::clone(&self.suppressor);
        let processed_tx = self.processed_tx.clone();
        let events = self.events.clone();
        let directives = self.directives.clone();

        tokio::spawn(async move {
            // Residual samples waiting for a full suppressor frame.
            let mut pending: Vec<f32> = Vec::new();

            loop {
                tokio::select! {
                    frame = frames.recv() => {
                        let Some(frame) = frame else {
                            log::info!("audio task: capture stream ended");
                            break;
                        };

                        if mic_muted.load(Ordering::Relaxed) {
                            pending.clear();
                            events.emit(EngineEvent::MicLevel { level: 0.0 });
                            continue;
                        }

                        let samples = {
                            let mut guard =
                                suppressor.lock().unwrap_or_else(|e| e.into_inner());
                            match guard.as_mut() {
                                None => frame.data.clone(),
                                Some(s) => denoise(s.as_mut(), &mut pending, &frame.data),
                            }
                        };
                        if samples.is_empty() {
                            continue;
                        }

                        let outcome = detector
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .process_frame(&samples, Instant::now());
                        events.emit(EngineEvent::MicLevel { level: outcome.level });
                        if let Some(speaking) = outcome.transition {
                            events.emit(EngineEvent::LocalSpeaking { speaking });
                            let _ = directives
                                .send(MediaDirective::BroadcastSpeaking(speaking));
                        }

                        let _ = processed_tx.send(AudioFrame {
                            data: samples,
                            sample_rate: frame.sample_rate,
                            num_channels: frame.num_channels,
                        });
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PipelineInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_suppressor(
        &self,
    ) -> std::sync::MutexGuard<'_, Option<Box<dyn NoiseSuppressor>>> {
        self.suppressor.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_inner_rx(
        &self,
    ) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedReceiver<AudioFrame>>> {
        self.processed_rx.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Run as much of `input` through the suppressor as fills whole frames;
/// the remainder stays in `pending` for the next capture callback.
fn denoise(
    suppressor: &mut dyn NoiseSuppressor,
    pending: &mut Vec<f32>,
    input: &[i16],
) -> Vec<i16> {
    pending.extend(input.iter().map(|&v| f32::from(v)));
    let frame_size = suppressor.frame_size();
    let mut out = Vec::with_capacity(pending.len());
    let mut buf = vec![0.0f32; frame_size];

    while pending.len() >= frame_size {
        let chunk: Vec<f32> = pending.drain(..frame_size).collect();
        suppressor.process_frame(&chunk, &mut buf);
        out.extend(
            buf.iter()
                .map(|&v| v.clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16),
        );
    }
    out
}
