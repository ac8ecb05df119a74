//! The engine façade.
//!
//! One owned object per client wires the sub-services together and exposes
//! the whole caller surface: join/leave, mute/deafen, per-user volume and
//! local mute, camera/screen share, device switching, and quality
//! accessors. Collaborators (bus, transport, capture, device enumeration)
//! are injected — no ambient globals.

use std::sync::{Arc, Mutex};

use rtrb::Consumer;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::device::{DeviceDescriptor, DeviceEnumerator, DeviceKind, DeviceRegistry, DeviceTestOutcome};
use crate::error::{CloseReason, EngineError, MediaError};
use crate::events::{EngineEvent, EventBus, Subscription};
use crate::media::{CaptureBackend, KeyEvent, LocalMediaPipeline, MediaDirective};
use crate::negotiation::NegotiationCoordinator;
use crate::quality::{QualityMonitor, QualitySample, RoomQuality, VideoRung};
use crate::session::{AudioMixer, PeerSessionManager, SessionInfo};
use crate::signaling::{MemberInfo, SignalPayload, SignalingBus, SignalingCoordinator};
use crate::transport::{AudioFrame, MediaTransport};

/// 200ms of stereo 48kHz: the same headroom the playback ring has always
/// had.
const PLAYBACK_RING_SAMPLES: usize = 48_000 * 2 / 5;

/// Everything the engine consumes from the outside world.
pub struct EngineCollaborators {
    pub bus: Arc<dyn SignalingBus>,
    pub transport: Arc<dyn MediaTransport>,
    pub capture: Arc<dyn CaptureBackend>,
    pub devices: Arc<dyn DeviceEnumerator>,
}

pub struct VoiceEngine {
    local_user: Uuid,
    events: EventBus,
    registry: Arc<DeviceRegistry>,
    pipeline: Arc<LocalMediaPipeline>,
    manager: Arc<PeerSessionManager>,
    signaling: Arc<SignalingCoordinator>,
    mixer: AudioMixer,
    monitor: QualityMonitor,
    negotiation: Arc<Mutex<Option<Arc<NegotiationCoordinator>>>>,
    playback_rx: Mutex<Option<Consumer<i16>>>,
    room: Mutex<Option<Uuid>>,
}

impl VoiceEngine {
    /// Wire up the engine. Spawns its service tasks immediately, so this
    /// must run inside a tokio runtime.
    pub fn new(
        config: EngineConfig,
        local_user: Uuid,
        display_name: impl Into<String>,
        collaborators: EngineCollaborators,
    ) -> Self {
        let events = EventBus::new();
        let mixer = AudioMixer::new();

        let registry = Arc::new(DeviceRegistry::new(
            collaborators.devices,
            config.devices.clone(),
            events.clone(),
        ));

        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(PeerSessionManager::new(
            collaborators.transport,
            outbox_tx,
            events.clone(),
            mixer.clone(),
            config.session.clone(),
        ));

        let (pipeline, directives_rx) =
            LocalMediaPipeline::new(collaborators.capture, config.clone(), events.clone());

        let signaling = SignalingCoordinator::new(
            collaborators.bus,
            Arc::clone(&manager),
            events.clone(),
            local_user,
            display_name.into(),
        );
        signaling.start(outbox_rx);

        let monitor = QualityMonitor::new(config.quality.clone(), events.clone());
        let negotiation: Arc<Mutex<Option<Arc<NegotiationCoordinator>>>> =
            Arc::new(Mutex::new(None));

        let (playback_tx, playback_rx) = rtrb::RingBuffer::new(PLAYBACK_RING_SAMPLES);
        mixer.start(playback_tx);

        // New sessions attach whatever occupies the video slot right now —
        // the placeholder until camera or screen share turn on.
        manager.set_local_video_track(pipeline.current_video_track());

        Self::spawn_directive_router(
            directives_rx,
            Arc::clone(&manager),
            Arc::clone(&signaling),
            Arc::clone(&negotiation),
            events.clone(),
            local_user,
        );

        Self {
            local_user,
            events,
            registry,
            pipeline,
            manager,
            signaling,
            mixer,
            monitor,
            negotiation,
            playback_rx: Mutex::new(Some(playback_rx)),
            room: Mutex::new(None),
        }
    }

    // ── Room lifecycle ─────────────────────────────────────

    /// Acquire media, announce presence, and start building sessions as
    /// the roster arrives. Media errors surface to the caller; everything
    /// after acquisition degrades per-peer instead of failing the join.
    pub async fn join_room(&self, room_id: Uuid) -> Result<(), EngineError> {
        if self.current_room().is_some() {
            self.leave_room().await;
        }
        log::info!("engine: joining room {room_id}");

        if let Err(e) = self.registry.refresh() {
            log::warn!("engine: device enumeration failed: {e}");
        }
        self.registry.start_watching();

        let mic = self.registry.best(DeviceKind::AudioInput).map(|d| d.id);
        self.pipeline.acquire_audio(mic.as_deref()).await?;
        self.manager
            .set_local_audio_track(self.pipeline.current_audio_track());
        self.manager
            .set_local_video_track(self.pipeline.current_video_track());

        *self.lock_negotiation() = Some(Arc::new(NegotiationCoordinator::new(Arc::clone(
            &self.manager,
        ))));

        let (constraints_tx, mut constraints_rx) = mpsc::unbounded_channel();
        self.monitor.start(Arc::clone(&self.manager), constraints_tx);
        let pipeline = Arc::clone(&self.pipeline);
        tokio::spawn(async move {
            while let Some(constraints) = constraints_rx.recv().await {
                pipeline.apply_video_constraints(constraints).await;
            }
        });

        self.signaling.join(room_id).await;
        *self.room.lock().unwrap_or_else(|e| e.into_inner()) = Some(room_id);
        self.events.emit(EngineEvent::LocalIdentity {
            user_id: self.local_user,
        });
        Ok(())
    }

    /// Tear the room down: cancels every per-peer timer, clears the
    /// negotiation queue, releases captures.
    pub async fn leave_room(&self) {
        let left = self
            .room
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(room_id) = left else {
            return;
        };
        log::info!("engine: leaving room {room_id}");

        self.signaling.leave().await;
        self.monitor.stop();
        if let Some(negotiation) = self.lock_negotiation().take() {
            negotiation.clear();
        }
        self.manager.close_all(CloseReason::LocalClose);
        self.pipeline.release_all();
        self.registry.stop_watching();
        self.mixer.clear();
    }

    pub fn current_room(&self) -> Option<Uuid> {
        *self.room.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Events / playback plumbing ─────────────────────────

    pub fn subscribe(&self) -> (Subscription, mpsc::UnboundedReceiver<EngineEvent>) {
        self.events.subscribe()
    }

    pub fn subscribe_labeled(
        &self,
        label: &str,
    ) -> (Subscription, mpsc::UnboundedReceiver<EngineEvent>) {
        self.events.subscribe_labeled(label)
    }

    /// The mixed-playback ring consumer, for the audio output adapter.
    /// Take-once.
    pub fn take_playback(&self) -> Option<Consumer<i16>> {
        self.playback_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Processed microphone frames, for the transport adapter. Take-once.
    pub fn take_processed_audio(&self) -> Option<mpsc::UnboundedReceiver<AudioFrame>> {
        self.pipeline.take_processed_audio()
    }

    // ── Mute / deafen ──────────────────────────────────────

    pub fn set_muted(&self, muted: bool) {
        self.pipeline.set_muted(muted);
    }

    pub fn set_deafened(&self, deafened: bool) {
        self.pipeline.set_deafened(deafened);
        self.mixer.set_deaf(deafened);
    }

    pub fn is_muted(&self) -> bool {
        self.pipeline.is_muted()
    }

    pub fn is_deafened(&self) -> bool {
        self.pipeline.is_deafened()
    }

    // ── Per-peer controls ──────────────────────────────────

    pub fn set_user_volume(&self, user_id: Uuid, volume: f32) -> Result<(), EngineError> {
        self.manager.set_volume(user_id, volume)
    }

    pub fn set_user_local_mute(&self, user_id: Uuid, muted: bool) -> Result<(), EngineError> {
        self.manager.set_local_mute(user_id, muted)
    }

    pub fn set_master_volume(&self, factor: f32) {
        self.manager.apply_master_volume(factor);
    }

    pub fn set_attenuation(&self, percent: f32) {
        self.manager.apply_attenuation(percent);
    }

    // ── Camera / screen share ──────────────────────────────

    pub async fn enable_camera(&self, device_id: Option<&str>) -> Result<(), MediaError> {
        self.pipeline.enable_camera(device_id).await
    }

    pub fn disable_camera(&self) {
        self.pipeline.disable_camera();
    }

    pub async fn enable_screen_share(&self, capture_audio: bool) -> Result<(), MediaError> {
        self.pipeline.enable_screen_share(capture_audio).await
    }

    pub fn disable_screen_share(&self) {
        self.pipeline.disable_screen_share();
    }

    // ── Devices ────────────────────────────────────────────

    pub fn list_devices(&self, kind: DeviceKind) -> Vec<DeviceDescriptor> {
        self.registry.devices(kind)
    }

    pub fn set_preferred_device(&self, kind: DeviceKind, id: Option<String>) {
        self.registry.set_preferred(kind, id);
    }

    pub fn record_device_test(&self, id: &str, outcome: DeviceTestOutcome) {
        self.registry.record_test_result(id, outcome);
    }

    pub async fn switch_audio_device(&self, device_id: Option<&str>) -> Result<(), MediaError> {
        let result = self.pipeline.switch_audio_device(device_id).await;
        if result.is_ok() {
            self.manager
                .set_local_audio_track(self.pipeline.current_audio_track());
        }
        result
    }

    // ── Speaking input ─────────────────────────────────────

    pub fn key_event(&self, event: &KeyEvent) {
        self.pipeline.key_event(event);
    }

    // ── Quality accessors ──────────────────────────────────

    pub fn overall_quality(&self) -> RoomQuality {
        if self.manager.session_count() == 0 {
            return RoomQuality::Disconnected;
        }
        self.monitor.overall()
    }

    pub fn quality_warnings(&self) -> Vec<String> {
        self.monitor.warnings()
    }

    pub fn video_rung(&self) -> VideoRung {
        self.monitor.current_rung()
    }

    pub fn peer_sample(&self, user_id: Uuid) -> Option<QualitySample> {
        self.manager.info(user_id).and_then(|info| info.last_sample)
    }

    pub fn session_info(&self, user_id: Uuid) -> Option<SessionInfo> {
        self.manager.info(user_id)
    }

    pub fn participants(&self) -> Vec<MemberInfo> {
        self.signaling.members()
    }

    /// Users with an active peer session right now.
    pub fn active_peers(&self) -> Vec<Uuid> {
        self.manager.active_users()
    }

    // ── Internals ──────────────────────────────────────────

    fn spawn_directive_router(
        mut directives: mpsc::UnboundedReceiver<MediaDirective>,
        manager: Arc<PeerSessionManager>,
        signaling: Arc<SignalingCoordinator>,
        negotiation: Arc<Mutex<Option<Arc<NegotiationCoordinator>>>>,
        events: EventBus,
        local_user: Uuid,
    ) {
        tokio::spawn(async move {
            while let Some(directive) = directives.recv().await {
                match directive {
                    MediaDirective::ReplaceVideoTrack(track) => {
                        manager.replace_video_track_all(track);
                    }
                    MediaDirective::AddAudioTrack(track) => {
                        manager.add_audio_track_all(track);
                        Self::renegotiate_all(&negotiation, &manager);
                    }
                    MediaDirective::RemoveAudioTrack(slot) => {
                        manager.remove_audio_track_all(slot);
                        Self::renegotiate_all(&negotiation, &manager);
                    }
                    MediaDirective::BroadcastMute(muted) => {
                        events.emit(EngineEvent::MuteChanged {
                            user_id: local_user,
                            muted,
                        });
                        signaling
                            .broadcast(SignalPayload::MuteChanged { muted })
                            .await;
                    }
                    MediaDirective::BroadcastCamera(enabled) => {
                        events.emit(EngineEvent::CameraChanged {
                            user_id: local_user,
                            enabled,
                        });
                        signaling
                            .broadcast(SignalPayload::CameraChanged { enabled })
                            .await;
                    }
                    MediaDirective::BroadcastSpeaking(speaking) => {
                        signaling.update_local_speaking(speaking);
                        signaling
                            .broadcast(SignalPayload::SpeakingChanged { speaking })
                            .await;
                    }
                }
            }
        });
    }

    fn renegotiate_all(
        negotiation: &Arc<Mutex<Option<Arc<NegotiationCoordinator>>>>,
        manager: &Arc<PeerSessionManager>,
    ) {
        let coordinator = negotiation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(coordinator) = coordinator {
            for user_id in manager.active_users() {
                coordinator.request_renegotiation(user_id);
            }
        }
    }

    fn lock_negotiation(
        &self,
    ) -> std::sync::MutexGuard<'_, Option<Arc<NegotiationCoordinator>>> {
        self.negotiation.lock().unwrap_or_else(|e| e.into_inner())
    }
}
