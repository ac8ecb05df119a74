//! Owns one session per remote participant.
//!
//! Invariant: at most one session per user id. Opening a session for a user
//! that already has one supersedes the old session first. All mutation of
//! the local track set flows in from the media pipeline's directives;
//! sessions attach tracks but never own them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{CloseReason, EngineError};
use crate::events::{EngineEvent, EventBus};
use crate::quality::QualitySample;
use crate::signaling::message::SignalPayload;
use crate::transport::{MediaConnection, MediaTransport, TrackHandle, TrackSlot};

use super::mixer::AudioMixer;
use super::peer::SessionActor;
use super::{LocalTrackSet, OutboundSignal, SessionCommand, SessionInfo, SessionState};

pub(crate) struct SessionEntry {
    pub(crate) cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    pub(crate) conn: Arc<Mutex<Arc<dyn MediaConnection>>>,
    pub(crate) info: Arc<Mutex<SessionInfo>>,
    /// Distinguishes this entry from a successor with the same user id, so
    /// a superseded actor's cleanup can't remove its replacement.
    pub(crate) epoch: u64,
}

pub struct PeerSessionManager {
    transport: Arc<dyn MediaTransport>,
    sessions: Arc<DashMap<Uuid, SessionEntry>>,
    outbox: mpsc::UnboundedSender<OutboundSignal>,
    events: EventBus,
    mixer: AudioMixer,
    config: SessionConfig,
    local_tracks: Arc<Mutex<LocalTrackSet>>,
    epoch_counter: AtomicU64,
}

impl PeerSessionManager {
    pub fn new(
        transport: Arc<dyn MediaTransport>,
        outbox: mpsc::UnboundedSender<OutboundSignal>,
        events: EventBus,
        mixer: AudioMixer,
        config: SessionConfig,
    ) -> Self {
        Self {
            transport,
            sessions: Arc::new(DashMap::new()),
            outbox,
            events,
            mixer,
            config,
            local_tracks: Arc::new(Mutex::new(LocalTrackSet::default())),
            epoch_counter: AtomicU64::new(0),
        }
    }

    /// Open a session toward `user_id`. The initiator sends the first
    /// offer; a non-initiator waits for the inbound one (covered by the
    /// establishment timeout). An existing session for the same user is
    /// destroyed first.
    pub fn open(
        &self,
        user_id: Uuid,
        display_name: &str,
        is_initiator: bool,
        initial_signal: Option<SignalPayload>,
    ) -> Result<(), EngineError> {
        if let Some((_, old)) = self.sessions.remove(&user_id) {
            log::info!("sessions: superseding existing session for {user_id}");
            let _ = old.cmd_tx.send(SessionCommand::Close(CloseReason::Superseded));
        }

        let (conn, conn_events) = self
            .transport
            .create_connection(user_id)
            .map_err(|e| EngineError::Internal(anyhow::anyhow!("transport: {e}")))?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let info = Arc::new(Mutex::new(SessionInfo {
            user_id,
            display_name: display_name.to_string(),
            state: SessionState::Connecting,
            retry_count: 0,
            last_attempt_at: None,
            volume: 1.0,
            locally_muted: false,
            last_sample: None,
        }));
        let shared_conn = Arc::new(Mutex::new(Arc::clone(&conn)));
        let epoch = self.epoch_counter.fetch_add(1, Ordering::Relaxed);

        self.sessions.insert(
            user_id,
            SessionEntry {
                cmd_tx: cmd_tx.clone(),
                conn: Arc::clone(&shared_conn),
                info: Arc::clone(&info),
                epoch,
            },
        );

        if let Some(signal) = initial_signal {
            let _ = cmd_tx.send(SessionCommand::Signal(signal));
        }

        let actor = SessionActor {
            user_id,
            is_initiator,
            transport: Arc::clone(&self.transport),
            conn,
            outbox: self.outbox.clone(),
            events: self.events.clone(),
            info,
            shared_conn,
            mixer: self.mixer.clone(),
            local_tracks: Arc::clone(&self.local_tracks),
            config: self.config.clone(),
            sessions: Arc::clone(&self.sessions),
            epoch,
            tracks_attached: false,
            keepalive: Vec::new(),
        };
        tokio::spawn(actor.run(cmd_rx, conn_events));

        log::info!(
            "sessions: opened {user_id} ({}initiator)",
            if is_initiator { "" } else { "non-" }
        );
        self.events.emit(EngineEvent::SessionStateChanged {
            user_id,
            state: SessionState::Connecting,
        });
        Ok(())
    }

    /// Route an inbound signal. Signals for one user are applied in
    /// arrival order by the session's command queue.
    pub fn signal(&self, user_id: Uuid, payload: SignalPayload) -> Result<(), EngineError> {
        let entry = self
            .sessions
            .get(&user_id)
            .ok_or(EngineError::UnknownPeer(user_id))?;
        let _ = entry.cmd_tx.send(SessionCommand::Signal(payload));
        Ok(())
    }

    pub fn has_session(&self, user_id: Uuid) -> bool {
        self.sessions.contains_key(&user_id)
    }

    /// Close one session; cancels only that session's timers.
    pub fn close(&self, user_id: Uuid, reason: CloseReason) {
        if let Some((_, entry)) = self.sessions.remove(&user_id) {
            let _ = entry.cmd_tx.send(SessionCommand::Close(reason));
        }
    }

    /// Room teardown: closes everything, cancelling all per-peer timers.
    pub fn close_all(&self, reason: CloseReason) {
        let users: Vec<Uuid> = self.sessions.iter().map(|e| *e.key()).collect();
        for user_id in users {
            self.close(user_id, reason.clone());
        }
    }

    // ── Volume ─────────────────────────────────────────────

    pub fn set_volume(&self, user_id: Uuid, volume: f32) -> Result<(), EngineError> {
        let entry = self
            .sessions
            .get(&user_id)
            .ok_or(EngineError::UnknownPeer(user_id))?;
        let clamped = volume.clamp(0.0, 2.0);
        entry.info.lock().unwrap_or_else(|e| e.into_inner()).volume = clamped;
        self.mixer.set_user_volume(user_id, clamped);
        Ok(())
    }

    /// Mute a peer locally, independent of their own mute state.
    pub fn set_local_mute(&self, user_id: Uuid, muted: bool) -> Result<(), EngineError> {
        let entry = self
            .sessions
            .get(&user_id)
            .ok_or(EngineError::UnknownPeer(user_id))?;
        entry
            .info
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .locally_muted = muted;
        self.mixer.set_user_muted(user_id, muted);
        Ok(())
    }

    pub fn apply_master_volume(&self, factor: f32) {
        self.mixer.set_master(factor);
    }

    pub fn apply_attenuation(&self, percent: f32) {
        self.mixer.set_attenuation(percent);
    }

    // ── Track plumbing (pipeline directives land here) ─────

    pub fn set_local_audio_track(&self, track: Option<TrackHandle>) {
        self.lock_tracks().audio = track;
    }

    pub fn set_local_video_track(&self, track: TrackHandle) {
        self.lock_tracks().video = Some(track);
    }

    /// Swap the video-slot track on every session. A replace, which the
    /// transport performs without renegotiation.
    pub fn replace_video_track_all(&self, track: TrackHandle) {
        self.lock_tracks().video = Some(track.clone());
        for entry in self.sessions.iter() {
            let _ = entry
                .cmd_tx
                .send(SessionCommand::ReplaceVideoTrack(track.clone()));
        }
    }

    /// Add an audio sender to every session. The caller must follow up
    /// with renegotiation requests through the coordinator.
    pub fn add_audio_track_all(&self, track: TrackHandle) {
        self.lock_tracks().screen_audio = Some(track.clone());
        for entry in self.sessions.iter() {
            let _ = entry.cmd_tx.send(SessionCommand::AddTrack(track.clone()));
        }
    }

    pub fn remove_audio_track_all(&self, slot: TrackSlot) {
        if slot == TrackSlot::ScreenAudio {
            self.lock_tracks().screen_audio = None;
        }
        for entry in self.sessions.iter() {
            let _ = entry.cmd_tx.send(SessionCommand::RemoveTrack(slot));
        }
    }

    /// Hand a renegotiation ticket to the session. The session resolves
    /// `done` once its fresh local description is dispatched (or with a
    /// rejection when it isn't stable).
    pub fn renegotiate(
        &self,
        user_id: Uuid,
        done: oneshot::Sender<Result<(), EngineError>>,
    ) -> Result<(), EngineError> {
        let entry = self
            .sessions
            .get(&user_id)
            .ok_or(EngineError::UnknownPeer(user_id))?;
        let _ = entry.cmd_tx.send(SessionCommand::Renegotiate(done));
        Ok(())
    }

    // ── Introspection (quality monitor, tests) ─────────────

    pub fn active_users(&self) -> Vec<Uuid> {
        self.sessions.iter().map(|e| *e.key()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_state(&self, user_id: Uuid) -> Option<SessionState> {
        self.sessions
            .get(&user_id)
            .map(|e| e.info.lock().unwrap_or_else(|p| p.into_inner()).state)
    }

    pub fn info(&self, user_id: Uuid) -> Option<SessionInfo> {
        self.sessions
            .get(&user_id)
            .map(|e| e.info.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    #[allow(clippy::type_complexity)]
    pub fn connections(&self) -> Vec<(Uuid, Arc<dyn MediaConnection>, SessionState)> {
        self.sessions
            .iter()
            .map(|e| {
                let conn = Arc::clone(&*e.conn.lock().unwrap_or_else(|p| p.into_inner()));
                let state = e.info.lock().unwrap_or_else(|p| p.into_inner()).state;
                (*e.key(), conn, state)
            })
            .collect()
    }

    pub fn record_sample(&self, user_id: Uuid, sample: QualitySample) {
        if let Some(entry) = self.sessions.get(&user_id) {
            let changed = {
                let mut info = entry.info.lock().unwrap_or_else(|p| p.into_inner());
                let changed = info
                    .last_sample
                    .map(|prev| prev.classification != sample.classification)
                    .unwrap_or(true);
                info.last_sample = Some(sample);
                changed
            };
            if changed {
                self.events.emit(EngineEvent::PeerQualityChanged {
                    user_id,
                    classification: sample.classification,
                });
            }
        }
    }

    pub fn set_degraded(&self, user_id: Uuid, degraded: bool) {
        if let Some(entry) = self.sessions.get(&user_id) {
            let _ = entry.cmd_tx.send(SessionCommand::SetDegraded(degraded));
        }
    }

    fn lock_tracks(&self) -> std::sync::MutexGuard<'_, LocalTrackSet> {
        self.local_tracks.lock().unwrap_or_else(|e| e.into_inner())
    }
}
