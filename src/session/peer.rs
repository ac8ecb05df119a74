//! The per-peer session actor.
//!
//! One task per remote participant consumes a command queue (which
//! serializes signal application for that peer) and the transport's
//! connection events, and drives the lifecycle state machine:
//!
//! ```text
//! connecting ── connected ⇄ degraded
//!     │             │
//!     └── error/timeout ── backoff ── reconnect-request ── connecting …
//!                   │
//!                   └── retries exhausted ── failed (removed)
//! ```
//!
//! A retry is never local-only: both sides must agree who the offering
//! party is, so the backoff path asks the remote to re-initiate and waits
//! for its fresh offer on a new connection.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{CloseReason, EngineError};
use crate::events::{EngineEvent, EventBus};
use crate::signaling::message::SignalPayload;
use crate::transport::{
    ConnectionEvent, ConnectivityState, MediaConnection, MediaTransport, TrackSlot,
    TransportError,
};

use super::manager::SessionEntry;
use super::mixer::AudioMixer;
use super::{LocalTrackSet, OutboundSignal, SessionCommand, SessionInfo, SessionState};

/// Placeholder deadline for disarmed timers; the `if` guards keep these
/// branches from ever being polled while disarmed.
const FAR_FUTURE: Duration = Duration::from_secs(86_400);

pub(crate) struct SessionActor {
    pub user_id: Uuid,
    pub is_initiator: bool,
    pub transport: Arc<dyn MediaTransport>,
    pub conn: Arc<dyn MediaConnection>,
    pub outbox: mpsc::UnboundedSender<OutboundSignal>,
    pub events: EventBus,
    pub info: Arc<Mutex<SessionInfo>>,
    pub shared_conn: Arc<Mutex<Arc<dyn MediaConnection>>>,
    pub mixer: AudioMixer,
    pub local_tracks: Arc<Mutex<LocalTrackSet>>,
    pub config: SessionConfig,
    pub sessions: Arc<DashMap<Uuid, SessionEntry>>,
    pub epoch: u64,
    pub tracks_attached: bool,
    /// Keeps replacement event channels open after a transport drops its
    /// sender, so the select loop never spins on a closed receiver.
    pub keepalive: Vec<mpsc::UnboundedSender<ConnectionEvent>>,
}

impl SessionActor {
    pub(crate) async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
        mut conn_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        let reason = self.drive(&mut cmd_rx, &mut conn_events).await;

        self.conn.close().await;
        self.mixer.remove_user(self.user_id);
        self.sessions
            .remove_if(&self.user_id, |_, entry| entry.epoch == self.epoch);

        let final_state = match reason {
            CloseReason::MaxRetriesExceeded => SessionState::Failed,
            _ => SessionState::Disconnected,
        };
        self.set_state(final_state);

        // A superseded session was replaced in place; reporting a closure
        // would make the app drop the user from the participant list.
        if reason != CloseReason::Superseded {
            self.events.emit(EngineEvent::SessionClosed {
                user_id: self.user_id,
                reason: reason.clone(),
            });
        }
        log::info!("session {}: closed ({reason:?})", self.user_id);
    }

    async fn drive(
        &mut self,
        cmd_rx: &mut mpsc::UnboundedReceiver<SessionCommand>,
        conn_events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> CloseReason {
        let mut connect_deadline = Box::pin(sleep(self.connect_timeout()));
        let mut deadline_armed = true;
        let mut backoff = Box::pin(sleep(FAR_FUTURE));
        let mut backoff_armed = false;

        self.touch_attempt();

        if self.is_initiator {
            if let Err(e) = self.send_offer().await {
                log::warn!("session {}: initial offer failed: {e}", self.user_id);
                if !self.schedule_retry(&mut backoff, &mut backoff_armed) {
                    return CloseReason::MaxRetriesExceeded;
                }
                deadline_armed = false;
            }
        }

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        return CloseReason::LocalClose;
                    };
                    match cmd {
                        SessionCommand::Close(reason) => return reason,
                        SessionCommand::Signal(SignalPayload::ReconnectRequest) => {
                            // The remote's retry path: tear down and offer
                            // afresh from our side.
                            log::info!(
                                "session {}: remote requested reconnect",
                                self.user_id
                            );
                            match self.reconnect_as_initiator(conn_events).await {
                                Ok(()) => {
                                    connect_deadline
                                        .as_mut()
                                        .reset(Instant::now() + self.connect_timeout());
                                    deadline_armed = true;
                                    backoff_armed = false;
                                }
                                Err(e) => {
                                    log::warn!(
                                        "session {}: reconnect failed: {e}",
                                        self.user_id
                                    );
                                    if !self.schedule_retry(&mut backoff, &mut backoff_armed) {
                                        return CloseReason::MaxRetriesExceeded;
                                    }
                                    deadline_armed = false;
                                }
                            }
                        }
                        SessionCommand::Signal(payload) => {
                            if let Err(e) = self.apply_signal(payload).await {
                                log::warn!(
                                    "session {}: signal application failed: {e}",
                                    self.user_id
                                );
                                if backoff_armed {
                                    continue;
                                }
                                if !self.schedule_retry(&mut backoff, &mut backoff_armed) {
                                    return CloseReason::MaxRetriesExceeded;
                                }
                                deadline_armed = false;
                            }
                        }
                        SessionCommand::Renegotiate(done) => {
                            self.handle_renegotiate(done).await;
                        }
                        SessionCommand::ReplaceVideoTrack(track) => {
                            if self.tracks_attached {
                                if let Err(e) =
                                    self.conn.replace_track(TrackSlot::Video, track).await
                                {
                                    log::warn!(
                                        "session {}: video replace failed: {e}",
                                        self.user_id
                                    );
                                }
                            }
                        }
                        SessionCommand::AddTrack(track) => {
                            if self.tracks_attached {
                                if let Err(e) = self.conn.add_track(track).await {
                                    log::warn!(
                                        "session {}: add track failed: {e}",
                                        self.user_id
                                    );
                                }
                            }
                        }
                        SessionCommand::RemoveTrack(slot) => {
                            if self.tracks_attached {
                                if let Err(e) = self.conn.remove_track(slot).await {
                                    log::warn!(
                                        "session {}: remove track failed: {e}",
                                        self.user_id
                                    );
                                }
                            }
                        }
                        SessionCommand::SetDegraded(degraded) => self.set_degraded(degraded),
                    }
                }
                ev = conn_events.recv() => {
                    let failure: Option<String> = match ev {
                        None => {
                            // Transport dropped its sender; park a live
                            // replacement channel so recv() pends instead
                            // of spinning.
                            let (tx, rx) = mpsc::unbounded_channel();
                            self.keepalive.push(tx);
                            *conn_events = rx;
                            None
                        }
                        Some(ConnectionEvent::Connected) => {
                            deadline_armed = false;
                            backoff_armed = false;
                            self.on_connected();
                            None
                        }
                        Some(ConnectionEvent::RemoteAudio(stream)) => {
                            self.mixer.add_stream(self.user_id, stream);
                            None
                        }
                        Some(ConnectionEvent::Connectivity(state)) => match state {
                            ConnectivityState::Connected => {
                                deadline_armed = false;
                                backoff_armed = false;
                                self.on_connected();
                                None
                            }
                            ConnectivityState::Disconnected | ConnectivityState::Failed => {
                                Some(format!("connectivity {state:?}"))
                            }
                            _ => None,
                        },
                        Some(ConnectionEvent::Error(message)) => Some(message),
                        Some(ConnectionEvent::Closed) => Some("transport closed".into()),
                    };

                    if let Some(message) = failure {
                        if backoff_armed {
                            log::debug!(
                                "session {}: error during backoff ignored: {message}",
                                self.user_id
                            );
                        } else {
                            log::warn!("session {}: {message}", self.user_id);
                            if !self.schedule_retry(&mut backoff, &mut backoff_armed) {
                                return CloseReason::MaxRetriesExceeded;
                            }
                            deadline_armed = false;
                        }
                    }
                }
                _ = connect_deadline.as_mut(), if deadline_armed => {
                    deadline_armed = false;
                    log::warn!(
                        "session {}: no connection within {:?}",
                        self.user_id,
                        self.connect_timeout()
                    );
                    if !self.schedule_retry(&mut backoff, &mut backoff_armed) {
                        return CloseReason::MaxRetriesExceeded;
                    }
                }
                _ = backoff.as_mut(), if backoff_armed => {
                    backoff_armed = false;
                    match self.request_remote_reoffer(conn_events).await {
                        Ok(()) => {
                            connect_deadline
                                .as_mut()
                                .reset(Instant::now() + self.connect_timeout());
                            deadline_armed = true;
                        }
                        Err(e) => {
                            log::warn!("session {}: retry setup failed: {e}", self.user_id);
                            if !self.schedule_retry(&mut backoff, &mut backoff_armed) {
                                return CloseReason::MaxRetriesExceeded;
                            }
                        }
                    }
                }
            }
        }
    }

    // ── Signal handling ────────────────────────────────────

    async fn apply_signal(&mut self, payload: SignalPayload) -> Result<(), TransportError> {
        match payload {
            SignalPayload::Offer { sdp } => {
                self.ensure_tracks_attached().await?;
                let answer = self.conn.create_answer(&sdp).await?;
                let _ = self.outbox.send(OutboundSignal {
                    target: self.user_id,
                    payload: SignalPayload::Answer { sdp: answer },
                });
            }
            SignalPayload::Answer { sdp } => {
                self.conn.apply_answer(&sdp).await?;
            }
            SignalPayload::IceCandidate { candidate, .. } => {
                self.conn.add_remote_candidate(&candidate).await?;
            }
            other => {
                log::debug!(
                    "session {}: ignoring {} signal",
                    self.user_id,
                    other.kind()
                );
            }
        }
        Ok(())
    }

    async fn send_offer(&mut self) -> Result<(), TransportError> {
        self.ensure_tracks_attached().await?;
        let sdp = self.conn.create_offer().await?;
        let _ = self.outbox.send(OutboundSignal {
            target: self.user_id,
            payload: SignalPayload::Offer { sdp },
        });
        Ok(())
    }

    async fn handle_renegotiate(&mut self, done: tokio::sync::oneshot::Sender<Result<(), EngineError>>) {
        let connected = matches!(
            self.state(),
            SessionState::Connected | SessionState::Degraded
        );
        if !connected || !self.conn.is_stable().await {
            let _ = done.send(Err(EngineError::RenegotiationRejected(self.user_id)));
            return;
        }
        match self.conn.create_offer().await {
            Ok(sdp) => {
                let _ = self.outbox.send(OutboundSignal {
                    target: self.user_id,
                    payload: SignalPayload::Offer { sdp },
                });
                // Dispatching the local description completes the ticket;
                // the answer comes back through normal signal routing.
                let _ = done.send(Ok(()));
            }
            Err(e) => {
                let _ = done.send(Err(EngineError::Internal(anyhow::anyhow!(
                    "renegotiation offer failed: {e}"
                ))));
            }
        }
    }

    // ── Retry path ─────────────────────────────────────────

    /// Account one failed attempt. Returns false when retries are
    /// exhausted; otherwise arms the backoff timer.
    fn schedule_retry(
        &mut self,
        backoff: &mut std::pin::Pin<Box<tokio::time::Sleep>>,
        armed: &mut bool,
    ) -> bool {
        let retry = {
            let mut info = self.lock_info();
            info.retry_count += 1;
            info.retry_count
        };
        if retry > self.config.max_retries {
            log::warn!(
                "session {}: giving up after {} retries",
                self.user_id,
                self.config.max_retries
            );
            return false;
        }

        let delay = Duration::from_millis(
            self.config.retry_backoff_base_ms * (1u64 << (retry - 1)),
        );
        log::info!(
            "session {}: attempt failed, retry {retry} in {delay:?}",
            self.user_id
        );
        self.set_state(SessionState::Connecting);
        backoff.as_mut().reset(Instant::now() + delay);
        *armed = true;
        true
    }

    /// Our backoff fired: ask the other side to re-initiate on a fresh
    /// connection. We wait for their offer as the non-initiating party.
    async fn request_remote_reoffer(
        &mut self,
        conn_events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> Result<(), TransportError> {
        let _ = self.outbox.send(OutboundSignal {
            target: self.user_id,
            payload: SignalPayload::ReconnectRequest,
        });
        self.recreate_connection(conn_events).await?;
        self.set_state(SessionState::Connecting);
        self.touch_attempt();
        Ok(())
    }

    /// The remote's backoff fired: we tear down and send the fresh offer.
    async fn reconnect_as_initiator(
        &mut self,
        conn_events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> Result<(), TransportError> {
        self.recreate_connection(conn_events).await?;
        self.set_state(SessionState::Connecting);
        self.touch_attempt();
        self.send_offer().await
    }

    async fn recreate_connection(
        &mut self,
        conn_events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> Result<(), TransportError> {
        self.conn.close().await;
        self.mixer.remove_stream(self.user_id);
        let (conn, rx) = self.transport.create_connection(self.user_id)?;
        self.conn = Arc::clone(&conn);
        *self
            .shared_conn
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = conn;
        *conn_events = rx;
        self.tracks_attached = false;
        Ok(())
    }

    // ── State bookkeeping ──────────────────────────────────

    async fn ensure_tracks_attached(&mut self) -> Result<(), TransportError> {
        if self.tracks_attached {
            return Ok(());
        }
        let tracks = self
            .local_tracks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(audio) = tracks.audio {
            self.conn.add_track(audio).await?;
        }
        if let Some(video) = tracks.video {
            self.conn.add_track(video).await?;
        }
        if let Some(screen_audio) = tracks.screen_audio {
            self.conn.add_track(screen_audio).await?;
        }
        self.tracks_attached = true;
        Ok(())
    }

    fn on_connected(&mut self) {
        let previous = self.state();
        if !matches!(previous, SessionState::Connected | SessionState::Degraded) {
            self.lock_info().retry_count = 0;
            self.set_state(SessionState::Connected);
            log::info!("session {}: connected", self.user_id);
        }
    }

    fn set_degraded(&mut self, degraded: bool) {
        match (self.state(), degraded) {
            (SessionState::Connected, true) => self.set_state(SessionState::Degraded),
            (SessionState::Degraded, false) => self.set_state(SessionState::Connected),
            _ => {}
        }
    }

    fn set_state(&self, state: SessionState) {
        let changed = {
            let mut info = self.lock_info();
            let changed = info.state != state;
            info.state = state;
            changed
        };
        if changed {
            self.events.emit(EngineEvent::SessionStateChanged {
                user_id: self.user_id,
                state,
            });
        }
    }

    fn state(&self) -> SessionState {
        self.lock_info().state
    }

    fn touch_attempt(&self) {
        self.lock_info().last_attempt_at = Some(Instant::now());
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.config.connect_timeout_ms)
    }

    fn lock_info(&self) -> std::sync::MutexGuard<'_, SessionInfo> {
        self.info.lock().unwrap_or_else(|e| e.into_inner())
    }
}
