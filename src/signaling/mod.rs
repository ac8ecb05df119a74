//! Signaling coordination: room membership, offer routing, reconnect
//! handling.
//!
//! Initiator asymmetry (policy, not negotiable — it prevents duplicate
//! simultaneous offers): the side that joins initiates toward every member
//! it finds in the roster; when a newcomer appears, the existing side opens
//! a waiting session and lets the newcomer's offer arrive. Sends are
//! best-effort — when the bus is down the message is dropped and the
//! session timeout/retry path recovers.

pub mod bus;
pub mod message;

pub use bus::{BusError, BusEvent, InboundSignal, SignalingBus};
pub use message::{MemberInfo, SignalPayload};

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::CloseReason;
use crate::events::{EngineEvent, EventBus};
use crate::session::{OutboundSignal, PeerSessionManager};

pub struct SignalingCoordinator {
    bus: Arc<dyn SignalingBus>,
    manager: Arc<PeerSessionManager>,
    events: EventBus,
    local_user: Uuid,
    display_name: String,
    roster: Arc<DashMap<Uuid, MemberInfo>>,
    speaking: Arc<Mutex<HashSet<Uuid>>>,
    room: Arc<Mutex<Option<Uuid>>>,
}

impl SignalingCoordinator {
    pub fn new(
        bus: Arc<dyn SignalingBus>,
        manager: Arc<PeerSessionManager>,
        events: EventBus,
        local_user: Uuid,
        display_name: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            manager,
            events,
            local_user,
            display_name,
            roster: Arc::new(DashMap::new()),
            speaking: Arc::new(Mutex::new(HashSet::new())),
            room: Arc::new(Mutex::new(None)),
        })
    }

    /// Start the inbound routing loop and the outbound pump. Runs until
    /// the coordinator is dropped or the bus closes its stream.
    pub fn start(self: &Arc<Self>, mut outbox_rx: mpsc::UnboundedReceiver<OutboundSignal>) {
        let coordinator = Arc::clone(self);
        let mut bus_events = self.bus.subscribe();
        tokio::spawn(async move {
            while let Some(event) = bus_events.recv().await {
                match event {
                    BusEvent::Message(message) => coordinator.handle_message(message),
                    BusEvent::Reconnected => coordinator.handle_reconnect().await,
                }
            }
            log::info!("signaling: bus stream closed");
        });

        let bus = Arc::clone(&self.bus);
        let room = Arc::clone(&self.room);
        tokio::spawn(async move {
            while let Some(signal) = outbox_rx.recv().await {
                let Some(room_id) = *room.lock().unwrap_or_else(|e| e.into_inner()) else {
                    continue;
                };
                let kind = signal.payload.kind();
                if let Err(e) = bus
                    .send(room_id, Some(signal.target), signal.payload)
                    .await
                {
                    // Best-effort: the owning session's timeout/retry path
                    // recovers from lost signals.
                    log::warn!(
                        "signaling: {kind} to {} dropped: {e}",
                        signal.target
                    );
                }
            }
        });
    }

    /// Announce ourselves in a room. The roster reply drives session
    /// creation toward everyone already there.
    pub async fn join(&self, room_id: Uuid) {
        *self.room.lock().unwrap_or_else(|e| e.into_inner()) = Some(room_id);
        self.announce(room_id).await;
    }

    /// Announce departure and forget the room. Session teardown is the
    /// engine's job.
    pub async fn leave(&self) {
        let room_id = self
            .room
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(room_id) = room_id {
            let payload = SignalPayload::MemberLeft {
                user_id: self.local_user,
            };
            if let Err(e) = self.bus.send(room_id, None, payload).await {
                log::warn!("signaling: leave announce dropped: {e}");
            }
        }
        self.roster.clear();
        self.speaking
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Broadcast a state change (speaking/mute/camera) to the room.
    pub async fn broadcast(&self, payload: SignalPayload) {
        let Some(room_id) = *self.room.lock().unwrap_or_else(|e| e.into_inner()) else {
            return;
        };
        let kind = payload.kind();
        if let Err(e) = self.bus.send(room_id, None, payload).await {
            log::warn!("signaling: {kind} broadcast dropped: {e}");
        }
    }

    pub fn update_local_speaking(&self, speaking: bool) {
        self.set_speaking(self.local_user, speaking);
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        self.roster.iter().map(|e| e.value().clone()).collect()
    }

    pub fn current_room(&self) -> Option<Uuid> {
        *self.room.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Inbound handling ───────────────────────────────────

    fn handle_message(&self, message: InboundSignal) {
        let Some(room_id) = self.current_room() else {
            return;
        };
        if message.room_id != room_id {
            return;
        }

        let from = message.from;
        match message.payload {
            SignalPayload::MemberRoster { members } => {
                for member in members {
                    if member.user_id == self.local_user {
                        continue;
                    }
                    // We are the joining side: initiator toward everyone
                    // already present.
                    self.admit_member(member, true);
                }
            }
            SignalPayload::MemberJoined { member } => {
                if member.user_id == self.local_user {
                    // Our own (possibly re-issued) announce echoed back.
                    return;
                }
                // The newcomer initiates; our session waits for the offer,
                // with the establishment timeout covering one that never
                // arrives. Duplicate announces (bus reconnects) are no-ops.
                self.admit_member(member, false);
            }
            SignalPayload::MemberLeft { user_id } => {
                if user_id == self.local_user {
                    return;
                }
                if self.roster.remove(&user_id).is_some() {
                    self.manager.close(user_id, CloseReason::RemoteLeft);
                    self.set_speaking(user_id, false);
                    self.events.emit(EngineEvent::ParticipantLeft { user_id });
                }
            }
            payload @ SignalPayload::Offer { .. } => {
                if self.manager.has_session(from) {
                    let _ = self.manager.signal(from, payload);
                } else {
                    // First contact straight through an offer (we may have
                    // missed the member-joined).
                    let member = self
                        .roster
                        .get(&from)
                        .map(|m| m.value().clone())
                        .unwrap_or_else(|| MemberInfo {
                            user_id: from,
                            display_name: from.to_string(),
                        });
                    self.roster.insert(from, member.clone());
                    self.events.emit(EngineEvent::ParticipantJoined {
                        user_id: from,
                        display_name: member.display_name.clone(),
                    });
                    if let Err(e) =
                        self.manager
                            .open(from, &member.display_name, false, Some(payload))
                    {
                        log::warn!("signaling: session open for {from} failed: {e}");
                    }
                }
            }
            payload @ (SignalPayload::Answer { .. }
            | SignalPayload::IceCandidate { .. }
            | SignalPayload::ReconnectRequest) => {
                if self.manager.signal(from, payload).is_err() {
                    log::debug!("signaling: dropping signal for unknown peer {from}");
                }
            }
            SignalPayload::SpeakingChanged { speaking } => {
                self.set_speaking(from, speaking);
                self.events.emit(EngineEvent::SpeakingChanged {
                    user_id: from,
                    speaking,
                });
            }
            SignalPayload::MuteChanged { muted } => {
                self.events.emit(EngineEvent::MuteChanged {
                    user_id: from,
                    muted,
                });
            }
            SignalPayload::CameraChanged { enabled } => {
                self.events.emit(EngineEvent::CameraChanged {
                    user_id: from,
                    enabled,
                });
            }
        }
    }

    async fn handle_reconnect(&self) {
        // The bus came back after a drop. If we were mid-session in a
        // room, re-issue the join; a duplicate for an already-current room
        // is a no-op on the remote side.
        let Some(room_id) = self.current_room() else {
            return;
        };
        log::info!("signaling: bus reconnected, re-announcing room {room_id}");
        self.announce(room_id).await;
    }

    async fn announce(&self, room_id: Uuid) {
        let payload = SignalPayload::MemberJoined {
            member: MemberInfo {
                user_id: self.local_user,
                display_name: self.display_name.clone(),
            },
        };
        if let Err(e) = self.bus.send(room_id, None, payload).await {
            // Best-effort: a rejoin fires on the next bus reconnect.
            log::warn!("signaling: join announce dropped: {e}");
        }
    }

    fn admit_member(&self, member: MemberInfo, initiator: bool) {
        let user_id = member.user_id;
        if self.roster.insert(user_id, member.clone()).is_some() {
            // Already known: duplicate roster entry or repeated announce.
            return;
        }
        self.events.emit(EngineEvent::ParticipantJoined {
            user_id,
            display_name: member.display_name.clone(),
        });
        if let Err(e) = self
            .manager
            .open(user_id, &member.display_name, initiator, None)
        {
            log::warn!("signaling: session open for {user_id} failed: {e}");
        }
    }

    fn set_speaking(&self, user_id: Uuid, speaking: bool) {
        let changed = {
            let mut set = self.speaking.lock().unwrap_or_else(|e| e.into_inner());
            if speaking {
                set.insert(user_id)
            } else {
                set.remove(&user_id)
            }
        };
        if changed {
            let mut speakers: Vec<Uuid> = self
                .speaking
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .copied()
                .collect();
            speakers.sort();
            self.events.emit(EngineEvent::ActiveSpeakers { speakers });
        }
    }
}
