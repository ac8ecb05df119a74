//! Engine → app event fan-out.
//!
//! The app shell used to register emitter callbacks directly on the voice
//! manager, which made it possible to register the same listener twice.
//! Here every listener gets its own channel and an explicit [`Subscription`]
//! handle; labeled subscriptions replace an earlier listener with the same
//! label instead of stacking a duplicate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::CloseReason;
use crate::quality::{QualityLevel, RoomQuality, VideoRung};
use crate::session::SessionState;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineEvent {
    LocalIdentity {
        user_id: Uuid,
    },
    ParticipantJoined {
        user_id: Uuid,
        display_name: String,
    },
    ParticipantLeft {
        user_id: Uuid,
    },
    SessionStateChanged {
        user_id: Uuid,
        state: SessionState,
    },
    SessionClosed {
        user_id: Uuid,
        reason: CloseReason,
    },
    SpeakingChanged {
        user_id: Uuid,
        speaking: bool,
    },
    /// Consolidated set of everyone currently speaking, local user included.
    ActiveSpeakers {
        speakers: Vec<Uuid>,
    },
    LocalSpeaking {
        speaking: bool,
    },
    /// 0-100 RMS meter for the local microphone.
    MicLevel {
        level: f64,
    },
    MuteChanged {
        user_id: Uuid,
        muted: bool,
    },
    CameraChanged {
        user_id: Uuid,
        enabled: bool,
    },
    PeerQualityChanged {
        user_id: Uuid,
        classification: QualityLevel,
    },
    RoomQualityChanged {
        quality: RoomQuality,
    },
    QualityWarning {
        message: String,
    },
    VideoRungChanged {
        rung: VideoRung,
    },
    DevicesChanged,
}

struct Listener {
    label: Option<String>,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

#[derive(Default)]
struct BusInner {
    listeners: HashMap<u64, Listener>,
    next_id: u64,
}

/// Fan-out hub for [`EngineEvent`]s.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

/// Keeps one listener registered. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    inner: Weak<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> (Subscription, mpsc::UnboundedReceiver<EngineEvent>) {
        self.register(None)
    }

    /// Subscribe under a label. If a listener with the same label already
    /// exists it is replaced, so re-running app setup code cannot stack
    /// duplicate listeners.
    pub fn subscribe_labeled(
        &self,
        label: &str,
    ) -> (Subscription, mpsc::UnboundedReceiver<EngineEvent>) {
        self.register(Some(label.to_string()))
    }

    fn register(
        &self,
        label: Option<String>,
    ) -> (Subscription, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(ref label) = label {
            inner
                .listeners
                .retain(|_, l| l.label.as_deref() != Some(label.as_str()));
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.insert(id, Listener { label, tx });

        (
            Subscription {
                id,
                inner: Arc::downgrade(&self.inner),
            },
            rx,
        )
    }

    pub fn emit(&self, event: EngineEvent) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        // Listeners whose receiver was dropped without unsubscribing are
        // pruned on the next emit.
        inner.listeners.retain(|_, l| l.tx.send(event.clone()).is_ok());
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .listeners
            .len()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.listeners.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_reaches_all_listeners() {
        let bus = EventBus::new();
        let (_s1, mut rx1) = bus.subscribe();
        let (_s2, mut rx2) = bus.subscribe();

        bus.emit(EngineEvent::LocalSpeaking { speaking: true });

        assert!(matches!(
            rx1.try_recv(),
            Ok(EngineEvent::LocalSpeaking { speaking: true })
        ));
        assert!(matches!(
            rx2.try_recv(),
            Ok(EngineEvent::LocalSpeaking { speaking: true })
        ));
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let bus = EventBus::new();
        let (sub, _rx) = bus.subscribe();
        assert_eq!(bus.listener_count(), 1);
        drop(sub);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn labeled_subscription_replaces_earlier_one() {
        let bus = EventBus::new();
        let (_s1, mut rx1) = bus.subscribe_labeled("ui");
        let (_s2, mut rx2) = bus.subscribe_labeled("ui");
        assert_eq!(bus.listener_count(), 1);

        bus.emit(EngineEvent::DevicesChanged);
        assert!(rx1.try_recv().is_err());
        assert!(matches!(rx2.try_recv(), Ok(EngineEvent::DevicesChanged)));
    }

    #[test]
    fn closed_receivers_are_pruned_on_emit() {
        let bus = EventBus::new();
        let (_sub, rx) = bus.subscribe();
        drop(rx);
        bus.emit(EngineEvent::DevicesChanged);
        assert_eq!(bus.listener_count(), 0);
    }
}
