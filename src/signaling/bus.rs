//! Signaling bus collaborator interface.
//!
//! The real bus is the app's gateway websocket; tests use an in-memory
//! implementation. Delivery is at-least-once and unordered across message
//! types.

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::message::SignalPayload;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("Signaling bus unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct InboundSignal {
    pub room_id: Uuid,
    pub from: Uuid,
    pub payload: SignalPayload,
}

#[derive(Debug, Clone)]
pub enum BusEvent {
    Message(InboundSignal),
    /// The bus reconnected after a drop. The coordinator re-announces the
    /// current room so peers can re-establish.
    Reconnected,
}

#[async_trait]
pub trait SignalingBus: Send + Sync {
    /// Send a payload to one member (`target = Some`) or the whole room
    /// (`target = None`).
    async fn send(
        &self,
        room_id: Uuid,
        target: Option<Uuid>,
        payload: SignalPayload,
    ) -> Result<(), BusError>;

    /// Stream of inbound messages and reconnect notifications.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<BusEvent>;
}
