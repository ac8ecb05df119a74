//! Media transport collaborator interface.
//!
//! The engine never touches NAT traversal, encryption, or codecs. It drives
//! an underlying real-time transport through this narrow surface: create a
//! connection per remote peer, exchange descriptions and candidates, attach
//! and swap tracks, and read live statistics. Anything implementing these
//! traits (an RTC stack wrapper in production, a mock in tests) plugs in
//! unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Connection setup failed: {0}")]
    Connection(String),

    #[error("Description exchange failed: {0}")]
    Description(String),

    #[error("Track operation failed: {0}")]
    Track(String),

    #[error("Connection closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackKind {
    Audio,
    Video,
}

/// What is feeding a local track right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
    ScreenAudio,
    /// 1-fps solid-color filler occupying the video slot while camera and
    /// screen share are off.
    Placeholder,
}

/// Sender slot on a connection. Replacing the track in a slot does not
/// renegotiate; adding or removing a slot does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackSlot {
    Audio,
    Video,
    ScreenAudio,
}

/// Opaque descriptor for a local track owned by the media pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackHandle {
    pub id: String,
    pub kind: TrackKind,
    pub source: TrackSource,
}

impl TrackHandle {
    pub fn new(id: impl Into<String>, kind: TrackKind, source: TrackSource) -> Self {
        Self {
            id: id.into(),
            kind,
            source,
        }
    }
}

/// Live counters reported by the transport for one connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStats {
    pub packets_received: u64,
    pub packets_lost: u64,
    pub jitter_seconds: f64,
}

impl TransportStats {
    /// Fraction of packets lost, in [0, 1].
    pub fn loss_rate(&self) -> f64 {
        let total = self.packets_received + self.packets_lost;
        if total == 0 {
            0.0
        } else {
            self.packets_lost as f64 / total as f64
        }
    }
}

/// ICE-equivalent connectivity, as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// One frame of decoded remote audio.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub data: Vec<i16>,
    pub sample_rate: u32,
    pub num_channels: u32,
}

#[derive(Debug)]
pub enum ConnectionEvent {
    /// First connect/media event. Ends the establishment timeout.
    Connected,
    /// Remote audio became available; frames arrive on the receiver until
    /// the connection closes.
    RemoteAudio(mpsc::UnboundedReceiver<AudioFrame>),
    Connectivity(ConnectivityState),
    Error(String),
    Closed,
}

#[async_trait]
pub trait MediaConnection: Send + Sync {
    async fn create_offer(&self) -> Result<String, TransportError>;

    async fn create_answer(&self, offer_sdp: &str) -> Result<String, TransportError>;

    async fn apply_answer(&self, sdp: &str) -> Result<(), TransportError>;

    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), TransportError>;

    /// Adds a new sender slot. Requires renegotiation afterwards.
    async fn add_track(&self, track: TrackHandle) -> Result<(), TransportError>;

    /// Substitutes the track in an existing slot without renegotiation.
    async fn replace_track(&self, slot: TrackSlot, track: TrackHandle)
        -> Result<(), TransportError>;

    /// Removes a sender slot. Requires renegotiation afterwards.
    async fn remove_track(&self, slot: TrackSlot) -> Result<(), TransportError>;

    /// True when no description exchange is mid-flight on this connection.
    async fn is_stable(&self) -> bool;

    async fn stats(&self) -> Result<TransportStats, TransportError>;

    async fn close(&self);
}

/// Factory for per-peer connections.
pub trait MediaTransport: Send + Sync {
    #[allow(clippy::type_complexity)]
    fn create_connection(
        &self,
        remote_user: Uuid,
    ) -> Result<
        (
            Arc<dyn MediaConnection>,
            mpsc::UnboundedReceiver<ConnectionEvent>,
        ),
        TransportError,
    >;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loss_rate_handles_empty_counters() {
        assert_eq!(TransportStats::default().loss_rate(), 0.0);
    }

    #[test]
    fn loss_rate_is_lost_over_total() {
        let stats = TransportStats {
            packets_received: 85,
            packets_lost: 15,
            jitter_seconds: 0.0,
        };
        assert!((stats.loss_rate() - 0.15).abs() < 1e-9);
    }
}
