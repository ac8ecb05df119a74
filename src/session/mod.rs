//! Per-peer media sessions: lifecycle state machine, retry/backoff, and
//! remote audio playback.

pub mod manager;
pub mod mixer;
mod peer;

pub use manager::PeerSessionManager;
pub use mixer::{effective_gain, AudioMixer};

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{CloseReason, EngineError};
use crate::quality::QualitySample;
use crate::signaling::message::SignalPayload;
use crate::transport::{TrackHandle, TrackSlot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Connecting,
    Connected,
    /// Quality is poor or critical. Non-terminal; returns to `connected`
    /// when conditions recover.
    Degraded,
    Disconnected,
    Failed,
}

/// Snapshot of one peer session, readable while the session runs.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub user_id: Uuid,
    pub display_name: String,
    pub state: SessionState,
    pub retry_count: u32,
    pub last_attempt_at: Option<Instant>,
    /// Per-user playback volume, 0.0–2.0.
    pub volume: f32,
    /// Locally muted, independent of the remote's own mute.
    pub locally_muted: bool,
    pub last_sample: Option<QualitySample>,
}

/// A signaling message produced by a session, addressed to its peer. The
/// signaling coordinator pumps these onto the bus.
#[derive(Debug, Clone)]
pub struct OutboundSignal {
    pub target: Uuid,
    pub payload: SignalPayload,
}

/// The local tracks every new connection attaches. Owned by the manager,
/// written only via the pipeline's directives.
#[derive(Debug, Clone, Default)]
pub struct LocalTrackSet {
    pub audio: Option<TrackHandle>,
    pub video: Option<TrackHandle>,
    pub screen_audio: Option<TrackHandle>,
}

/// Commands consumed by a session's actor task, strictly in order — which
/// is what serializes signal application per peer.
pub(crate) enum SessionCommand {
    Signal(SignalPayload),
    Renegotiate(oneshot::Sender<Result<(), EngineError>>),
    ReplaceVideoTrack(TrackHandle),
    AddTrack(TrackHandle),
    RemoveTrack(TrackSlot),
    SetDegraded(bool),
    Close(CloseReason),
}
