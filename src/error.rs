//! Engine error taxonomy.
//!
//! Media acquisition and session establishment have their own error enums so
//! callers can match on the recoverable cases; everything else funnels into
//! [`EngineError`]. No error here is fatal to the whole engine — a bad peer
//! degrades that peer only.

use uuid::Uuid;

/// Errors raised while acquiring or switching capture devices.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("Capture permission denied")]
    PermissionDenied,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("Constraints unsatisfiable: {0}")]
    ConstraintsUnsatisfiable(String),
}

/// Errors raised on the per-peer session path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Connection establishment timed out")]
    ConnectionTimeout,

    #[error("Signaling bus unavailable")]
    SignalingUnavailable,

    #[error("Gave up connecting to {0} after maximum retries")]
    MaxRetriesExceeded(Uuid),
}

/// Why a session was closed, reported to the caller with the closure event.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CloseReason {
    /// The remote participant left the room.
    RemoteLeft,
    /// We left the room or closed the session explicitly.
    LocalClose,
    /// Retries exhausted; see [`SessionError::MaxRetriesExceeded`].
    MaxRetriesExceeded,
    /// The session was replaced by a newer one for the same user.
    Superseded,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Session(#[from] SessionError),

    /// Renegotiation requested against a session that is not in a stable
    /// connected state. Dropped silently inside the engine; only tests and
    /// the negotiation worker ever observe it.
    #[error("Renegotiation rejected for {0}: session not stable")]
    RenegotiationRejected(Uuid),

    #[error("Not connected to a room")]
    NotInRoom,

    #[error("No session for user {0}")]
    UnknownPeer(Uuid),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_errors_render_their_device() {
        let err = MediaError::DeviceNotFound("pipewire-node-7".into());
        assert_eq!(err.to_string(), "Device not found: pipewire-node-7");
    }

    #[test]
    fn session_error_converts_into_engine_error() {
        let user = Uuid::new_v4();
        let err: EngineError = SessionError::MaxRetriesExceeded(user).into();
        assert!(matches!(
            err,
            EngineError::Session(SessionError::MaxRetriesExceeded(u)) if u == user
        ));
    }
}
