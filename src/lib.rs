//! Real-time voice/video conferencing engine for the Natter desktop app.
//!
//! The engine establishes, maintains, and tears down per-peer media
//! sessions in a voice room, exchanges the signaling needed to negotiate
//! them, classifies connection health, and adapts video quality to it. The
//! signaling transport, the media transport, device enumeration, and noise
//! suppression are all injected collaborators (see [`transport`],
//! [`signaling::bus`], [`device`], [`media`]); the app shell supplies the
//! real implementations and subscribes to [`events::EngineEvent`]s.
//!
//! Entry point: [`engine::VoiceEngine`].

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod events;
pub mod media;
pub mod negotiation;
pub mod quality;
pub mod session;
pub mod signaling;
pub mod transport;

pub use config::EngineConfig;
pub use engine::{EngineCollaborators, VoiceEngine};
pub use error::{CloseReason, EngineError, MediaError, SessionError};
pub use events::{EngineEvent, EventBus, Subscription};
pub use quality::{QualityLevel, QualitySample, RoomQuality, VideoRung};
pub use session::SessionState;
