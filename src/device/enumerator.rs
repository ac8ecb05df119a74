//! Device enumeration collaborator interface.

use tokio::sync::mpsc;

use crate::error::MediaError;

use super::{DeviceDescriptor, DeviceKind};

pub trait DeviceEnumerator: Send + Sync {
    /// List capture and playback devices currently visible to the platform.
    /// `is_preferred` and `last_test_result` are filled in by the registry.
    fn list(&self) -> Result<Vec<DeviceDescriptor>, MediaError>;

    /// Ask the platform for capture permission for the given device kind.
    fn request_permission(&self, kind: DeviceKind) -> Result<(), MediaError>;

    /// Event-based device-change notifications, where the platform provides
    /// them. `None` makes the registry fall back to polling.
    fn change_events(&self) -> Option<mpsc::UnboundedReceiver<()>>;
}
