//! Local media: capture handles, the pipeline, speaking detection, and
//! noise suppression.

pub mod placeholder;
pub mod pipeline;
pub mod speaking;
pub mod suppressor;

pub use pipeline::{LocalMediaPipeline, MediaDirective};
pub use speaking::{KeyEvent, SpeakingDetector};
pub use suppressor::{create_suppressor, NoiseSuppressor, SuppressorStats};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::MediaError;
use crate::quality::VideoConstraints;
use crate::transport::{AudioFrame, TrackHandle};

/// Stops the underlying capture task. Fires on drop so a handle can't leak
/// a running capture.
#[derive(Debug)]
pub struct CaptureStop(Option<oneshot::Sender<()>>);

impl CaptureStop {
    pub fn new(tx: oneshot::Sender<()>) -> Self {
        Self(Some(tx))
    }

    /// For backends whose captures need no teardown signal.
    pub fn noop() -> Self {
        Self(None)
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for CaptureStop {
    fn drop(&mut self) {
        self.stop();
    }
}

/// An open microphone capture: raw frames flow on `frames` until stopped.
#[derive(Debug)]
pub struct AudioCapture {
    pub device_id: Option<String>,
    pub track: TrackHandle,
    pub frames: mpsc::UnboundedReceiver<AudioFrame>,
    pub stop: CaptureStop,
}

#[derive(Debug)]
pub struct VideoCapture {
    pub device_id: Option<String>,
    pub track: TrackHandle,
    pub stop: CaptureStop,
}

#[derive(Debug)]
pub struct ScreenCapture {
    pub video_track: TrackHandle,
    /// Present when desktop audio capture was requested and granted.
    pub audio_track: Option<TrackHandle>,
    pub stop: CaptureStop,
}

/// Capture collaborator: opens microphone/camera/screen captures and applies
/// capture constraints. The physical pipeline behind it is out of scope.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn open_audio(&self, device_id: Option<&str>) -> Result<AudioCapture, MediaError>;

    async fn open_camera(
        &self,
        device_id: Option<&str>,
        constraints: &VideoConstraints,
    ) -> Result<VideoCapture, MediaError>;

    async fn open_screen(&self, capture_audio: bool) -> Result<ScreenCapture, MediaError>;

    /// Apply new constraints to whatever video capture is currently active.
    async fn apply_video_constraints(
        &self,
        constraints: &VideoConstraints,
    ) -> Result<(), MediaError>;
}
