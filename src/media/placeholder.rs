//! Placeholder video track.
//!
//! The video slot always carries exactly one track; whenever camera and
//! screen share are both off it holds this 1-fps solid-color filler, so
//! toggling video is a track replace and never a renegotiation.

use uuid::Uuid;

use crate::transport::{TrackHandle, TrackKind, TrackSource};

pub const PLACEHOLDER_FPS: u32 = 1;
pub const PLACEHOLDER_WIDTH: u32 = 320;
pub const PLACEHOLDER_HEIGHT: u32 = 180;

/// I420 luma/chroma for a near-black frame.
const LUMA: u8 = 16;
const CHROMA: u8 = 128;

pub fn placeholder_track() -> TrackHandle {
    TrackHandle::new(
        format!("placeholder-{}", Uuid::new_v4()),
        TrackKind::Video,
        TrackSource::Placeholder,
    )
}

/// One solid-color I420 frame: a full-size Y plane followed by quarter-size
/// U and V planes.
pub fn solid_frame(width: u32, height: u32) -> Vec<u8> {
    let luma_len = (width * height) as usize;
    let chroma_len = luma_len / 4;
    let mut frame = vec![LUMA; luma_len + 2 * chroma_len];
    frame[luma_len..].fill(CHROMA);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_has_i420_layout() {
        let frame = solid_frame(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT);
        let luma_len = (PLACEHOLDER_WIDTH * PLACEHOLDER_HEIGHT) as usize;
        assert_eq!(frame.len(), luma_len * 3 / 2);
        assert!(frame[..luma_len].iter().all(|&b| b == LUMA));
        assert!(frame[luma_len..].iter().all(|&b| b == CHROMA));
    }

    #[test]
    fn placeholder_tracks_are_video_placeholders() {
        let track = placeholder_track();
        assert_eq!(track.kind, TrackKind::Video);
        assert_eq!(track.source, TrackSource::Placeholder);
    }
}
