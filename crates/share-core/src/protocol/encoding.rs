//! Frame kind detection.
//!
//! The relay protocol uses two encodings on one socket:
//! - **JSON**: every control message (always an object, so starts with `{`)
//! - **Chunk**: file bytes, one tag byte followed by a bincode body
//!
//! The first byte decides.

/// Tag byte that opens every binary chunk frame.
pub const CHUNK_FRAME_TAG: u8 = 0x01;

/// Kind of frame based on its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// JSON control message
    Json,
    /// Tagged binary chunk
    Chunk,
    /// Empty frame
    Empty,
    /// Anything else; dropped by receivers
    Unknown,
}

/// Detect the frame kind from raw bytes.
pub fn detect_frame_kind(data: &[u8]) -> FrameKind {
    match data.first() {
        Some(b'{') => FrameKind::Json,
        Some(&CHUNK_FRAME_TAG) => FrameKind::Chunk,
        Some(_) => FrameKind::Unknown,
        None => FrameKind::Empty,
    }
}
