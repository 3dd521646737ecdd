//! Media Module - WebRTC und Capture
//!
//! Dieses Modul verwaltet:
//! - WebRTC Peer Connections (eine pro Anruf)
//! - Audio Capture/Playback über cpal, PCMU auf dem Track
//! - Kamera-Auswahl (Geräte liefert der Host)

mod audio;
mod capture;
mod peer;
mod types;

pub use audio::{
    decode_payload, encode_frame, linear_to_ulaw, ulaw_to_linear, AudioBackend, AudioDevice,
    AudioError, CallAudio, CpalAudio, FRAME_SIZE, PCMU_FRAME_SIZE, PCMU_RATE, SAMPLE_RATE,
};
pub use capture::{
    next_camera, select_camera, CameraEnumerator, CameraFacing, CameraInfo, VideoCapturer,
};
pub use peer::{WebRtcMediaFactory, WebRtcPeer};
pub use types::{
    IceCandidate, LinkState, MediaError, MediaFactory, MediaKind, MediaSession, PeerEvent,
    PeerEventSink, RenderSurface, SdpKind, VideoFrame,
};
