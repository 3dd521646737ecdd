//! Kamera-Abstraktion
//!
//! Kamerazugriff und VP8-Encoding liefert der Host. Hier liegt nur die
//! Auswahl-Policy: Frontkamera, sonst die erste verfügbare.

use super::types::{MediaError, VideoFrame};
use crate::config::CaptureConfig;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraFacing {
    Front,
    Back,
    External,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraInfo {
    pub id: String,
    pub name: String,
    pub facing: CameraFacing,
}

/// Listet und öffnet Kameras
pub trait CameraEnumerator: Send + Sync {
    fn cameras(&self) -> Vec<CameraInfo>;

    fn open(
        &self,
        camera: &CameraInfo,
        format: CaptureConfig,
    ) -> Result<Box<dyn VideoCapturer>, MediaError>;
}

/// Eine geöffnete Kamera, die kodierte Frames in einen Channel schreibt
pub trait VideoCapturer: Send {
    fn start(&mut self, sink: mpsc::Sender<VideoFrame>) -> Result<(), MediaError>;

    fn stop(&mut self);
}

/// Frontkamera bevorzugt, sonst die erste
pub fn select_camera(cameras: &[CameraInfo]) -> Result<CameraInfo, MediaError> {
    cameras
        .iter()
        .find(|c| c.facing == CameraFacing::Front)
        .or_else(|| cameras.first())
        .cloned()
        .ok_or(MediaError::NoCamera)
}

/// Kamera für `switch_camera`: andere Ausrichtung, sonst die nächste in
/// der Liste. `None` wenn es nur eine gibt.
pub fn next_camera(cameras: &[CameraInfo], current: &CameraInfo) -> Option<CameraInfo> {
    if let Some(other) = cameras
        .iter()
        .find(|c| c.facing != current.facing && c.id != current.id)
    {
        return Some(other.clone());
    }

    let pos = cameras.iter().position(|c| c.id == current.id)?;
    let next = &cameras[(pos + 1) % cameras.len()];
    (next.id != current.id).then(|| next.clone())
}
