//! WebRTC Peer
//!
//! [`MediaSession`] auf Basis von webrtc-rs:
//! - Audio-Track (PCMU) aus dem Mikrofon, Video-Track (VP8) von der Kamera
//! - Remote-Audio auf den Lautsprecher, Remote-Video auf die Surface
//! - ICE Candidates vor der Remote Description werden gepuffert

use super::audio::{decode_payload, encode_frame, AudioBackend, CallAudio, PCMU_RATE};
use super::capture::{next_camera, select_camera, CameraEnumerator, CameraInfo, VideoCapturer};
use super::types::{
    IceCandidate, LinkState, MediaError, MediaFactory, MediaKind, MediaSession, PeerEvent,
    PeerEventSink, RenderSurface, SdpKind, VideoFrame,
};
use crate::config::{CaptureConfig, IceServerConfig};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::codecs::vp8::Vp8Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Ein PCMU-Frame
const AUDIO_FRAME: Duration = Duration::from_millis(20);

const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Puffer zwischen Kamera und Video-Track
const FRAME_QUEUE: usize = 8;

fn webrtc_err(e: webrtc::Error) -> MediaError {
    MediaError::WebRtc(e.to_string())
}

// ============================================================================
// CONVERSIONS
// ============================================================================

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

fn to_rtc_ice_server(server: &IceServerConfig) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone(),
        credential: server.credential.clone(),
        ..Default::default()
    }
}

fn link_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => LinkState::New,
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
    }
}

// ============================================================================
// STATE
// ============================================================================

/// Ziele für eingehende Tracks (werden ggf. erst später gesetzt)
#[derive(Default)]
struct RemoteSinks {
    surface: RwLock<Option<Arc<dyn RenderSurface>>>,
    audio: RwLock<Option<Arc<dyn CallAudio>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Default)]
struct LocalMedia {
    camera: Option<CameraInfo>,
    capturer: Option<Box<dyn VideoCapturer>>,
    frames: Option<mpsc::Sender<VideoFrame>>,
    audio: Option<Arc<dyn CallAudio>>,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct CandidateQueue {
    remote_set: bool,
    pending: Vec<RTCIceCandidateInit>,
}

// ============================================================================
// WEBRTC PEER
// ============================================================================

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    cameras: Arc<dyn CameraEnumerator>,
    capture: CaptureConfig,
    audio: Arc<dyn AudioBackend>,
    audio_track: Arc<TrackLocalStaticSample>,
    video_track: Arc<TrackLocalStaticSample>,
    local: Mutex<LocalMedia>,
    remote: Arc<RemoteSinks>,
    candidates: AsyncMutex<CandidateQueue>,
    audio_enabled: AtomicBool,
    closed: AtomicBool,
}

impl WebRtcPeer {
    /// Erstellt die Peer Connection mit Audio- und Video-Track
    pub async fn connect(
        ice_servers: &[IceServerConfig],
        events: PeerEventSink,
        cameras: Arc<dyn CameraEnumerator>,
        capture: CaptureConfig,
        audio: Arc<dyn AudioBackend>,
    ) -> Result<Self, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(webrtc_err)?);

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: PCMU_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_owned(),
            "skycall".to_owned(),
        ));
        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: VIDEO_CLOCK_RATE,
                ..Default::default()
            },
            "video".to_owned(),
            "skycall".to_owned(),
        ));

        let remote = Arc::new(RemoteSinks::default());

        for track in [
            Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>,
            Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>,
        ] {
            let sender = pc.add_track(track).await.map_err(webrtc_err)?;
            remote.tasks.lock().push(spawn_rtcp_reader(sender));
        }

        register_handlers(&pc, events, Arc::clone(&remote));

        tracing::debug!("Peer connection created");

        Ok(Self {
            pc,
            cameras,
            capture,
            audio,
            audio_track,
            video_track,
            local: Mutex::new(LocalMedia::default()),
            remote,
            candidates: AsyncMutex::new(CandidateQueue::default()),
            audio_enabled: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MediaError::Closed)
        } else {
            Ok(())
        }
    }

    /// Stoppt Capture, Pumps und Remote-Tasks
    fn release_media(&self) {
        let local = std::mem::take(&mut *self.local.lock());
        if let Some(mut capturer) = local.capturer {
            capturer.stop();
        }
        for task in local.tasks {
            task.abort();
        }
        if let Some(audio) = local.audio {
            audio.stop();
        }

        for task in self.remote.tasks.lock().drain(..) {
            task.abort();
        }
        *self.remote.audio.write() = None;
        *self.remote.surface.write() = None;
    }
}

/// RTCP muss gelesen werden, sonst laufen die Interceptors nicht
fn spawn_rtcp_reader(sender: Arc<RTCRtpSender>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
    })
}

fn register_handlers(pc: &Arc<RTCPeerConnection>, events: PeerEventSink, remote: Arc<RemoteSinks>) {
    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);
        sink.emit(PeerEvent::ConnectionState(link_state(s)));
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => sink.emit(PeerEvent::IceCandidate(init.into())),
                Err(e) => tracing::warn!("Failed to serialize local ICE candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        sink.emit(PeerEvent::NegotiationNeeded);
        Box::pin(async {})
    }));

    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Audio => MediaKind::Audio,
            _ => MediaKind::Video,
        };
        tracing::info!("Received remote {:?} track", kind);
        events.emit(PeerEvent::RemoteTrack(kind));

        let handle = match kind {
            MediaKind::Audio => tokio::spawn(play_remote_audio(track, Arc::clone(&remote))),
            MediaKind::Video => tokio::spawn(render_remote_video(track, Arc::clone(&remote))),
        };
        remote.tasks.lock().push(handle);

        Box::pin(async {})
    }));
}

// ============================================================================
// PUMPS
// ============================================================================

async fn play_remote_audio(track: Arc<TrackRemote>, remote: Arc<RemoteSinks>) {
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                if packet.payload.is_empty() {
                    continue;
                }
                let audio = remote.audio.read().clone();
                if let Some(audio) = audio {
                    audio.write_samples(&decode_payload(&packet.payload));
                }
            }
            Err(e) => {
                tracing::debug!("Remote audio track ended: {}", e);
                break;
            }
        }
    }
}

async fn render_remote_video(track: Arc<TrackRemote>, remote: Arc<RemoteSinks>) {
    let mut builder = SampleBuilder::new(128, Vp8Packet::default(), VIDEO_CLOCK_RATE);
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                builder.push(packet);
                while let Some(sample) = builder.pop() {
                    let surface = remote.surface.read().clone();
                    if let Some(surface) = surface {
                        surface.render(&VideoFrame {
                            data: sample.data.to_vec(),
                            duration: sample.duration,
                        });
                    }
                }
            }
            Err(e) => {
                tracing::debug!("Remote video track ended: {}", e);
                break;
            }
        }
    }
}

/// Kamera-Frames auf Preview und Video-Track
async fn pump_video(
    mut frames: mpsc::Receiver<VideoFrame>,
    surface: Arc<dyn RenderSurface>,
    track: Arc<TrackLocalStaticSample>,
) {
    while let Some(frame) = frames.recv().await {
        surface.render(&frame);
        let sample = Sample {
            data: frame.data.into(),
            duration: frame.duration,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            tracing::trace!("Failed to write video sample: {}", e);
        }
    }
}

/// Mikrofon alle 20ms auf den Audio-Track
async fn pump_audio(audio: Arc<dyn CallAudio>, track: Arc<TrackLocalStaticSample>) {
    let mut ticker = tokio::time::interval(AUDIO_FRAME);
    loop {
        ticker.tick().await;
        while let Some(frame) = audio.read_frame() {
            let sample = Sample {
                data: encode_frame(&frame).into(),
                duration: AUDIO_FRAME,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                tracing::trace!("Failed to write audio sample: {}", e);
            }
        }
    }
}

// ============================================================================
// MEDIA SESSION
// ============================================================================

#[async_trait]
impl MediaSession for WebRtcPeer {
    async fn attach_local_media(&self, surface: Arc<dyn RenderSurface>) -> Result<(), MediaError> {
        self.ensure_open()?;
        if self.local.lock().camera.is_some() {
            tracing::warn!("Local media already attached");
            return Ok(());
        }

        let camera = select_camera(&self.cameras.cameras())?;
        let mut capturer = self.cameras.open(&camera, self.capture)?;
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
        capturer.start(frame_tx.clone())?;

        let backend = Arc::clone(&self.audio);
        let audio = match tokio::task::spawn_blocking(move || backend.open()).await {
            Ok(Ok(audio)) => audio,
            Ok(Err(e)) => {
                capturer.stop();
                return Err(e.into());
            }
            Err(e) => {
                capturer.stop();
                return Err(MediaError::Capture(e.to_string()));
            }
        };
        audio.set_muted(!self.audio_enabled.load(Ordering::SeqCst));

        // close() kann während des Audio-Starts gelaufen sein
        if self.closed.load(Ordering::SeqCst) {
            capturer.stop();
            audio.stop();
            return Err(MediaError::Closed);
        }

        *self.remote.audio.write() = Some(Arc::clone(&audio));

        let video_task = tokio::spawn(pump_video(frame_rx, surface, Arc::clone(&self.video_track)));
        let audio_task = tokio::spawn(pump_audio(Arc::clone(&audio), Arc::clone(&self.audio_track)));

        tracing::info!(
            "Local media attached: {} ({}x{} @ {}fps)",
            camera.name,
            self.capture.width,
            self.capture.height,
            self.capture.fps
        );

        let mut local = self.local.lock();
        local.camera = Some(camera);
        local.capturer = Some(capturer);
        local.frames = Some(frame_tx);
        local.audio = Some(audio);
        local.tasks = vec![video_task, audio_task];
        Ok(())
    }

    async fn attach_remote_surface(
        &self,
        surface: Arc<dyn RenderSurface>,
    ) -> Result<(), MediaError> {
        self.ensure_open()?;
        *self.remote.surface.write() = Some(surface);
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, MediaError> {
        self.ensure_open()?;
        let offer = self.pc.create_offer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(webrtc_err)?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, MediaError> {
        self.ensure_open()?;
        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(webrtc_err)?;
        Ok(answer.sdp)
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), MediaError> {
        self.ensure_open()?;
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp),
            SdpKind::Answer => RTCSessionDescription::answer(sdp),
        }
        .map_err(|e| MediaError::InvalidSdp(e.to_string()))?;

        let mut queue = self.candidates.lock().await;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(webrtc_err)?;
        queue.remote_set = true;

        let pending = std::mem::take(&mut queue.pending);
        if !pending.is_empty() {
            tracing::debug!("Applying {} buffered ICE candidates", pending.len());
        }
        for candidate in pending {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                tracing::warn!("Buffered ICE candidate rejected: {}", e);
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.ensure_open()?;
        let mut queue = self.candidates.lock().await;
        if !queue.remote_set {
            queue.pending.push(candidate.into());
            tracing::debug!("Buffered ICE candidate ({} pending)", queue.pending.len());
            return Ok(());
        }
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(webrtc_err)
    }

    async fn close(&self) -> Result<(), MediaError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.release_media();
        self.candidates.lock().await.pending.clear();
        self.pc.close().await.map_err(webrtc_err)?;

        tracing::info!("Peer connection closed");
        Ok(())
    }

    async fn switch_camera(&self) -> Result<(), MediaError> {
        self.ensure_open()?;
        let (current, frames) = {
            let local = self.local.lock();
            (local.camera.clone(), local.frames.clone())
        };
        let (Some(current), Some(frames)) = (current, frames) else {
            return Err(MediaError::Capture("local media not attached".to_string()));
        };

        let Some(next) = next_camera(&self.cameras.cameras(), &current) else {
            tracing::info!("Only one camera available, not switching");
            return Ok(());
        };

        let mut capturer = self.cameras.open(&next, self.capture)?;
        capturer.start(frames)?;
        tracing::info!("Switched camera to {}", next.name);

        let old = {
            let mut local = self.local.lock();
            local.camera = Some(next);
            local.capturer.replace(capturer)
        };
        if let Some(mut old) = old {
            old.stop();
        }
        Ok(())
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::SeqCst);
        if let Some(audio) = self.local.lock().audio.as_ref() {
            audio.set_muted(!enabled);
        }
    }
}

impl Drop for WebRtcPeer {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            self.release_media();
        }
    }
}

impl std::fmt::Debug for WebRtcPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcPeer")
            .field("camera", &self.local.lock().camera)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erzeugt [`WebRtcPeer`]s mit den Kameras des Hosts
pub struct WebRtcMediaFactory {
    cameras: Arc<dyn CameraEnumerator>,
    capture: CaptureConfig,
    audio: Arc<dyn AudioBackend>,
}

impl WebRtcMediaFactory {
    pub fn new(
        cameras: Arc<dyn CameraEnumerator>,
        capture: CaptureConfig,
        audio: Arc<dyn AudioBackend>,
    ) -> Self {
        Self {
            cameras,
            capture,
            audio,
        }
    }
}

#[async_trait]
impl MediaFactory for WebRtcMediaFactory {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
        events: PeerEventSink,
    ) -> Result<Arc<dyn MediaSession>, MediaError> {
        let peer = WebRtcPeer::connect(
            ice_servers,
            events,
            Arc::clone(&self.cameras),
            self.capture,
            Arc::clone(&self.audio),
        )
        .await?;
        Ok(Arc::new(peer))
    }
}

// ============================================================================
// TESTS
// ============================================================================
