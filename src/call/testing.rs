//! Test-Hilfen: Mock-Media und mehrere Geräte auf einem gemeinsamen Store

use super::coordinator::CallCoordinator;
use super::state::CallSnapshot;
use crate::config::{CoordinatorConfig, IceServerConfig};
use crate::identity::SessionIdentity;
use crate::media::{
    IceCandidate, MediaError, MediaFactory, MediaSession, PeerEventSink, RenderSurface, SdpKind,
    VideoFrame,
};
use crate::signaling::{SignalingTransport, SqliteMailboxStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Zeichnet alle Aufrufe auf
#[derive(Default)]
pub struct MockPeer {
    log: Mutex<Vec<String>>,
    closes: AtomicUsize,
    fail_offer: bool,
    audio_enabled: AtomicBool,
}

impl MockPeer {
    fn record(&self, entry: String) {
        self.log.lock().push(entry);
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    /// Nur die Aufrufe, die aus Signaling-Events stammen
    pub fn negotiation_log(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|e| e.starts_with("remote ") || e.starts_with("ice "))
            .collect()
    }

    pub fn has(&self, entry: &str) -> bool {
        self.count(entry) > 0
    }

    pub fn count(&self, entry: &str) -> usize {
        self.log.lock().iter().filter(|e| *e == entry).count()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSession for MockPeer {
    async fn attach_local_media(&self, _surface: Arc<dyn RenderSurface>) -> Result<(), MediaError> {
        self.record("attach local".to_string());
        Ok(())
    }

    async fn attach_remote_surface(
        &self,
        _surface: Arc<dyn RenderSurface>,
    ) -> Result<(), MediaError> {
        self.record("attach remote".to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, MediaError> {
        self.record("create_offer".to_string());
        if self.fail_offer {
            return Err(MediaError::WebRtc("offer rejected".to_string()));
        }
        Ok("offer-sdp".to_string())
    }

    async fn create_answer(&self) -> Result<String, MediaError> {
        self.record("create_answer".to_string());
        Ok("answer-sdp".to_string())
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), MediaError> {
        self.record(format!("remote {:?} {}", kind, sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.record(format!("ice {}", candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.record("close".to_string());
        Ok(())
    }

    async fn switch_camera(&self) -> Result<(), MediaError> {
        self.record("switch camera".to_string());
        Ok(())
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::SeqCst);
    }
}

/// Liefert [`MockPeer`]s und merkt sich deren Event-Sinks
#[derive(Default)]
pub struct MockFactory {
    peers: Mutex<Vec<Arc<MockPeer>>>,
    sinks: Mutex<Vec<PeerEventSink>>,
    fail_offer: AtomicBool,
}

impl MockFactory {
    pub fn fail_offers(&self) {
        self.fail_offer.store(true, Ordering::SeqCst);
    }

    pub fn peer(&self, index: usize) -> Arc<MockPeer> {
        self.peers.lock()[index].clone()
    }

    pub fn sink(&self, index: usize) -> PeerEventSink {
        self.sinks.lock()[index].clone()
    }

    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }
}

#[async_trait]
impl MediaFactory for MockFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServerConfig],
        events: PeerEventSink,
    ) -> Result<Arc<dyn MediaSession>, MediaError> {
        let peer = Arc::new(MockPeer {
            fail_offer: self.fail_offer.load(Ordering::SeqCst),
            audio_enabled: AtomicBool::new(true),
            ..Default::default()
        });
        self.peers.lock().push(peer.clone());
        self.sinks.lock().push(events);
        Ok(peer)
    }
}

#[derive(Default)]
pub struct NullSurface {
    pub inits: AtomicUsize,
    pub mirrored: AtomicBool,
    pub releases: AtomicUsize,
}

impl RenderSurface for NullSurface {
    fn init(&self, mirror: bool) {
        self.inits.fetch_add(1, Ordering::SeqCst);
        self.mirrored.store(mirror, Ordering::SeqCst);
    }

    fn render(&self, _frame: &VideoFrame) {}

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Ein Gerät: Coordinator plus seine Mock-Factory
pub struct Device {
    pub coordinator: CallCoordinator,
    pub factory: Arc<MockFactory>,
}

pub async fn coordinator(store: &Arc<SqliteMailboxStore>, user: &str) -> Device {
    coordinator_with(store, user, CoordinatorConfig::default()).await
}

pub async fn coordinator_with(
    store: &Arc<SqliteMailboxStore>,
    user: &str,
    config: CoordinatorConfig,
) -> Device {
    let transport = SignalingTransport::new(store.clone(), Arc::new(SessionIdentity::new(user)));
    let factory = Arc::new(MockFactory::default());
    let coordinator = CallCoordinator::start(transport, factory.clone(), Vec::new(), config)
        .await
        .unwrap();
    Device {
        coordinator,
        factory,
    }
}

pub fn candidate(name: &str) -> IceCandidate {
    IceCandidate {
        candidate: name.to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

const WAIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Pollt bis `cond` wahr ist
pub async fn wait_for(cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Pollt den Snapshot bis `cond` wahr ist
pub async fn wait_until(
    coordinator: &CallCoordinator,
    cond: impl Fn(&CallSnapshot) -> bool,
) -> CallSnapshot {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        let snapshot = coordinator.snapshot().await.unwrap();
        if cond(&snapshot) {
            return snapshot;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "coordinator never reached expected state: {:?}",
            snapshot
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
