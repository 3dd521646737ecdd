//! Call Session Facade
//!
//! Verbindet die Render-Flächen der UI für genau einen Anruf mit dem
//! Coordinator. Reihenfolge beim Öffnen: Surfaces initialisieren, Media
//! vorbereiten, dann `views_ready`. Beim Beenden werden die Surfaces erst
//! freigegeben, nachdem der Coordinator die Peer Connection geschlossen hat.

use super::coordinator::{CallCoordinator, CallError};
use crate::media::RenderSurface;
use crate::signaling::{SignalEvent, SignalKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Wer das Offer erzeugt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

/// Lokale Preview und Remote-Video eines Anrufs
struct Surfaces {
    local: Arc<dyn RenderSurface>,
    remote: Arc<dyn RenderSurface>,
    released: AtomicBool,
}

impl Surfaces {
    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.local.release();
        self.remote.release();
    }
}

pub struct CallSession {
    coordinator: CallCoordinator,
    target: String,
    surfaces: Arc<Surfaces>,
    /// Gesetzt sobald der Anruf lokal oder remote beendet wurde
    ended: Arc<AtomicBool>,
    call_ended: watch::Receiver<bool>,
    ended_tx: Arc<watch::Sender<bool>>,
    mic_muted: AtomicBool,
    watcher: JoinHandle<()>,
}

impl CallSession {
    /// Öffnet den Anruf mit `target`, der im Coordinator bereits gesetzt
    /// sein muss (ausgehend oder eingehend).
    pub async fn open(
        coordinator: CallCoordinator,
        target: &str,
        role: CallRole,
        local: Arc<dyn RenderSurface>,
        remote: Arc<dyn RenderSurface>,
    ) -> Result<Self, CallError> {
        // Vor prepare_media abonnieren, damit kein EndCall verloren geht
        let events = coordinator.subscribe();

        let surfaces = Arc::new(Surfaces {
            local: local.clone(),
            remote: remote.clone(),
            released: AtomicBool::new(false),
        });
        local.init(true);
        remote.init(false);

        if let Err(e) = coordinator.prepare_media(target, local, remote).await {
            surfaces.release();
            return Err(e);
        }

        let ready = async {
            coordinator.views_ready().await?;
            if role == CallRole::Caller {
                coordinator.start_call().await?;
            }
            Ok::<_, CallError>(())
        }
        .await;

        if let Err(e) = ready {
            tracing::error!("Failed to open call with {}: {}", target, e);
            if let Err(end_err) = coordinator.end_call().await {
                tracing::warn!("Failed to end call: {}", end_err);
            }
            surfaces.release();
            return Err(e);
        }

        let ended = Arc::new(AtomicBool::new(false));
        let (ended_tx, call_ended) = watch::channel(false);
        let ended_tx = Arc::new(ended_tx);

        let watcher = tokio::spawn(watch_for_end(
            events,
            target.to_string(),
            surfaces.clone(),
            ended.clone(),
            ended_tx.clone(),
        ));

        tracing::info!("Call session with {} open ({:?})", target, role);

        Ok(Self {
            coordinator,
            target: target.to_string(),
            surfaces,
            ended,
            call_ended,
            ended_tx,
            mic_muted: AtomicBool::new(false),
            watcher,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Wird `true` sobald der Anruf vorbei ist
    pub fn call_ended(&self) -> watch::Receiver<bool> {
        self.call_ended.clone()
    }

    pub fn is_ended(&self) -> bool {
        *self.call_ended.borrow()
    }

    /// Legt auf. Mehrfache Aufrufe sind ein No-op.
    pub async fn end_call(&self) -> Result<(), CallError> {
        if self.ended.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let result = self.coordinator.end_call().await;
        self.surfaces.release();
        self.ended_tx.send_replace(true);
        result
    }

    /// Schaltet das Mikrofon um, gibt den neuen Mute-Status zurück
    pub async fn toggle_mic(&self) -> Result<bool, CallError> {
        let muted = !self.mic_muted.load(Ordering::SeqCst);
        self.coordinator.set_audio_enabled(!muted).await?;
        self.mic_muted.store(muted, Ordering::SeqCst);
        Ok(muted)
    }

    pub fn is_mic_muted(&self) -> bool {
        self.mic_muted.load(Ordering::SeqCst)
    }

    pub async fn switch_camera(&self) -> Result<(), CallError> {
        self.coordinator.switch_camera().await
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            self.watcher.abort();
            return;
        }

        // Screen geschlossen ohne Auflegen: Anruf im Hintergrund beenden,
        // der Watcher gibt die Surfaces danach frei
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let coordinator = self.coordinator.clone();
                handle.spawn(async move {
                    if let Err(e) = coordinator.end_call().await {
                        tracing::warn!("Failed to end call on drop: {}", e);
                    }
                });
            }
            Err(_) => {
                tracing::warn!("Call session with {} dropped outside a runtime", self.target);
                self.watcher.abort();
            }
        }
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("target", &self.target)
            .field("ended", &self.is_ended())
            .field("mic_muted", &self.is_mic_muted())
            .finish()
    }
}

/// Wartet auf das veröffentlichte EndCall dieses Anrufs
async fn watch_for_end(
    mut events: broadcast::Receiver<SignalEvent>,
    target: String,
    surfaces: Arc<Surfaces>,
    ended: Arc<AtomicBool>,
    ended_tx: Arc<watch::Sender<bool>>,
) {
    loop {
        match events.recv().await {
            Ok(event) if is_end_of(&event, &target) => {
                tracing::debug!("Call with {} ended: {}", target, event);
                break;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Call session lagged behind by {} events", n);
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::debug!("Coordinator gone, closing call session");
                break;
            }
        }
    }

    ended.store(true, Ordering::SeqCst);
    surfaces.release();
    ended_tx.send_replace(true);
}

fn is_end_of(event: &SignalEvent, target: &str) -> bool {
    event.kind == SignalKind::EndCall && (event.sender == target || event.target == target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::testing::{coordinator, wait_for, wait_until, NullSurface};
    use crate::call::PhaseKind;
    use crate::signaling::{CallMedia, SqliteMailboxStore};
    use std::time::Duration;

    fn surface() -> Arc<NullSurface> {
        Arc::new(NullSurface::default())
    }

    async fn ended(session: &CallSession) {
        let mut rx = session.call_ended();
        tokio::time::timeout(Duration::from_secs(3), rx.wait_for(|ended| *ended))
            .await
            .expect("call_ended never flipped")
            .unwrap();
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let store = Arc::new(SqliteMailboxStore::open_in_memory().unwrap());
        let alice = coordinator(&store, "alice").await;
        let bob = coordinator(&store, "bob").await;

        alice
            .coordinator
            .send_call_request("bob", CallMedia::Video)
            .await
            .unwrap();
        wait_until(&bob.coordinator, |s| s.phase == PhaseKind::AwaitingPeer).await;

        let (bob_local, bob_remote) = (surface(), surface());
        let bob_session = CallSession::open(
            bob.coordinator.clone(),
            "alice",
            CallRole::Callee,
            bob_local.clone(),
            bob_remote.clone(),
        )
        .await
        .unwrap();

        let (alice_local, alice_remote) = (surface(), surface());
        let alice_session = CallSession::open(
            alice.coordinator.clone(),
            "bob",
            CallRole::Caller,
            alice_local.clone(),
            alice_remote.clone(),
        )
        .await
        .unwrap();

        assert_eq!(alice_local.inits.load(Ordering::SeqCst), 1);
        assert!(alice_local.mirrored.load(Ordering::SeqCst));
        assert!(!alice_remote.mirrored.load(Ordering::SeqCst));

        let alice_peer = alice.factory.peer(0);
        wait_for(|| alice_peer.has("remote Answer answer-sdp")).await;
        assert!(bob.factory.peer(0).has("remote Offer offer-sdp"));

        alice_session.end_call().await.unwrap();
        assert!(alice_session.is_ended());
        assert_eq!(alice_peer.closes(), 1);
        assert_eq!(alice_local.releases.load(Ordering::SeqCst), 1);

        ended(&bob_session).await;
        assert_eq!(bob_local.releases.load(Ordering::SeqCst), 1);
        assert_eq!(bob_remote.releases.load(Ordering::SeqCst), 1);
        assert_eq!(bob.factory.peer(0).closes(), 1);

        // Zweites Auflegen ändert nichts mehr
        alice_session.end_call().await.unwrap();
        bob_session.end_call().await.unwrap();
        assert_eq!(alice_peer.closes(), 1);
        assert_eq!(alice_local.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_toggle_mic_and_switch_camera() {
        let store = Arc::new(SqliteMailboxStore::open_in_memory().unwrap());
        let alice = coordinator(&store, "alice").await;

        alice
            .coordinator
            .send_call_request("bob", CallMedia::Audio)
            .await
            .unwrap();
        let session = CallSession::open(
            alice.coordinator.clone(),
            "bob",
            CallRole::Caller,
            surface(),
            surface(),
        )
        .await
        .unwrap();
        let peer = alice.factory.peer(0);

        assert!(session.toggle_mic().await.unwrap());
        assert!(session.is_mic_muted());
        assert!(!peer.audio_enabled());

        assert!(!session.toggle_mic().await.unwrap());
        assert!(peer.audio_enabled());

        session.switch_camera().await.unwrap();
        assert!(peer.has("switch camera"));
    }

    #[tokio::test]
    async fn test_open_without_call_releases_surfaces() {
        let store = Arc::new(SqliteMailboxStore::open_in_memory().unwrap());
        let alice = coordinator(&store, "alice").await;
        let (local, remote) = (surface(), surface());

        let result = CallSession::open(
            alice.coordinator.clone(),
            "bob",
            CallRole::Caller,
            local.clone(),
            remote.clone(),
        )
        .await;

        assert!(matches!(result, Err(CallError::NoActiveCall)));
        assert_eq!(local.releases.load(Ordering::SeqCst), 1);
        assert_eq!(remote.releases.load(Ordering::SeqCst), 1);
        assert_eq!(alice.factory.created(), 0);
    }

    #[tokio::test]
    async fn test_drop_ends_call() {
        let store = Arc::new(SqliteMailboxStore::open_in_memory().unwrap());
        let alice = coordinator(&store, "alice").await;
        let bob = coordinator(&store, "bob").await;

        alice
            .coordinator
            .send_call_request("bob", CallMedia::Video)
            .await
            .unwrap();
        wait_until(&bob.coordinator, |s| s.phase == PhaseKind::AwaitingPeer).await;

        let local = surface();
        let session = CallSession::open(
            alice.coordinator.clone(),
            "bob",
            CallRole::Caller,
            local.clone(),
            surface(),
        )
        .await
        .unwrap();
        drop(session);

        wait_until(&alice.coordinator, |s| s.phase == PhaseKind::Idle).await;
        wait_until(&bob.coordinator, |s| s.phase == PhaseKind::Idle).await;
        wait_for(|| local.releases.load(Ordering::SeqCst) == 1).await;
    }
}
