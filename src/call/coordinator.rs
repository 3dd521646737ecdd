//! Signaling Coordinator
//!
//! Die Call-Zustandsmaschine als Actor: ein Task besitzt den Zustand und
//! verarbeitet nacheinander
//! - Befehle der UI (über [`CallCoordinator`])
//! - eingehende Events aus der eigenen Mailbox
//! - Callbacks der Peer Connection
//! - fertige SDP-Erzeugungen (laufen in eigenen Tasks)
//!
//! Offer/Answer/ICE, die ankommen bevor die UI bereit ist, werden
//! gepuffert und nach `views_ready()` in Ankunftsreihenfolge verarbeitet.

use super::state::{CallDirection, CallInfo, CallPhase, CallSnapshot, CallStatus};
use crate::config::{CoordinatorConfig, IceServerConfig};
use crate::media::{
    IceCandidate, LinkState, MediaError, MediaFactory, MediaSession, PeerEvent, PeerEventSink,
    RenderSurface, SdpKind,
};
use crate::signaling::{CallMedia, SignalEvent, SignalKind, SignalingError, SignalingTransport};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

/// Kapazität des Command-Channels
const COMMAND_BUFFER: usize = 32;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Already in a call with {0}")]
    AlreadyInCall(String),

    #[error("No active call")]
    NoActiveCall,

    #[error("Call is with {expected}, not {actual}")]
    TargetMismatch { expected: String, actual: String },

    #[error("Invalid call target: {0:?}")]
    InvalidTarget(String),

    #[error("Media not prepared for this call")]
    MediaNotPrepared,

    #[error("Media negotiation failed: {0}")]
    MediaNegotiationFailed(MediaError),

    #[error("Peer connection failed")]
    ConnectionFailed,

    #[error("Peer did not answer in time")]
    AwaitPeerTimeout,

    #[error("Signaling error: {0}")]
    Transport(#[from] SignalingError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Call coordinator stopped")]
    CoordinatorStopped,
}

// ============================================================================
// COMMANDS
// ============================================================================

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

enum Command {
    SendCallRequest {
        target: String,
        media: CallMedia,
        reply: Reply<()>,
    },
    PrepareMedia {
        target: String,
        local: Arc<dyn RenderSurface>,
        remote: Arc<dyn RenderSurface>,
        reply: Reply<()>,
    },
    ViewsReady {
        reply: Reply<()>,
    },
    StartCall {
        reply: Reply<()>,
    },
    EndCall {
        reply: Reply<()>,
    },
    SwitchCamera {
        reply: Reply<()>,
    },
    SetAudioEnabled {
        enabled: bool,
        reply: Reply<()>,
    },
    Snapshot {
        reply: Reply<CallSnapshot>,
    },
    Shutdown,
}

/// Ergebnis einer SDP-Erzeugung
struct SdpCompletion {
    epoch: u64,
    kind: SdpKind,
    result: Result<String, MediaError>,
}

// ============================================================================
// HANDLE
// ============================================================================

/// Handle auf den Coordinator-Task. Günstig zu klonen.
#[derive(Clone)]
pub struct CallCoordinator {
    local_id: String,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SignalEvent>,
    status: watch::Receiver<CallStatus>,
}

impl CallCoordinator {
    /// Abonniert die eigene Mailbox und startet den Coordinator-Task
    pub async fn start(
        transport: SignalingTransport,
        factory: Arc<dyn MediaFactory>,
        ice_servers: Vec<IceServerConfig>,
        config: CoordinatorConfig,
    ) -> Result<Self, CallError> {
        let transport = transport.with_inbound_buffer(config.inbound_buffer);
        let local_id = transport.local_id()?;
        let inbound = transport.subscribe().await?;

        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let (status_tx, status) = watch::channel(CallStatus::Idle);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (sdp_tx, sdp_rx) = mpsc::unbounded_channel();

        let actor = Actor {
            local_id: local_id.clone(),
            transport,
            factory,
            ice_servers,
            config,
            phase: CallPhase::Idle,
            peer: None,
            epoch: 0,
            deadline: None,
            events: events.clone(),
            status: status_tx,
            peer_tx,
            sdp_tx,
        };

        tokio::spawn(actor.run(command_rx, inbound, peer_rx, sdp_rx));
        tracing::info!("Call coordinator started for {}", local_id);

        Ok(Self {
            local_id,
            commands,
            events,
            status,
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Veröffentlichte Events (CallStart und EndCall)
    pub fn subscribe(&self) -> broadcast::Receiver<SignalEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<CallStatus> {
        self.status.clone()
    }

    pub fn current_status(&self) -> CallStatus {
        self.status.borrow().clone()
    }

    /// Ausgehender Anruf: setzt das Target und schickt `CallStart`
    pub async fn send_call_request(&self, target: &str, media: CallMedia) -> Result<(), CallError> {
        let target = target.to_string();
        self.request(|reply| Command::SendCallRequest {
            target,
            media,
            reply,
        })
        .await
    }

    /// Erstellt die Peer Connection des Anrufs und hängt die Surfaces an
    pub async fn prepare_media(
        &self,
        target: &str,
        local: Arc<dyn RenderSurface>,
        remote: Arc<dyn RenderSurface>,
    ) -> Result<(), CallError> {
        let target = target.to_string();
        self.request(|reply| Command::PrepareMedia {
            target,
            local,
            remote,
            reply,
        })
        .await
    }

    /// UI ist bereit: gepufferte Events werden verarbeitet
    pub async fn views_ready(&self) -> Result<(), CallError> {
        self.request(|reply| Command::ViewsReady { reply }).await
    }

    /// Erzeugt das Offer (nur Anrufer)
    pub async fn start_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::StartCall { reply }).await
    }

    /// Beendet bzw. lehnt den Anruf ab. In jedem Zustand erlaubt.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::EndCall { reply }).await
    }

    pub async fn switch_camera(&self) -> Result<(), CallError> {
        self.request(|reply| Command::SwitchCamera { reply }).await
    }

    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.request(|reply| Command::SetAudioEnabled { enabled, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<CallSnapshot, CallError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Beendet einen laufenden Anruf und stoppt den Task
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| CallError::CoordinatorStopped)?;
        rx.await.map_err(|_| CallError::CoordinatorStopped)?
    }
}

impl std::fmt::Debug for CallCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallCoordinator")
            .field("local_id", &self.local_id)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

// ============================================================================
// ACTOR
// ============================================================================

struct Actor {
    local_id: String,
    transport: SignalingTransport,
    factory: Arc<dyn MediaFactory>,
    ice_servers: Vec<IceServerConfig>,
    config: CoordinatorConfig,

    phase: CallPhase,
    /// Peer Connection des aktuellen Anrufs
    peer: Option<Arc<dyn MediaSession>>,
    epoch: u64,
    /// Ende der Wartezeit in `AwaitingPeer`
    deadline: Option<Instant>,

    events: broadcast::Sender<SignalEvent>,
    status: watch::Sender<CallStatus>,
    peer_tx: mpsc::UnboundedSender<(u64, PeerEvent)>,
    sdp_tx: mpsc::UnboundedSender<SdpCompletion>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut inbound: mpsc::Receiver<SignalEvent>,
        mut peer_rx: mpsc::UnboundedReceiver<(u64, PeerEvent)>,
        mut sdp_rx: mpsc::UnboundedReceiver<SdpCompletion>,
    ) {
        let mut inbound_open = true;

        loop {
            let deadline = self.deadline;
            let timeout = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                event = inbound.recv(), if inbound_open => match event {
                    Some(event) => self.handle_inbound(event).await,
                    None => {
                        tracing::warn!("Mailbox subscription closed, no more inbound events");
                        inbound_open = false;
                    }
                },
                Some((epoch, event)) = peer_rx.recv() => {
                    self.handle_peer_event(epoch, event).await;
                }
                Some(done) = sdp_rx.recv() => {
                    self.handle_sdp_completion(done).await;
                }
                _ = timeout => {
                    self.deadline = None;
                    if matches!(self.phase, CallPhase::AwaitingPeer { .. }) {
                        self.fail_call(&CallError::AwaitPeerTimeout).await;
                    }
                }
            }
        }

        if self.phase.call().is_some() {
            self.end_call().await;
        }
        tracing::info!("Call coordinator for {} stopped", self.local_id);
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SendCallRequest {
                target,
                media,
                reply,
            } => {
                let _ = reply.send(self.send_call_request(target, media).await);
            }
            Command::PrepareMedia {
                target,
                local,
                remote,
                reply,
            } => {
                let _ = reply.send(self.prepare_media(target, local, remote).await);
            }
            Command::ViewsReady { reply } => {
                let _ = reply.send(self.views_ready().await);
            }
            Command::StartCall { reply } => {
                let _ = reply.send(self.start_call());
            }
            Command::EndCall { reply } => {
                self.end_call().await;
                let _ = reply.send(Ok(()));
            }
            Command::SwitchCamera { reply } => {
                let result = match self.peer.clone() {
                    Some(peer) => peer.switch_camera().await.map_err(CallError::from),
                    None => Err(CallError::MediaNotPrepared),
                };
                let _ = reply.send(result);
            }
            Command::SetAudioEnabled { enabled, reply } => {
                let result = match &self.peer {
                    Some(peer) => {
                        peer.set_audio_enabled(enabled);
                        Ok(())
                    }
                    None => Err(CallError::MediaNotPrepared),
                };
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Ok(self.snapshot()));
            }
            Command::Shutdown => {}
        }
    }

    async fn send_call_request(&mut self, target: String, media: CallMedia) -> Result<(), CallError> {
        if target.is_empty() || target == self.local_id {
            return Err(CallError::InvalidTarget(target));
        }
        if let Some(current) = self.phase.target() {
            return Err(CallError::AlreadyInCall(current.to_string()));
        }

        // Erst senden, dann Zustand setzen: schlägt das Senden fehl, bleibt alles Idle
        self.transport
            .send(&SignalEvent::call_start(&self.local_id, &target, media))
            .await?;

        tracing::info!("Calling {} ({:?})", target, media);
        self.begin_call(&target, CallDirection::Outgoing, media);
        Ok(())
    }

    async fn prepare_media(
        &mut self,
        target: String,
        local: Arc<dyn RenderSurface>,
        remote: Arc<dyn RenderSurface>,
    ) -> Result<(), CallError> {
        let current = self.phase.target().ok_or(CallError::NoActiveCall)?;
        if current != target {
            return Err(CallError::TargetMismatch {
                expected: current.to_string(),
                actual: target,
            });
        }
        if self.peer.is_some() {
            tracing::debug!("Media already prepared for call with {}", target);
            return Ok(());
        }

        let sink = PeerEventSink::new(self.epoch, self.peer_tx.clone());
        let peer = match self.factory.create(&self.ice_servers, sink).await {
            Ok(peer) => peer,
            Err(e) => {
                let err = CallError::Media(e);
                self.fail_call(&err).await;
                return Err(err);
            }
        };

        let attached = async {
            peer.attach_remote_surface(remote).await?;
            peer.attach_local_media(local).await
        }
        .await;

        match attached {
            Ok(()) => {
                self.peer = Some(peer);
                tracing::info!("Media prepared for call with {}", target);
                Ok(())
            }
            Err(e) => {
                // Halb initialisierte Medien werden nicht weiterverwendet
                tracing::error!("Failed to acquire local media: {}", e);
                if let Err(close_err) = peer.close().await {
                    tracing::warn!("Failed to close peer connection: {}", close_err);
                }
                let err = CallError::Media(e);
                self.fail_call(&err).await;
                Err(err)
            }
        }
    }

    async fn views_ready(&mut self) -> Result<(), CallError> {
        match self.phase {
            CallPhase::Idle => return Err(CallError::NoActiveCall),
            CallPhase::Active { .. } => return Ok(()),
            CallPhase::AwaitingPeer { .. } => {}
        }
        if self.peer.is_none() {
            return Err(CallError::MediaNotPrepared);
        }

        let CallPhase::AwaitingPeer { call, pending } = std::mem::take(&mut self.phase) else {
            return Ok(());
        };

        tracing::info!(
            "Call with {} ready, replaying {} pending events",
            call.target,
            pending.len()
        );
        self.deadline = None;
        self.set_phase(CallPhase::Active { call });

        for event in pending {
            let epoch = self.epoch;
            self.process_negotiation(event).await;
            // Ein fehlgeschlagenes Event kann den Anruf beendet haben
            if self.epoch != epoch {
                break;
            }
        }
        Ok(())
    }

    fn start_call(&mut self) -> Result<(), CallError> {
        if self.phase.call().is_none() {
            return Err(CallError::NoActiveCall);
        }
        let peer = self.peer.clone().ok_or(CallError::MediaNotPrepared)?;

        tracing::info!("Creating offer for {}", self.phase.target().unwrap_or_default());
        self.spawn_sdp(peer, SdpKind::Offer);
        Ok(())
    }

    /// Lokales EndCall: Gegenseite informieren, dann aufräumen
    async fn end_call(&mut self) {
        let Some(target) = self.phase.target().map(str::to_string) else {
            // Idle: nur eine eventuell liegengebliebene Mailbox leeren
            self.teardown(None).await;
            return;
        };

        let event = SignalEvent::end_call(&self.local_id, &target);
        if let Err(e) = self.transport.send(&event).await {
            tracing::warn!("Failed to deliver EndCall to {}: {}", target, e);
        }
        tracing::info!("Ended call with {}", target);
        self.teardown(Some(event)).await;
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            phase: self.phase.kind(),
            target: self.phase.target().map(str::to_string),
            call_id: self.phase.call().map(|c| c.id),
            pending: self.phase.pending_len(),
            media_prepared: self.peer.is_some(),
        }
    }

    // ------------------------------------------------------------------------
    // Inbound events
    // ------------------------------------------------------------------------

    async fn handle_inbound(&mut self, event: SignalEvent) {
        if !event.is_valid() {
            tracing::debug!("Dropping invalid event: {}", event);
            return;
        }
        if event.target != self.local_id {
            tracing::debug!("Dropping event addressed to someone else: {}", event);
            return;
        }

        tracing::debug!("Received {}", event);

        match event.kind {
            SignalKind::CallStart(media) => self.handle_call_start(event, media).await,
            SignalKind::EndCall => self.handle_remote_end(event).await,
            SignalKind::Offer | SignalKind::Answer | SignalKind::IceCandidate => {
                self.handle_negotiation(event).await
            }
        }
    }

    async fn handle_call_start(&mut self, event: SignalEvent, media: CallMedia) {
        match self.phase.target() {
            None => {
                tracing::info!("Incoming {:?} call from {}", media, event.sender);
                self.begin_call(&event.sender, CallDirection::Incoming, media);
                self.publish(event);
            }
            Some(target) if target == event.sender => {
                tracing::debug!("Duplicate CallStart from {}", event.sender);
            }
            Some(target) => {
                tracing::info!(
                    "Rejecting call from {} while in call with {}",
                    event.sender,
                    target
                );
                let reject = SignalEvent::end_call(&self.local_id, &event.sender);
                if let Err(e) = self.transport.send(&reject).await {
                    tracing::warn!("Failed to reject call from {}: {}", event.sender, e);
                }
            }
        }
    }

    async fn handle_remote_end(&mut self, event: SignalEvent) {
        match self.phase.target() {
            Some(target) if target != event.sender => {
                tracing::debug!(
                    "Ignoring EndCall from {} during call with {}",
                    event.sender,
                    target
                );
            }
            _ => {
                tracing::info!("Call ended by {}", event.sender);
                self.teardown(Some(event)).await;
            }
        }
    }

    async fn handle_negotiation(&mut self, event: SignalEvent) {
        if self.phase.target() != Some(event.sender.as_str()) {
            tracing::debug!("Dropping stale {}", event);
            return;
        }

        if let CallPhase::AwaitingPeer { pending, .. } = &mut self.phase {
            if pending.len() >= self.config.pending_limit {
                tracing::warn!(
                    "Pending queue full ({}), dropping {}",
                    self.config.pending_limit,
                    event
                );
            } else {
                tracing::debug!("Queued {} ({} pending)", event, pending.len() + 1);
                pending.push_back(event);
            }
            return;
        }

        self.process_negotiation(event).await;
    }

    /// Offer/Answer/ICE im Zustand `Active`
    async fn process_negotiation(&mut self, event: SignalEvent) {
        let Some(peer) = self.peer.clone() else {
            tracing::warn!("No peer connection for {}", event);
            return;
        };

        match event.kind {
            SignalKind::Offer | SignalKind::Answer => {
                let Some(sdp) = event.payload else {
                    tracing::warn!("{:?} without SDP from {}", event.kind, event.sender);
                    return;
                };
                let kind = if event.kind == SignalKind::Offer {
                    SdpKind::Offer
                } else {
                    SdpKind::Answer
                };

                if let Err(e) = peer.set_remote_description(kind, sdp).await {
                    self.fail_call(&CallError::MediaNegotiationFailed(e)).await;
                    return;
                }
                tracing::debug!("Applied remote {:?} from {}", kind, event.sender);

                if kind == SdpKind::Offer {
                    self.spawn_sdp(peer, SdpKind::Answer);
                }
            }
            SignalKind::IceCandidate => {
                let candidate = match event.payload.as_deref().map(IceCandidate::from_json) {
                    Some(Ok(candidate)) => candidate,
                    Some(Err(e)) => {
                        tracing::debug!("Dropping malformed ICE candidate: {}", e);
                        return;
                    }
                    None => {
                        tracing::debug!("Dropping ICE event without payload");
                        return;
                    }
                };
                if let Err(e) = peer.add_ice_candidate(candidate).await {
                    tracing::warn!("ICE candidate rejected: {}", e);
                }
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------------
    // Peer callbacks
    // ------------------------------------------------------------------------

    async fn handle_peer_event(&mut self, epoch: u64, event: PeerEvent) {
        if epoch != self.epoch {
            tracing::trace!("Dropping peer event of finished call: {:?}", event);
            return;
        }

        match event {
            PeerEvent::IceCandidate(candidate) => {
                // Nur mit Target senden, nie puffern
                let Some(target) = self.phase.target() else {
                    return;
                };
                let payload = match candidate.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!("Failed to encode local ICE candidate: {}", e);
                        return;
                    }
                };
                let event = SignalEvent::ice_candidate(&self.local_id, target, payload);
                if let Err(e) = self.transport.send(&event).await {
                    tracing::warn!("Failed to send ICE candidate: {}", e);
                }
            }
            PeerEvent::RemoteTrack(kind) => {
                tracing::info!("Remote {:?} stream added", kind);
            }
            PeerEvent::NegotiationNeeded => {
                tracing::debug!("Renegotiation requested by peer connection");
            }
            PeerEvent::ConnectionState(LinkState::Failed) => {
                self.fail_call(&CallError::ConnectionFailed).await;
            }
            PeerEvent::ConnectionState(state) => {
                tracing::debug!("Peer connection is {:?}", state);
            }
        }
    }

    async fn handle_sdp_completion(&mut self, done: SdpCompletion) {
        if done.epoch != self.epoch {
            tracing::debug!("Discarding {:?} of a finished call", done.kind);
            return;
        }
        let Some(target) = self.phase.target().map(str::to_string) else {
            return;
        };

        match done.result {
            Ok(sdp) => {
                let event = match done.kind {
                    SdpKind::Offer => SignalEvent::offer(&self.local_id, &target, sdp),
                    SdpKind::Answer => SignalEvent::answer(&self.local_id, &target, sdp),
                };
                if let Err(e) = self.transport.send(&event).await {
                    tracing::warn!("Failed to send {:?}: {}", done.kind, e);
                }
            }
            Err(e) => {
                self.fail_call(&CallError::MediaNegotiationFailed(e)).await;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn begin_call(&mut self, target: &str, direction: CallDirection, media: CallMedia) {
        let call = CallInfo::new(target, direction, media, self.epoch);
        self.deadline = self
            .config
            .await_peer_timeout()
            .map(|timeout| Instant::now() + timeout);
        self.set_phase(CallPhase::AwaitingPeer {
            call,
            pending: VecDeque::new(),
        });
    }

    /// SDP-Erzeugung blockiert die Zustandsmaschine nicht
    fn spawn_sdp(&self, peer: Arc<dyn MediaSession>, kind: SdpKind) {
        let epoch = self.epoch;
        let tx = self.sdp_tx.clone();
        tokio::spawn(async move {
            let result = match kind {
                SdpKind::Offer => peer.create_offer().await,
                SdpKind::Answer => peer.create_answer().await,
            };
            let _ = tx.send(SdpCompletion {
                epoch,
                kind,
                result,
            });
        });
    }

    /// Fehler im Anruf: Gegenseite bekommt EndCall, lokal wird aufgeräumt
    async fn fail_call(&mut self, reason: &CallError) {
        tracing::error!("Call failed: {}", reason);
        self.end_call().await;
    }

    /// Mailbox leeren, Peer schließen, Zustand zurücksetzen, dann veröffentlichen
    async fn teardown(&mut self, event: Option<SignalEvent>) {
        if let Err(e) = self.transport.clear().await {
            tracing::warn!("Failed to clear mailbox: {}", e);
        }

        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                tracing::warn!("Failed to close peer connection: {}", e);
            }
        }

        self.epoch += 1;
        self.deadline = None;
        self.set_phase(CallPhase::Idle);

        if let Some(event) = event {
            self.publish(event);
        }
    }

    fn set_phase(&mut self, phase: CallPhase) {
        tracing::debug!("Call phase: {:?} -> {:?}", self.phase.kind(), phase.kind());
        self.phase = phase;
        let status = self.phase.status();
        self.status.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }

    fn publish(&self, event: SignalEvent) {
        // Fehler heißt nur: niemand hört zu
        let _ = self.events.send(event);
    }
}

// ============================================================================
// TESTS
// ============================================================================
