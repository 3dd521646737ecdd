//! Background Call Watcher
//!
//! Hört auf die veröffentlichten Events des Coordinators und zeigt bei
//! einem eingehenden `CallStart` einen Prompt an, auch ohne offenen
//! Call-Screen. Verändert keinen Zustand; Ablehnen geht über
//! `CallCoordinator::end_call`.

use super::coordinator::CallCoordinator;
use super::state::CallStatus;
use crate::signaling::{CallMedia, SignalEvent, SignalKind};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    pub from: String,
    pub media: CallMedia,
}

/// System-Prompt des Hosts (Notification, Vollbild-Intent, ...)
pub trait IncomingCallPrompt: Send + Sync {
    fn show(&self, call: IncomingCall);

    /// Anrufer hat aufgelegt oder der Anruf wurde abgelehnt
    fn dismiss(&self, from: &str);
}

/// Läuft bis zum Drop
pub struct IncomingCallWatcher {
    task: JoinHandle<()>,
}

impl IncomingCallWatcher {
    /// Klingelt es schon beim Start, wird der Prompt sofort angezeigt
    pub fn spawn(coordinator: &CallCoordinator, prompt: Arc<dyn IncomingCallPrompt>) -> Self {
        // Erst abonnieren, dann Status lesen: sonst geht ein CallStart dazwischen verloren
        let events = coordinator.subscribe();
        let ringing = match coordinator.current_status() {
            CallStatus::Incoming { from, media } => Some(IncomingCall { from, media }),
            _ => None,
        };
        let task = tokio::spawn(run(events, prompt, ringing));
        Self { task }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for IncomingCallWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    mut events: broadcast::Receiver<SignalEvent>,
    prompt: Arc<dyn IncomingCallPrompt>,
    initial: Option<IncomingCall>,
) {
    // Anrufer, dessen Prompt gerade angezeigt wird
    let mut ringing: Option<String> = None;

    if let Some(call) = initial {
        tracing::info!("Call from {} already ringing", call.from);
        ringing = Some(call.from.clone());
        prompt.show(call);
    }

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Incoming call watcher skipped {} events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event.kind {
            SignalKind::CallStart(_) if ringing.as_deref() == Some(event.sender.as_str()) => {}
            SignalKind::CallStart(media) => {
                tracing::info!("Incoming call from {}", event.sender);
                ringing = Some(event.sender.clone());
                prompt.show(IncomingCall {
                    from: event.sender,
                    media,
                });
            }
            SignalKind::EndCall => {
                let Some(caller) = ringing.as_deref() else {
                    continue;
                };
                if event.sender == caller || event.target == caller {
                    prompt.dismiss(caller);
                    ringing = None;
                }
            }
            _ => {}
        }
    }

    tracing::debug!("Incoming call watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::testing::{coordinator, wait_for, wait_until};
    use crate::call::PhaseKind;
    use crate::signaling::SqliteMailboxStore;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingPrompt {
        log: Mutex<Vec<String>>,
    }

    impl RecordingPrompt {
        fn log(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    impl IncomingCallPrompt for RecordingPrompt {
        fn show(&self, call: IncomingCall) {
            self.log
                .lock()
                .push(format!("show {} {:?}", call.from, call.media));
        }

        fn dismiss(&self, from: &str) {
            self.log.lock().push(format!("dismiss {}", from));
        }
    }

    #[tokio::test]
    async fn test_prompt_shown_and_dismissed_when_caller_hangs_up() {
        let store = Arc::new(SqliteMailboxStore::open_in_memory().unwrap());
        let alice = coordinator(&store, "alice").await;
        let bob = coordinator(&store, "bob").await;
        let prompt = Arc::new(RecordingPrompt::default());
        let _watcher = IncomingCallWatcher::spawn(&bob.coordinator, prompt.clone());

        alice
            .coordinator
            .send_call_request("bob", CallMedia::Audio)
            .await
            .unwrap();
        wait_for(|| prompt.log() == vec!["show alice Audio"]).await;

        alice.coordinator.end_call().await.unwrap();
        wait_for(|| prompt.log() == vec!["show alice Audio", "dismiss alice"]).await;
    }

    #[tokio::test]
    async fn test_call_ringing_before_spawn_is_prompted() {
        let store = Arc::new(SqliteMailboxStore::open_in_memory().unwrap());
        let alice = coordinator(&store, "alice").await;
        let bob = coordinator(&store, "bob").await;

        alice
            .coordinator
            .send_call_request("bob", CallMedia::Video)
            .await
            .unwrap();
        wait_until(&bob.coordinator, |s| s.phase == PhaseKind::AwaitingPeer).await;

        let prompt = Arc::new(RecordingPrompt::default());
        let _watcher = IncomingCallWatcher::spawn(&bob.coordinator, prompt.clone());
        wait_for(|| !prompt.log().is_empty()).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(prompt.log(), vec!["show alice Video"]);

        alice.coordinator.end_call().await.unwrap();
        wait_for(|| prompt.log() == vec!["show alice Video", "dismiss alice"]).await;
    }

    #[tokio::test]
    async fn test_decline_sends_end_call_to_caller() {
        let store = Arc::new(SqliteMailboxStore::open_in_memory().unwrap());
        let alice = coordinator(&store, "alice").await;
        let bob = coordinator(&store, "bob").await;
        let prompt = Arc::new(RecordingPrompt::default());
        let _watcher = IncomingCallWatcher::spawn(&bob.coordinator, prompt.clone());

        alice
            .coordinator
            .send_call_request("bob", CallMedia::Video)
            .await
            .unwrap();
        wait_for(|| prompt.log().len() == 1).await;

        bob.coordinator.end_call().await.unwrap();

        wait_until(&alice.coordinator, |s| s.phase == PhaseKind::Idle).await;
        wait_for(|| prompt.log().last().map(String::as_str) == Some("dismiss alice")).await;
    }

    #[tokio::test]
    async fn test_outgoing_calls_do_not_prompt() {
        let store = Arc::new(SqliteMailboxStore::open_in_memory().unwrap());
        let alice = coordinator(&store, "alice").await;
        let _bob = coordinator(&store, "bob").await;
        let prompt = Arc::new(RecordingPrompt::default());
        let watcher = IncomingCallWatcher::spawn(&alice.coordinator, prompt.clone());

        alice
            .coordinator
            .send_call_request("bob", CallMedia::Video)
            .await
            .unwrap();
        alice.coordinator.end_call().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert!(prompt.log().is_empty());
        assert!(watcher.is_running());
    }
}
