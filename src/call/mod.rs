//! Call Module - Anruf-Lebenszyklus
//!
//! - `CallCoordinator`: Zustandsmaschine, einziger Besitzer des Anrufs
//! - `CallSession`: bindet die Surfaces eines Call-Screens
//! - `IncomingCallWatcher`: Prompt für eingehende Anrufe im Hintergrund

mod coordinator;
mod session;
mod state;
mod watcher;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{CallCoordinator, CallError};
pub use session::{CallRole, CallSession};
pub use state::{CallDirection, CallInfo, CallSnapshot, CallStatus, PhaseKind};
pub use watcher::{IncomingCall, IncomingCallPrompt, IncomingCallWatcher};
