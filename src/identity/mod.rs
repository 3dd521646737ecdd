//! Identity Module - Lokale Benutzer-ID
//!
//! - Ed25519 Schlüsselpaar pro Gerät (User-ID = Public Key)
//! - Signierung der Relay-Requests
//! - `IdentityProvider` für Hosts mit eigener Anmeldung
//!

mod keypair;

use parking_lot::RwLock;

pub use keypair::{user_id_for_key, verify_message, KeyPair, KeyPairError};

/// Liefert die ID des angemeldeten Benutzers
pub trait IdentityProvider: Send + Sync {
    fn current_user_id(&self) -> Option<String>;
}

impl IdentityProvider for KeyPair {
    fn current_user_id(&self) -> Option<String> {
        Some(self.user_id())
    }
}

/// Identität, die vom Host gesetzt wird (Login/Logout)
#[derive(Debug, Default)]
pub struct SessionIdentity {
    user_id: RwLock<Option<String>>,
}

impl SessionIdentity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: RwLock::new(Some(user_id.into())),
        }
    }

    pub fn login(&self, user_id: impl Into<String>) {
        *self.user_id.write() = Some(user_id.into());
    }

    pub fn logout(&self) {
        *self.user_id.write() = None;
    }
}

impl IdentityProvider for SessionIdentity {
    fn current_user_id(&self) -> Option<String> {
        self.user_id.read().clone().filter(|id| !id.is_empty())
    }
}
