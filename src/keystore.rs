//! Per-device key material.

use std::sync::Mutex;

use crate::constants::{KEY_SIZE, NONCE_SIZE};
use crate::crypto::random_nonce;

struct Keys {
    session_key: [u8; KEY_SIZE],
    local_nonce: [u8; NONCE_SIZE],
}

/// Mutable key holder for one device.
///
/// The long-term `device_key` never changes. The `session_key` equals the
/// device key until a v3.4 handshake installs a negotiated key, and reverts
/// on [`reset`](KeyStore::reset) when the connection drops. The session key
/// is only ever replaced after HMAC verification succeeds; a failed
/// handshake leaves it untouched.
pub struct KeyStore {
    device_key: [u8; KEY_SIZE],
    keys: Mutex<Keys>,
}

impl KeyStore {
    pub fn new(device_key: [u8; KEY_SIZE]) -> Self {
        Self {
            device_key,
            keys: Mutex::new(Keys {
                session_key: device_key,
                local_nonce: random_nonce(),
            }),
        }
    }

    pub fn device_key(&self) -> [u8; KEY_SIZE] {
        self.device_key
    }

    pub fn session_key(&self) -> [u8; KEY_SIZE] {
        self.keys.lock().expect("key store lock poisoned").session_key
    }

    pub fn local_nonce(&self) -> [u8; NONCE_SIZE] {
        self.keys.lock().expect("key store lock poisoned").local_nonce
    }

    /// Install the negotiated session key. Callers must have verified the
    /// device's HMAC first.
    pub fn install_session_key(&self, key: [u8; KEY_SIZE]) {
        self.keys.lock().expect("key store lock poisoned").session_key = key;
    }

    /// Revert to the device key and draw a fresh nonce so the next
    /// connection attempt starts clean.
    pub fn reset(&self) {
        let mut keys = self.keys.lock().expect("key store lock poisoned");
        keys.session_key = self.device_key;
        keys.local_nonce = random_nonce();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_starts_as_device_key() {
        let store = KeyStore::new([7u8; 16]);
        assert_eq!(store.session_key(), [7u8; 16]);
    }

    #[test]
    fn reset_reverts_key_and_rotates_nonce() {
        let store = KeyStore::new([7u8; 16]);
        let first_nonce = store.local_nonce();
        store.install_session_key([9u8; 16]);
        assert_eq!(store.session_key(), [9u8; 16]);

        store.reset();
        assert_eq!(store.session_key(), [7u8; 16]);
        assert_ne!(store.local_nonce(), first_nonce);
    }
}
