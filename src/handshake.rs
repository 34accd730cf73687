//! v3.4 session-key negotiation.
//!
//! Three-message exchange, all framed and encrypted like regular traffic
//! (the session key still equals the device key while it runs):
//!
//! 1. `SESS_KEY_NEG_START`: our 16-byte nonce.
//! 2. `SESS_KEY_NEG_RESP`: device nonce (16) followed by
//!    `HMAC-SHA256(device_key, local_nonce)` (32).
//! 3. `SESS_KEY_NEG_FINISH`: `HMAC-SHA256(device_key, remote_nonce)`.
//!
//! The session key is `AES-ECB(device_key, local_nonce XOR remote_nonce)`
//! and is installed into the key store only after the device's HMAC
//! verifies; the FINISH message still travels under the old key.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::constants::{HMAC_SIZE, KEY_SIZE, NONCE_SIZE};
use crate::crypto::{aes_ecb_encrypt_raw, hmac_sha256, verify_hmac_sha256};
use crate::error::TuyaError;
use crate::frame::CommandType;
use crate::keystore::KeyStore;
use crate::message::Message;

pub struct SessionHandshake {
    keys: Arc<KeyStore>,
    pending_key: Option<[u8; KEY_SIZE]>,
}

impl SessionHandshake {
    pub fn new(keys: Arc<KeyStore>) -> Self {
        Self {
            keys,
            pending_key: None,
        }
    }

    /// The opening message, carrying the key store's current local nonce.
    pub fn start_message(&self) -> Message {
        Message::Raw {
            command: CommandType::SessKeyNegStart,
            payload: Bytes::copy_from_slice(&self.keys.local_nonce()),
        }
    }

    /// Verify the device's response and produce the FINISH message.
    ///
    /// On HMAC mismatch nothing is derived and the key store is untouched.
    /// The negotiated key is held back until [`finalize`](Self::finalize) so
    /// the FINISH frame is still encrypted under the old key.
    pub fn handle_response(&mut self, payload: &[u8]) -> Result<Message, TuyaError> {
        if payload.len() < NONCE_SIZE + HMAC_SIZE {
            return Err(TuyaError::Handshake(format!(
                "response too short: {} bytes",
                payload.len()
            )));
        }
        let device_key = self.keys.device_key();
        let remote_nonce: [u8; NONCE_SIZE] =
            payload[..NONCE_SIZE].try_into().expect("sized slice");
        let remote_hmac = &payload[NONCE_SIZE..NONCE_SIZE + HMAC_SIZE];

        let local_nonce = self.keys.local_nonce();
        if !verify_hmac_sha256(&device_key, &local_nonce, remote_hmac) {
            return Err(TuyaError::Handshake("device HMAC mismatch".into()));
        }

        self.pending_key = Some(derive_session_key(&device_key, &local_nonce, &remote_nonce)?);
        debug!("session key negotiated, pending finish");

        Ok(Message::Raw {
            command: CommandType::SessKeyNegFinish,
            payload: Bytes::copy_from_slice(&hmac_sha256(&device_key, &remote_nonce)),
        })
    }

    /// Install the negotiated key. Call after the FINISH message was written.
    pub fn finalize(&mut self) -> Result<(), TuyaError> {
        let key = self
            .pending_key
            .take()
            .ok_or_else(|| TuyaError::Handshake("finalize before response".into()))?;
        self.keys.install_session_key(key);
        Ok(())
    }
}

/// `AES-ECB(device_key, local XOR remote)`, the same derivation the device
/// performs on its side.
pub fn derive_session_key(
    device_key: &[u8; KEY_SIZE],
    local_nonce: &[u8; NONCE_SIZE],
    remote_nonce: &[u8; NONCE_SIZE],
) -> Result<[u8; KEY_SIZE], TuyaError> {
    let mut mixed = [0u8; NONCE_SIZE];
    for (i, byte) in mixed.iter_mut().enumerate() {
        *byte = local_nonce[i] ^ remote_nonce[i];
    }
    let block = aes_ecb_encrypt_raw(device_key, &mixed)?;
    Ok(block[..KEY_SIZE].try_into().expect("sized slice"))
}
