//! Stateless cryptographic primitives shared by the codec and the handshake.
//!
//! Everything here operates on byte slices; keys and state live in
//! [`crate::keystore::KeyStore`].

use std::sync::LazyLock;

use aes::Aes128;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::RngCore;
use sha2::Sha256;

use crate::constants::{HMAC_SIZE, KEY_SIZE, NONCE_SIZE, UDP_KEY_PASSPHRASE};
use crate::error::TuyaError;

const BLOCK_SIZE: usize = 16;

/// Shared key for encrypted discovery broadcasts: MD5 of a well-known passphrase.
pub static UDP_KEY: LazyLock<[u8; KEY_SIZE]> = LazyLock::new(|| md5_digest(UDP_KEY_PASSPHRASE));

/// AES-128-ECB encrypt with PKCS#7 padding.
///
/// A full padding block is appended when the input is already block-aligned,
/// so the output is always a non-empty multiple of 16 bytes.
pub fn aes_ecb_encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Vec<u8> {
    let pad = BLOCK_SIZE - plaintext.len() % BLOCK_SIZE;
    let mut output = Vec::with_capacity(plaintext.len() + pad);
    output.extend_from_slice(plaintext);
    output.extend(std::iter::repeat_n(pad as u8, pad));

    let cipher = Aes128::new(key.into());
    for chunk in output.chunks_mut(BLOCK_SIZE) {
        cipher.encrypt_block(chunk.into());
    }
    output
}

/// AES-128-ECB decrypt and strip PKCS#7 padding.
pub fn aes_ecb_decrypt(key: &[u8; KEY_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>, TuyaError> {
    let mut output = aes_ecb_decrypt_raw(key, ciphertext)?;

    let pad = *output
        .last()
        .ok_or_else(|| TuyaError::Crypto("empty ciphertext".to_string()))? as usize;
    if pad == 0 || pad > BLOCK_SIZE || pad > output.len() {
        return Err(TuyaError::Crypto("invalid padding".to_string()));
    }
    if !output[output.len() - pad..].iter().all(|&b| b as usize == pad) {
        return Err(TuyaError::Crypto("invalid padding".to_string()));
    }
    output.truncate(output.len() - pad);
    Ok(output)
}

/// AES-128-ECB encrypt without padding; input must be block-aligned.
///
/// Used for the session-key derivation, which operates on exactly one block.
pub fn aes_ecb_encrypt_raw(key: &[u8; KEY_SIZE], data: &[u8]) -> Result<Vec<u8>, TuyaError> {
    if !data.len().is_multiple_of(BLOCK_SIZE) || data.is_empty() {
        return Err(TuyaError::Crypto(format!(
            "plaintext length {} is not block-aligned",
            data.len()
        )));
    }
    let cipher = Aes128::new(key.into());
    let mut output = data.to_vec();
    for chunk in output.chunks_mut(BLOCK_SIZE) {
        cipher.encrypt_block(chunk.into());
    }
    Ok(output)
}

/// AES-128-ECB decrypt without padding removal; input must be block-aligned.
pub fn aes_ecb_decrypt_raw(key: &[u8; KEY_SIZE], data: &[u8]) -> Result<Vec<u8>, TuyaError> {
    if !data.len().is_multiple_of(BLOCK_SIZE) || data.is_empty() {
        return Err(TuyaError::Crypto(format!(
            "ciphertext length {} is not block-aligned",
            data.len()
        )));
    }
    let cipher = Aes128::new(key.into());
    let mut output = data.to_vec();
    for chunk in output.chunks_mut(BLOCK_SIZE) {
        cipher.decrypt_block(chunk.into());
    }
    Ok(output)
}

/// HMAC-SHA256 over `data`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; HMAC_SIZE] {
    // Qualified: KeyInit is also in scope for the AES cipher.
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time HMAC-SHA256 verification.
pub fn verify_hmac_sha256(key: &[u8], data: &[u8], tag: &[u8]) -> bool {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.verify_slice(tag).is_ok()
}

/// Frame checksum: CRC32 (IEEE) over header and payload bytes.
pub fn checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// MD5 digest, 16 raw bytes.
pub fn md5_digest(data: &[u8]) -> [u8; KEY_SIZE] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Fresh 16-byte random nonce for the session handshake.
pub fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);
    nonce
}
