use std::io;
use thiserror::Error;

/// The primary error type for the `lantuya` library.
#[derive(Error, Debug)]
pub enum TuyaError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Timed out: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("Decryption failed: {0}")]
    Crypto(String),

    #[error("Session key negotiation failed: {0}")]
    Handshake(String),

    #[error("Malformed payload: {0}")]
    Payload(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Device {0} is already registered")]
    DuplicateDevice(String),

    #[error("Invalid device key: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
}

impl From<serde_json::Error> for TuyaError {
    fn from(e: serde_json::Error) -> Self {
        TuyaError::Payload(e.to_string())
    }
}

impl From<base64::DecodeError> for TuyaError {
    fn from(e: base64::DecodeError) -> Self {
        TuyaError::Crypto(format!("invalid base64 envelope: {e}"))
    }
}
