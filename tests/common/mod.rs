//! Common test utilities and shared imports

// Allow unused imports and dead code since this is a shared module
// used across multiple test files - not all items are used in every test file
#[allow(unused_imports)]
pub use bytes::{Bytes, BytesMut};
#[allow(unused_imports)]
pub use lantuya::codec::{FrameDecoder, FrameEncoder, encode_frame};
#[allow(unused_imports)]
pub use lantuya::frame::{CommandType, Frame, Version};
#[allow(unused_imports)]
pub use lantuya::keystore::KeyStore;
#[allow(unused_imports)]
pub use lantuya::message::{DeviceInfo, DpMap, Message};
#[allow(unused_imports)]
pub use std::sync::Arc;

/// Key shared by the simulated device and the client in tests.
#[allow(dead_code)]
pub const TEST_KEY: [u8; 16] = *b"0123456789abcdef";

#[allow(dead_code)]
pub const TEST_DEVICE_ID: &str = "bf0123456789abcdef01";

/// Decode hex string to bytes for testing
#[allow(dead_code)]
pub fn hex_to_bytes(hex_data: &str) -> Bytes {
    Bytes::from(hex::decode(hex_data).expect("Failed to decode hex"))
}

/// Encoder/decoder pair over one key store, decoding our own frames
/// (no return codes).
#[allow(dead_code)]
pub fn client_harness(version: Version) -> (FrameEncoder, FrameDecoder, Arc<KeyStore>) {
    let keys = Arc::new(KeyStore::new(TEST_KEY));
    (
        FrameEncoder::new(version, TEST_DEVICE_ID, keys.clone()),
        FrameDecoder::new(version, keys.clone(), false),
        keys,
    )
}

/// Build a device-style response frame: same payload rules, plus the
/// leading return code device firmware embeds.
#[allow(dead_code)]
pub fn device_response(
    encoder: &FrameEncoder,
    message: &Message,
    seq: u32,
) -> Bytes {
    let mut frame = encoder
        .message_to_frame(message, seq)
        .expect("Failed to build frame");
    frame.ret_code = Some(0);
    encode_frame(&frame)
}

#[allow(dead_code)]
pub fn dps(pairs: &[(u32, serde_json::Value)]) -> DpMap {
    pairs.iter().cloned().collect()
}
