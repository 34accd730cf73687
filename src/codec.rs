//! Frame codec: the `message → frame → bytes` and `bytes → frame → message`
//! transform stages.
//!
//! Wire frame, big-endian:
//! `prefix(4) | seq(4) | command(4) | length(4) | [ret(4)] | payload | crc32(4) | suffix(4)`
//! where `length` counts everything after the length field. Payload
//! encryption depends on protocol version and command type; discovery
//! broadcasts use the shared UDP key regardless of version.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use tracing::{trace, warn};

use crate::constants::{
    FOOTER_SIZE, HEADER_SIZE, KEY_SIZE, MAX_BODY_LENGTH, MIN_FRAME_SIZE, PREFIX,
    PROTOCOL_HEADER_SIZE, SUFFIX,
};
use crate::crypto::{self, UDP_KEY};
use crate::error::TuyaError;
use crate::frame::{CommandType, Frame, Version};
use crate::keystore::KeyStore;
use crate::message::{DeviceInfo, Message, dps_from_json, dps_to_json};

const PREFIX_BYTES: [u8; 4] = PREFIX.to_be_bytes();

/// Length of the v3.1 ASCII envelope prefix: version tag + 16 hex signature chars.
const ENVELOPE_31_PREFIX: usize = 3 + 16;

/// Serialize a frame into one complete wire frame with checksum and magics.
pub fn encode_frame(frame: &Frame) -> Bytes {
    let ret_len = if frame.ret_code.is_some() { 4 } else { 0 };
    let length = frame.payload.len() + ret_len + FOOTER_SIZE;
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + length);

    buf.put_u32(PREFIX);
    buf.put_u32(frame.seq);
    buf.put_u32(frame.command.into());
    buf.put_u32(length as u32);
    if let Some(ret) = frame.ret_code {
        buf.put_u32(ret);
    }
    buf.put_slice(&frame.payload);
    let crc = crypto::checksum(&buf);
    buf.put_u32(crc);
    buf.put_u32(SUFFIX);
    buf.freeze()
}

/// Outbound stage: turns a [`Message`] into wire bytes, applying the
/// per-version encryption and header rules.
pub struct FrameEncoder {
    version: Version,
    device_id: String,
    keys: Arc<KeyStore>,
}

impl FrameEncoder {
    pub fn new(version: Version, device_id: impl Into<String>, keys: Arc<KeyStore>) -> Self {
        Self {
            version,
            device_id: device_id.into(),
            keys,
        }
    }

    pub fn encode(&self, message: &Message, seq: u32) -> Result<Bytes, TuyaError> {
        Ok(encode_frame(&self.message_to_frame(message, seq)?))
    }

    /// First half of the outbound chain, exposed so callers can embed a
    /// return code before framing (device responses do).
    pub fn message_to_frame(&self, message: &Message, seq: u32) -> Result<Frame, TuyaError> {
        let command = message.command();
        let plaintext = self.plaintext(message)?;
        let body = self.protect(command, plaintext)?;
        Ok(Frame::new(seq, command, Bytes::from(body)))
    }

    /// Build the plaintext payload for a message.
    fn plaintext(&self, message: &Message) -> Result<Vec<u8>, TuyaError> {
        match message {
            Message::DataPoints {
                sub_device, dps, ..
            } => {
                let mut obj = serde_json::Map::new();
                if let Some(cid) = sub_device {
                    obj.insert("cid".into(), cid.as_str().into());
                }
                obj.insert("gwId".into(), self.device_id.as_str().into());
                obj.insert(
                    "devId".into(),
                    sub_device.as_deref().unwrap_or(&self.device_id).into(),
                );
                obj.insert("uid".into(), self.device_id.as_str().into());
                obj.insert("t".into(), unix_timestamp().to_string().into());
                if !dps.is_empty() {
                    obj.insert("dps".into(), dps_to_json(dps));
                }
                Ok(serde_json::to_vec(&Value::Object(obj))?)
            }
            Message::Refresh { dp_ids, .. } => {
                let obj = serde_json::json!({
                    "gwId": self.device_id,
                    "devId": self.device_id,
                    "uid": self.device_id,
                    "t": unix_timestamp().to_string(),
                    "dpId": dp_ids,
                });
                Ok(serde_json::to_vec(&obj)?)
            }
            Message::Raw { payload, .. } => Ok(payload.to_vec()),
            Message::Discovery { info, .. } => Ok(serde_json::to_vec(info)?),
        }
    }

    /// Apply the version- and command-dependent encryption rules.
    fn protect(&self, command: CommandType, plaintext: Vec<u8>) -> Result<Vec<u8>, TuyaError> {
        if command.is_discovery() {
            return Ok(match command {
                CommandType::Udp => plaintext,
                _ => crypto::aes_ecb_encrypt(&UDP_KEY, &plaintext),
            });
        }
        let key = self.keys.session_key();
        match self.version {
            Version::V3_1 => {
                if command != CommandType::Control {
                    return Ok(plaintext);
                }
                let b64 = BASE64.encode(crypto::aes_ecb_encrypt(&key, &plaintext));
                Ok(envelope_31(&key, b64.as_bytes()))
            }
            Version::V3_3 => {
                let ciphertext = crypto::aes_ecb_encrypt(&key, &plaintext);
                if command.uses_protocol_header() {
                    let mut body = Vec::with_capacity(PROTOCOL_HEADER_SIZE + ciphertext.len());
                    body.extend_from_slice(Version::V3_3.as_bytes());
                    body.extend_from_slice(&[0u8; 12]);
                    body.extend_from_slice(&ciphertext);
                    Ok(body)
                } else {
                    Ok(ciphertext)
                }
            }
            Version::V3_4 => Ok(crypto::aes_ecb_encrypt(&key, &plaintext)),
        }
    }
}

/// v3.1 ASCII envelope: `"3.1" + md5hex("data=" + b64 + "||lpv=3.1||" + key)[..16] + b64`.
fn envelope_31(key: &[u8; KEY_SIZE], b64: &[u8]) -> Vec<u8> {
    let mut signed = Vec::with_capacity(b64.len() + 32);
    signed.extend_from_slice(b"data=");
    signed.extend_from_slice(b64);
    signed.extend_from_slice(b"||lpv=3.1||");
    signed.extend_from_slice(key);
    let digest = hex::encode(crypto::md5_digest(&signed));

    let mut body = Vec::with_capacity(ENVELOPE_31_PREFIX + b64.len());
    body.extend_from_slice(Version::V3_1.as_bytes());
    body.extend_from_slice(&digest.as_bytes()[..16]);
    body.extend_from_slice(b64);
    body
}

/// Inbound stage: reassembles frames from a byte stream and decodes them
/// into messages.
///
/// Framing and checksum faults consume the offending bytes and are logged,
/// never surfaced as errors; the stream resynchronizes on the next prefix.
pub struct FrameDecoder {
    version: Version,
    keys: Arc<KeyStore>,
    /// Response frames from a device embed a return code; frames we encode
    /// ourselves never do. Set to false when decoding client-originated
    /// traffic (tests, device simulation).
    expect_return_codes: bool,
}

impl FrameDecoder {
    pub fn new(version: Version, keys: Arc<KeyStore>, expect_return_codes: bool) -> Self {
        Self {
            version,
            keys,
            expect_return_codes,
        }
    }

    /// Decoder for UDP discovery datagrams, which carry their own fixed key.
    pub fn for_discovery() -> Self {
        Self::new(Version::V3_3, Arc::new(KeyStore::new([0u8; KEY_SIZE])), true)
    }

    /// Extract the next complete frame from `buf`, or `None` if more bytes
    /// are needed. Corrupted frames are dropped internally.
    pub fn decode_frame(&self, buf: &mut BytesMut) -> Option<Frame> {
        loop {
            self.align_to_prefix(buf);
            if buf.len() < MIN_FRAME_SIZE {
                return None;
            }

            let length = u32::from_be_bytes(buf[12..16].try_into().expect("sized slice")) as usize;
            if !(FOOTER_SIZE..=MAX_BODY_LENGTH).contains(&length) {
                warn!(length, "implausible frame length, resynchronizing");
                let _ = buf.split_to(4);
                continue;
            }
            let total = HEADER_SIZE + length;
            if buf.len() < total {
                buf.reserve(total - buf.len());
                return None;
            }

            let raw = buf.split_to(total).freeze();
            if raw[total - 4..] != SUFFIX.to_be_bytes() {
                warn!("frame suffix mismatch, dropping frame");
                continue;
            }
            let stored = u32::from_be_bytes(raw[total - 8..total - 4].try_into().expect("sized"));
            let computed = crypto::checksum(&raw[..total - 8]);
            if stored != computed {
                warn!(stored, computed, "frame checksum mismatch, dropping frame");
                continue;
            }

            let seq = u32::from_be_bytes(raw[4..8].try_into().expect("sized"));
            let command = CommandType::from(u32::from_be_bytes(
                raw[8..12].try_into().expect("sized"),
            ));
            let mut payload = raw.slice(HEADER_SIZE..total - FOOTER_SIZE);

            // A return code is assumed present when the body leads with three
            // zero bytes; JSON, version headers and (for all practical
            // purposes) ciphertext blocks never do.
            let mut ret_code = None;
            if self.expect_return_codes
                && payload.len() >= 4
                && payload[..3] == [0, 0, 0]
            {
                ret_code = Some(u32::from_be_bytes(
                    payload[..4].try_into().expect("sized"),
                ));
                payload = payload.slice(4..);
            }

            trace!(seq, ?command, len = payload.len(), "frame received");
            return Some(Frame {
                seq,
                command,
                ret_code,
                payload,
            });
        }
    }

    /// Discard garbage in front of the next prefix, keeping a partial prefix
    /// tail so split reads across the magic still match.
    fn align_to_prefix(&self, buf: &mut BytesMut) {
        if buf.len() < 4 {
            return;
        }
        match buf.windows(4).position(|w| w == PREFIX_BYTES) {
            Some(0) => {}
            Some(at) => {
                warn!(skipped = at, "skipping bytes before frame prefix");
                let _ = buf.split_to(at);
            }
            None => {
                let keep = buf.len().min(3);
                let _ = buf.split_to(buf.len() - keep);
            }
        }
    }

    /// Second inbound stage: decrypt and shape a frame into a [`Message`].
    ///
    /// [`TuyaError::Crypto`] is fatal for the connection; other errors mean
    /// the single message is undecodable and should be dropped.
    pub fn decode_message(&self, frame: &Frame) -> Result<Message, TuyaError> {
        let command = frame.command;
        let plaintext = self.open(command, &frame.payload)?;
        self.shape(command, plaintext)
    }

    /// Undo the per-version payload protection.
    fn open(&self, command: CommandType, payload: &Bytes) -> Result<Vec<u8>, TuyaError> {
        if command.is_discovery() {
            return match command {
                CommandType::Udp => Ok(payload.to_vec()),
                _ => crypto::aes_ecb_decrypt(&UDP_KEY, payload),
            };
        }
        if payload.is_empty() {
            return Ok(Vec::new());
        }
        let key = self.keys.session_key();
        match self.version {
            Version::V3_1 => {
                if payload.starts_with(Version::V3_1.as_bytes()) {
                    if payload.len() < ENVELOPE_31_PREFIX {
                        return Err(TuyaError::Payload("truncated 3.1 envelope".into()));
                    }
                    let ciphertext = BASE64.decode(&payload[ENVELOPE_31_PREFIX..])?;
                    crypto::aes_ecb_decrypt(&key, &ciphertext)
                } else {
                    Ok(payload.to_vec())
                }
            }
            Version::V3_3 => {
                let body = if payload.starts_with(Version::V3_3.as_bytes())
                    && payload.len() > PROTOCOL_HEADER_SIZE
                {
                    &payload[PROTOCOL_HEADER_SIZE..]
                } else {
                    &payload[..]
                };
                crypto::aes_ecb_decrypt(&key, body)
            }
            Version::V3_4 => crypto::aes_ecb_decrypt(&key, payload),
        }
    }

    /// Map plaintext bytes onto the payload shape of the command.
    fn shape(&self, command: CommandType, plaintext: Vec<u8>) -> Result<Message, TuyaError> {
        if command.is_discovery() {
            let info: DeviceInfo = serde_json::from_slice(&plaintext)?;
            return Ok(Message::Discovery { command, info });
        }
        if command.carries_data_points() {
            if plaintext.is_empty() {
                return Ok(Message::DataPoints {
                    command,
                    sub_device: None,
                    dps: Default::default(),
                });
            }
            let value: Value = serde_json::from_slice(&plaintext)?;
            let sub_device = value
                .get("cid")
                .and_then(Value::as_str)
                .map(str::to_string);
            // Status pushes nest the mapping under "data" on some firmware.
            let dps = value
                .get("dps")
                .or_else(|| value.get("data").and_then(|d| d.get("dps")))
                .map(dps_from_json)
                .unwrap_or_default();
            return Ok(Message::DataPoints {
                command,
                sub_device,
                dps,
            });
        }
        if command == CommandType::DpRefresh {
            let value: Value = serde_json::from_slice(&plaintext)?;
            let dp_ids = value
                .get("dpId")
                .and_then(Value::as_array)
                .map(|ids| {
                    ids.iter()
                        .filter_map(Value::as_u64)
                        .map(|id| id as u32)
                        .collect()
                })
                .unwrap_or_default();
            return Ok(Message::Refresh { command, dp_ids });
        }
        Ok(Message::Raw {
            command,
            payload: Bytes::from(plaintext),
        })
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
