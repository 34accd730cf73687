//! Tests for the v3.4 session-key exchange, driven over the codec the way a
//! real device would see it

mod common;

use common::*;
use lantuya::crypto::hmac_sha256;
use lantuya::handshake::{SessionHandshake, derive_session_key};

/// Minimal device-side model of the negotiation.
struct FakeDevice {
    keys: Arc<KeyStore>,
    encoder: FrameEncoder,
    decoder: FrameDecoder,
    remote_nonce: [u8; 16],
    client_nonce: Option<[u8; 16]>,
}

impl FakeDevice {
    fn new(remote_nonce: [u8; 16]) -> Self {
        let keys = Arc::new(KeyStore::new(TEST_KEY));
        Self {
            encoder: FrameEncoder::new(Version::V3_4, TEST_DEVICE_ID, keys.clone()),
            decoder: FrameDecoder::new(Version::V3_4, keys.clone(), false),
            keys,
            remote_nonce,
            client_nonce: None,
        }
    }

    fn decode(&self, wire: &[u8]) -> Message {
        let mut buf = BytesMut::from(wire);
        let frame = self.decoder.decode_frame(&mut buf).expect("Failed to frame");
        self.decoder.decode_message(&frame).expect("Failed to decode")
    }

    fn answer_start(&mut self, wire: &[u8]) -> Bytes {
        let Message::Raw { command, payload } = self.decode(wire) else {
            panic!("start must be raw");
        };
        assert_eq!(command, CommandType::SessKeyNegStart);
        let client_nonce: [u8; 16] = payload.as_ref().try_into().unwrap();
        self.client_nonce = Some(client_nonce);

        let mut body = self.remote_nonce.to_vec();
        body.extend_from_slice(&hmac_sha256(&TEST_KEY, &client_nonce));
        let response = Message::Raw {
            command: CommandType::SessKeyNegResp,
            payload: Bytes::from(body),
        };
        device_response(&self.encoder, &response, 1)
    }

    fn accept_finish(&mut self, wire: &[u8]) {
        let Message::Raw { command, payload } = self.decode(wire) else {
            panic!("finish must be raw");
        };
        assert_eq!(command, CommandType::SessKeyNegFinish);
        assert_eq!(
            payload.as_ref(),
            hmac_sha256(&TEST_KEY, &self.remote_nonce).as_slice(),
            "client must prove it saw our nonce"
        );
        let key = derive_session_key(
            &TEST_KEY,
            &self.client_nonce.expect("finish before start"),
            &self.remote_nonce,
        )
        .unwrap();
        self.keys.install_session_key(key);
    }
}

#[test]
fn negotiation_converges_on_one_key() {
    let client_keys = Arc::new(KeyStore::new(TEST_KEY));
    let client_enc = FrameEncoder::new(Version::V3_4, TEST_DEVICE_ID, client_keys.clone());
    let client_dec = FrameDecoder::new(Version::V3_4, client_keys.clone(), true);
    let mut device = FakeDevice::new([0x42u8; 16]);

    let mut handshake = SessionHandshake::new(client_keys.clone());
    let start_wire = client_enc.encode(&handshake.start_message(), 1).unwrap();
    let resp_wire = device.answer_start(&start_wire);

    let mut buf = BytesMut::from(&resp_wire[..]);
    let frame = client_dec.decode_frame(&mut buf).unwrap();
    let Message::Raw { payload, .. } = client_dec.decode_message(&frame).unwrap() else {
        panic!("response must be raw");
    };
    let finish = handshake.handle_response(&payload).unwrap();

    // The finish frame still travels under the pre-negotiation key.
    let finish_wire = client_enc.encode(&finish, 2).unwrap();
    device.accept_finish(&finish_wire);
    handshake.finalize().unwrap();

    assert_eq!(client_keys.session_key(), device.keys.session_key());
    assert_ne!(client_keys.session_key(), TEST_KEY);
}

#[test]
fn traffic_after_negotiation_uses_the_session_key() {
    let client_keys = Arc::new(KeyStore::new(TEST_KEY));
    let mut device = FakeDevice::new([0x37u8; 16]);

    let client_enc = FrameEncoder::new(Version::V3_4, TEST_DEVICE_ID, client_keys.clone());
    let client_dec = FrameDecoder::new(Version::V3_4, client_keys.clone(), true);
    let mut handshake = SessionHandshake::new(client_keys.clone());

    let resp = device.answer_start(&client_enc.encode(&handshake.start_message(), 1).unwrap());
    let mut buf = BytesMut::from(&resp[..]);
    let frame = client_dec.decode_frame(&mut buf).unwrap();
    let Message::Raw { payload, .. } = client_dec.decode_message(&frame).unwrap() else {
        panic!("response must be raw");
    };
    let finish = handshake.handle_response(&payload).unwrap();
    device.accept_finish(&client_enc.encode(&finish, 2).unwrap());
    handshake.finalize().unwrap();

    // A control command encrypted by the client decrypts on the device.
    let control = Message::DataPoints {
        command: CommandType::ControlNew,
        sub_device: None,
        dps: dps(&[(1, serde_json::json!(true))]),
    };
    let wire = client_enc.encode(&control, 3).unwrap();
    let Message::DataPoints { dps: got, .. } = device.decode(&wire) else {
        panic!("wrong message shape");
    };
    assert_eq!(got, dps(&[(1, serde_json::json!(true))]));
}

#[test]
fn tampered_response_aborts_the_exchange() {
    let client_keys = Arc::new(KeyStore::new(TEST_KEY));
    let client_enc = FrameEncoder::new(Version::V3_4, TEST_DEVICE_ID, client_keys.clone());
    let client_dec = FrameDecoder::new(Version::V3_4, client_keys.clone(), true);
    let mut device = FakeDevice::new([0x42u8; 16]);

    let mut handshake = SessionHandshake::new(client_keys.clone());
    let resp = device.answer_start(&client_enc.encode(&handshake.start_message(), 1).unwrap());

    let mut buf = BytesMut::from(&resp[..]);
    let frame = client_dec.decode_frame(&mut buf).unwrap();
    let Message::Raw { payload, .. } = client_dec.decode_message(&frame).unwrap() else {
        panic!("response must be raw");
    };
    // Flip a bit in the device HMAC.
    let mut tampered = payload.to_vec();
    tampered[30] ^= 0x80;
    assert!(handshake.handle_response(&tampered).is_err());
    assert_eq!(client_keys.session_key(), TEST_KEY, "key store untouched");
}
