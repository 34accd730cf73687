// Protocol constants for the Tuya LAN protocol

use std::time::Duration;

/// Frame prefix magic (big-endian on the wire)
pub const PREFIX: u32 = 0x0000_55AA;

/// Frame suffix magic
pub const SUFFIX: u32 = 0x0000_AA55;

/// Fixed header size: prefix + seq + command + length (4 bytes each)
pub const HEADER_SIZE: usize = 16;

/// Fixed footer size: crc32 + suffix
pub const FOOTER_SIZE: usize = 8;

/// Smallest complete frame: header plus footer around an empty payload
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + FOOTER_SIZE;

/// Upper bound on the length field; anything larger is treated as garbage
pub const MAX_BODY_LENGTH: usize = 64 * 1024;

/// Size of the version header inserted before v3.3 ciphertext ("3.3" + 12 zero bytes)
pub const PROTOCOL_HEADER_SIZE: usize = 15;

/// AES-128 key size
pub const KEY_SIZE: usize = 16;

/// Handshake nonce size
pub const NONCE_SIZE: usize = 16;

/// HMAC-SHA256 output size
pub const HMAC_SIZE: usize = 32;

/// TCP command port on the device
pub const TCP_PORT: u16 = 6668;

/// UDP port for plaintext discovery broadcasts
pub const UDP_PORT_PLAIN: u16 = 6666;

/// UDP port for encrypted discovery broadcasts
pub const UDP_PORT_ENCRYPTED: u16 = 6667;

/// Passphrase hashed with MD5 to obtain the shared discovery key
pub const UDP_KEY_PASSPHRASE: &[u8] = b"yGAdlopoPVldABfn";

/// Timeout for a single TCP connect attempt
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout waiting for the session-key negotiation response
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Write-idle interval after which a heartbeat probe is sent
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Read-idle timeout after which the connection is assumed dead
pub const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Unanswered heartbeat probes tolerated before the connection is closed
pub const MAX_MISSED_HEARTBEATS: u32 = 3;

/// Delay before a reconnect attempt after an unexpected disconnect
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Delay before retrying a failed UDP bind
pub const BIND_RETRY_DELAY: Duration = Duration::from_secs(5);
