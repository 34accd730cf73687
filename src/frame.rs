use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use num_enum::{FromPrimitive, IntoPrimitive};

use crate::error::TuyaError;

/// Command codes carried in the third header field of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u32)]
pub enum CommandType {
    Udp = 0,
    ApConfig = 1,
    Active = 2,
    SessKeyNegStart = 3,
    SessKeyNegResp = 4,
    SessKeyNegFinish = 5,
    Unbind = 6,
    Control = 7,
    Status = 8,
    HeartBeat = 9,
    DpQuery = 10,
    QueryWifi = 11,
    TokenBind = 12,
    ControlNew = 13,
    EnableWifi = 14,
    DpQueryNew = 16,
    SceneExecute = 17,
    DpRefresh = 18,
    UdpNew = 19,
    ApConfigNew = 20,
    BroadcastLpv34 = 35,
    LanExtStream = 64,

    #[num_enum(catch_all)]
    Unknown(u32),
}

impl CommandType {
    /// Whether a v3.3 frame for this command carries the 15-byte version
    /// header in front of the ciphertext. Only status query and refresh go
    /// without it.
    pub fn uses_protocol_header(self) -> bool {
        !matches!(
            self,
            CommandType::DpQuery | CommandType::DpQueryNew | CommandType::DpRefresh
        )
    }

    /// UDP discovery broadcast commands, which follow their own encryption
    /// rules regardless of the device protocol version.
    pub fn is_discovery(self) -> bool {
        matches!(
            self,
            CommandType::Udp | CommandType::UdpNew | CommandType::BroadcastLpv34
        )
    }

    /// Data-point bearing commands whose payload is the JSON envelope with a
    /// `dps` mapping.
    pub fn carries_data_points(self) -> bool {
        matches!(
            self,
            CommandType::Control
                | CommandType::ControlNew
                | CommandType::Status
                | CommandType::DpQuery
                | CommandType::DpQueryNew
        )
    }
}

/// Protocol version tag, fixed per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V3_1,
    V3_3,
    V3_4,
}

impl Version {
    pub fn as_str(self) -> &'static str {
        match self {
            Version::V3_1 => "3.1",
            Version::V3_3 => "3.3",
            Version::V3_4 => "3.4",
        }
    }

    pub fn as_bytes(self) -> &'static [u8; 3] {
        match self {
            Version::V3_1 => b"3.1",
            Version::V3_3 => b"3.3",
            Version::V3_4 => b"3.4",
        }
    }

    /// v3.4 negotiates an ephemeral session key before any data message.
    pub fn requires_handshake(self) -> bool {
        self == Version::V3_4
    }

    /// On v3.4 devices the legacy control/query codes are replaced.
    pub fn effective_command(self, command: CommandType) -> CommandType {
        if self == Version::V3_4 {
            match command {
                CommandType::Control => CommandType::ControlNew,
                CommandType::DpQuery => CommandType::DpQueryNew,
                other => other,
            }
        } else {
            command
        }
    }
}

impl FromStr for Version {
    type Err = TuyaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "3.1" => Ok(Version::V3_1),
            "3.3" => Ok(Version::V3_3),
            "3.4" => Ok(Version::V3_4),
            other => Err(TuyaError::Protocol(format!(
                "unsupported protocol version {other:?}"
            ))),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed wire frame: everything between prefix and suffix, with the
/// checksum already verified and stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u32,
    pub command: CommandType,
    /// Return code embedded by the device in response frames.
    pub ret_code: Option<u32>,
    /// Payload exactly as carried on the wire (possibly encrypted).
    pub payload: Bytes,
}

impl Frame {
    pub fn new(seq: u32, command: CommandType, payload: Bytes) -> Self {
        Self {
            seq,
            command,
            ret_code: None,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_codes_match_wire_values() {
        assert_eq!(u32::from(CommandType::Control), 7);
        assert_eq!(u32::from(CommandType::Status), 8);
        assert_eq!(u32::from(CommandType::HeartBeat), 9);
        assert_eq!(u32::from(CommandType::DpQuery), 10);
        assert_eq!(u32::from(CommandType::SessKeyNegStart), 3);
        assert_eq!(u32::from(CommandType::UdpNew), 19);
        assert_eq!(CommandType::from(13u32), CommandType::ControlNew);
        assert_eq!(CommandType::from(99u32), CommandType::Unknown(99));
    }

    #[test]
    fn header_exemptions() {
        assert!(CommandType::Control.uses_protocol_header());
        assert!(CommandType::HeartBeat.uses_protocol_header());
        assert!(!CommandType::DpQuery.uses_protocol_header());
        assert!(!CommandType::DpQueryNew.uses_protocol_header());
        assert!(!CommandType::DpRefresh.uses_protocol_header());
    }

    #[test]
    fn v34_substitutes_new_commands() {
        assert_eq!(
            Version::V3_4.effective_command(CommandType::Control),
            CommandType::ControlNew
        );
        assert_eq!(
            Version::V3_3.effective_command(CommandType::Control),
            CommandType::Control
        );
    }

    #[test]
    fn version_parse() {
        assert_eq!("3.3".parse::<Version>().unwrap(), Version::V3_3);
        assert!("3.2".parse::<Version>().is_err());
    }
}
