use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Engine-assigned message identifier correlating a publish request with
/// its later acknowledgment. Unique per in-flight publish.
pub type Mid = u16;

/// Delivery guarantee level for one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    #[inline]
    pub fn value(&self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = ClientError;

    #[inline]
    fn try_from(qos: u8) -> Result<Self, Self::Error> {
        match qos {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ClientError::InvalidQos(qos)),
        }
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// One inbound message as delivered by the engine. Lives only for the
/// duration of the handler invocation that receives it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub mid: Mid,
}

/// Result of a connection attempt as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReason {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadCredentials,
    NotAuthorized,
    Other(u8),
}

impl ConnectReason {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, ConnectReason::Accepted)
    }

    pub fn reason_string(&self) -> &'static str {
        match self {
            ConnectReason::Accepted => "Connection Accepted.",
            ConnectReason::UnacceptableProtocolVersion => {
                "Connection Refused: unacceptable protocol version."
            }
            ConnectReason::IdentifierRejected => "Connection Refused: identifier rejected.",
            ConnectReason::ServerUnavailable => "Connection Refused: broker unavailable.",
            ConnectReason::BadCredentials => "Connection Refused: bad user name or password.",
            ConnectReason::NotAuthorized => "Connection Refused: not authorised.",
            ConnectReason::Other(_) => "Connection Refused: unknown reason.",
        }
    }
}

impl fmt::Display for ConnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason_string())
    }
}

/// Reason code carried on a publish acknowledgment. Codes of 0x80 and
/// above report failure; engines speaking MQTT v3 always report 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckReason(pub u8);

impl AckReason {
    #[inline]
    pub fn is_error(&self) -> bool {
        self.0 >= 0x80
    }

    pub fn reason_string(&self) -> &'static str {
        match self.0 {
            0x00 => "Success",
            0x10 => "No matching subscribers",
            0x80 => "Unspecified error",
            0x83 => "Implementation specific error",
            0x87 => "Not authorized",
            0x90 => "Topic Name invalid",
            0x91 => "Packet Identifier in use",
            0x97 => "Quota exceeded",
            0x99 => "Payload format invalid",
            _ => "Unknown reason",
        }
    }
}

impl fmt::Display for AckReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason_string())
    }
}

/// Per-topic outcome of a subscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantedQos {
    Granted(QoS),
    Failure,
}

impl GrantedQos {
    #[inline]
    pub fn value(&self) -> u8 {
        match self {
            GrantedQos::Granted(qos) => qos.value(),
            GrantedQos::Failure => 0x80,
        }
    }
}

impl fmt::Display for GrantedQos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}
