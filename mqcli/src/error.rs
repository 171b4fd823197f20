use crate::types::ConnectReason;

/// Client-side error taxonomy. Configuration errors are detected before a
/// session starts and are fatal; engine-reported errors are answered with
/// a graceful disconnect rather than a crash.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error("{0}")]
    Config(String),
    #[error("{}", .0.reason_string())]
    ConnectionRefused(ConnectReason),
    #[error("{0}")]
    Engine(String),
    #[error("invalid QoS {0}, must be 0, 1 or 2")]
    InvalidQos(u8),
    #[error("Invalid input. Does your topic contain '+' or '#'?")]
    InvalidTopic,
    #[error("Message payload is too large.")]
    PayloadTooLarge,
    #[error("Client not connected when trying to publish.")]
    NotConnected,
    #[error("Message QoS not supported on broker, try a lower QoS.")]
    QosNotSupported,
    #[error("Out of memory.")]
    OutOfMemory,
}
