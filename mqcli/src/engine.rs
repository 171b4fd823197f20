use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::types::{AckReason, ConnectReason, Delivery, GrantedQos, Mid, QoS};
use crate::Result;

/// Imperative half of the external protocol engine. The engine owns the
/// wire protocol, TLS and socket I/O; the session driver only issues
/// commands and reacts to [`Event`]s.
///
/// The connection itself is established when the engine is built; the
/// first event a session observes is the connection result.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Publish one message, returning the engine-assigned mid.
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<Mid>;

    /// Subscribe to all `topics` with a single multi-topic request.
    async fn subscribe(&self, topics: &[String], qos: QoS) -> Result<()>;

    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Request a clean disconnect.
    async fn disconnect(&self) -> Result<()>;
}

/// Engine notifications, delivered strictly in arrival order. A handler
/// runs to completion before the next event for the same session is
/// dispatched.
#[derive(Debug, Clone)]
pub enum Event {
    /// The connection attempt finished.
    ConnAck { reason: ConnectReason, session_present: bool },
    /// An outgoing publish was acknowledged.
    PubAck { mid: Mid, reason: AckReason },
    /// A subscribed message arrived.
    Message(Delivery),
    /// The broker answered a subscribe request.
    SubAck { mid: Mid, granted: Vec<GrantedQos> },
    /// The connection ended; `reason` is set when the engine reports an
    /// error rather than a negotiated shutdown.
    Disconnected { reason: Option<String> },
}

pub type EventSender = mpsc::Sender<Event>;
pub type EventStream = mpsc::Receiver<Event>;
