use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event as EngineNotification, EventLoop,
    Incoming, LastWill, MqttOptions, Outgoing, QoS as EngineQoS, SubscribeFilter,
    SubscribeReasonCode,
};

use crate::config::SessionConfig;
use crate::engine::{Engine, Event, EventSender, EventStream};
use crate::types::{AckReason, ConnectReason, Delivery, GrantedQos, Mid, QoS};
use crate::Result;

const EVENT_CHANNEL_CAP: usize = 64;
const REQUEST_CAP: usize = 10;

/// Build the engine from a session configuration and start its event
/// pump. The engine owns connection establishment, so the first event a
/// session observes is the connection result.
pub fn connect(cfg: &SessionConfig) -> (RumqttEngine, EventStream) {
    let mut options = MqttOptions::new(cfg.client_id(), cfg.host.clone(), cfg.port);
    options.set_keep_alive(Duration::from_secs(cfg.keepalive as u64));
    options.set_clean_session(cfg.clean_session);
    options.set_inflight(cfg.max_inflight);
    if let Some(username) = &cfg.username {
        options.set_credentials(username.clone(), cfg.password.clone().unwrap_or_default());
    }
    if let Some(will_topic) = &cfg.will_topic {
        options.set_last_will(LastWill::new(
            will_topic.clone(),
            cfg.will_payload.clone().unwrap_or_default(),
            to_engine_qos(cfg.will_qos),
            cfg.will_retain,
        ));
    }

    let (client, event_loop) = AsyncClient::new(options, REQUEST_CAP);
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAP);
    let mids = Arc::new(MidTracker::default());
    tokio::spawn(pump(event_loop, tx, mids.clone()));
    (RumqttEngine { client, mids }, rx)
}

/// Driver-side mid bookkeeping. The engine assigns packet ids only when a
/// request reaches its event loop, so submitted publishes queue here until
/// the matching outgoing notification claims them, oldest first.
#[derive(Default)]
struct MidTracker {
    next: Mutex<Mid>,
    /// Publishes submitted but not yet claimed by an outgoing notification.
    pending: Mutex<VecDeque<(Mid, QoS)>>,
    /// Engine packet id -> mid for in-flight QoS 1/2 publishes.
    inflight: Mutex<Vec<(u16, Mid)>>,
}

impl MidTracker {
    fn next_mid(&self) -> Mid {
        let mut next = self.next.lock();
        *next = next.wrapping_add(1);
        if *next == 0 {
            *next = 1;
        }
        *next
    }

    fn claim(&self) -> Option<(Mid, QoS)> {
        self.pending.lock().pop_front()
    }

    fn complete(&self, pkid: u16) -> Option<Mid> {
        let mut inflight = self.inflight.lock();
        inflight.iter().position(|(p, _)| *p == pkid).map(|at| inflight.swap_remove(at).1)
    }
}

/// rumqttc-backed implementation of the protocol engine seam.
pub struct RumqttEngine {
    client: AsyncClient,
    mids: Arc<MidTracker>,
}

#[async_trait]
impl Engine for RumqttEngine {
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<Mid> {
        let mid = self.mids.next_mid();
        self.mids.pending.lock().push_back((mid, qos));
        if let Err(e) = self.client.publish(topic, to_engine_qos(qos), retain, payload.to_vec()).await
        {
            self.mids.pending.lock().pop_back();
            return Err(e.into());
        }
        Ok(mid)
    }

    async fn subscribe(&self, topics: &[String], qos: QoS) -> Result<()> {
        let filters: Vec<SubscribeFilter> =
            topics.iter().map(|t| SubscribeFilter::new(t.clone(), to_engine_qos(qos))).collect();
        self.client.subscribe_many(filters).await?;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.client.unsubscribe(topic).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await?;
        Ok(())
    }
}

/// Translate the engine's notifications into session [`Event`]s until the
/// connection ends or the session drops its receiver.
async fn pump(mut event_loop: EventLoop, tx: EventSender, mids: Arc<MidTracker>) {
    loop {
        match event_loop.poll().await {
            Ok(EngineNotification::Incoming(packet)) => {
                let ev = match packet {
                    Incoming::ConnAck(ack) => Some(Event::ConnAck {
                        reason: from_return_code(ack.code),
                        session_present: ack.session_present,
                    }),
                    Incoming::Publish(publish) => Some(Event::Message(Delivery {
                        topic: publish.topic.clone(),
                        payload: publish.payload.clone(),
                        qos: from_engine_qos(publish.qos),
                        retain: publish.retain,
                        mid: publish.pkid,
                    })),
                    Incoming::PubAck(ack) => mids
                        .complete(ack.pkid)
                        .map(|mid| Event::PubAck { mid, reason: AckReason::default() }),
                    // a QoS 2 publish completes at PUBCOMP
                    Incoming::PubComp(comp) => mids
                        .complete(comp.pkid)
                        .map(|mid| Event::PubAck { mid, reason: AckReason::default() }),
                    Incoming::SubAck(ack) => Some(Event::SubAck {
                        mid: ack.pkid,
                        granted: ack.return_codes.iter().map(|c| from_subscribe_code(*c)).collect(),
                    }),
                    Incoming::Disconnect => Some(Event::Disconnected {
                        reason: Some("server closed the connection".into()),
                    }),
                    _ => None,
                };
                if let Some(ev) = ev {
                    if tx.send(ev).await.is_err() {
                        return;
                    }
                }
            }
            Ok(EngineNotification::Outgoing(Outgoing::Publish(pkid))) => {
                // the engine assigned a packet id to the oldest submitted publish
                if let Some((mid, qos)) = mids.claim() {
                    if qos == QoS::AtMostOnce {
                        // nothing to wait for on the wire: report completion now
                        if tx.send(Event::PubAck { mid, reason: AckReason::default() }).await.is_err()
                        {
                            return;
                        }
                    } else {
                        mids.inflight.lock().push((pkid, mid));
                    }
                }
            }
            Ok(EngineNotification::Outgoing(Outgoing::Disconnect)) => {
                let _ = tx.send(Event::Disconnected { reason: None }).await;
                return;
            }
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => {
                let _ = tx
                    .send(Event::ConnAck {
                        reason: from_return_code(code),
                        session_present: false,
                    })
                    .await;
                let _ = tx.send(Event::Disconnected { reason: None }).await;
                return;
            }
            Err(e) => {
                let _ = tx.send(Event::Disconnected { reason: Some(e.to_string()) }).await;
                return;
            }
        }
    }
}

fn to_engine_qos(qos: QoS) -> EngineQoS {
    match qos {
        QoS::AtMostOnce => EngineQoS::AtMostOnce,
        QoS::AtLeastOnce => EngineQoS::AtLeastOnce,
        QoS::ExactlyOnce => EngineQoS::ExactlyOnce,
    }
}

fn from_engine_qos(qos: EngineQoS) -> QoS {
    match qos {
        EngineQoS::AtMostOnce => QoS::AtMostOnce,
        EngineQoS::AtLeastOnce => QoS::AtLeastOnce,
        EngineQoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn from_return_code(code: ConnectReturnCode) -> ConnectReason {
    match code {
        ConnectReturnCode::Success => ConnectReason::Accepted,
        ConnectReturnCode::RefusedProtocolVersion => ConnectReason::UnacceptableProtocolVersion,
        ConnectReturnCode::BadClientId => ConnectReason::IdentifierRejected,
        ConnectReturnCode::ServiceUnavailable => ConnectReason::ServerUnavailable,
        ConnectReturnCode::BadUserNamePassword => ConnectReason::BadCredentials,
        ConnectReturnCode::NotAuthorized => ConnectReason::NotAuthorized,
    }
}

fn from_subscribe_code(code: SubscribeReasonCode) -> GrantedQos {
    match code {
        SubscribeReasonCode::Success(qos) => GrantedQos::Granted(from_engine_qos(qos)),
        SubscribeReasonCode::Failure => GrantedQos::Failure,
    }
}
