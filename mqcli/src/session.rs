use std::fmt::Write as _;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::time::{sleep, Instant};

use crate::config::{ClientKind, PubMode, SessionConfig};
use crate::engine::{Engine, Event, EventStream};
use crate::error::ClientError;
use crate::format;
use crate::scheduler::RepeatScheduler;
use crate::streamer::{self, StreamStatus};
use crate::topic::TopicFilter;
use crate::types::{AckReason, ConnectReason, Delivery, GrantedQos, Mid, QoS};
use crate::Result;

/// Session flags and mid tracking. Shared between the driver task and the
/// streaming-mode event pump, so everything mutable is an atomic or
/// mutex-guarded: one side flips a flag, the other observes it at the
/// next safe point.
pub(crate) struct Shared {
    /// Cleared by the timeout/stop trigger, the message-count cap and the
    /// retained-only cutoff. Once false, deliveries are no longer
    /// processed and the session heads for disconnect.
    process_messages: AtomicBool,
    connected: AtomicBool,
    disconnect_sent: AtomicBool,
    /// Most recently acknowledged mid (0 = none yet).
    acked_mid: AtomicU32,
    /// Most recently issued mid whose acknowledgment gates the final
    /// disconnect (0 = none).
    gate_mid: AtomicU32,
    status: Mutex<StreamStatus>,
    failure: Mutex<Option<ClientError>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            process_messages: AtomicBool::new(true),
            connected: AtomicBool::new(true),
            disconnect_sent: AtomicBool::new(false),
            acked_mid: AtomicU32::new(0),
            gate_mid: AtomicU32::new(0),
            status: Mutex::new(StreamStatus::Connecting),
            failure: Mutex::new(None),
        }
    }

    #[inline]
    pub(crate) fn processing(&self) -> bool {
        self.process_messages.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn stop(&self) {
        self.process_messages.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn set_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// True exactly once: the first caller wins the right to issue the
    /// disconnect request.
    #[inline]
    pub(crate) fn try_send_disconnect(&self) -> bool {
        self.disconnect_sent.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    #[inline]
    pub(crate) fn disconnect_sent(&self) -> bool {
        self.disconnect_sent.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn set_acked_mid(&self, mid: Mid) {
        self.acked_mid.store(mid as u32, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn acked_mid(&self) -> Option<Mid> {
        match self.acked_mid.load(Ordering::SeqCst) {
            0 => None,
            mid => Some(mid as Mid),
        }
    }

    #[inline]
    pub(crate) fn set_gate_mid(&self, mid: Mid) {
        self.gate_mid.store(mid as u32, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn gate_mid(&self) -> Option<Mid> {
        match self.gate_mid.load(Ordering::SeqCst) {
            0 => None,
            mid => Some(mid as Mid),
        }
    }

    #[inline]
    pub(crate) fn status(&self) -> StreamStatus {
        *self.status.lock()
    }

    #[inline]
    pub(crate) fn set_status(&self, status: StreamStatus) {
        *self.status.lock() = status;
    }

    fn set_failure(&self, e: ClientError) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(e);
        }
    }

    fn take_failure(&self) -> Option<ClientError> {
        self.failure.lock().take()
    }
}

/// Signal-driven stop trigger. Flips the session's processing flag; the
/// driver requests a clean disconnect at the next pump opportunity.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    #[inline]
    pub fn stop(&self) {
        self.shared.stop();
    }
}

/// Event-driven session driver: reacts to each engine notification and
/// decides what protocol command to issue next.
pub struct SessionState {
    kind: ClientKind,
    cfg: Arc<SessionConfig>,
    shared: Arc<Shared>,
    scheduler: RepeatScheduler,
    filter: TopicFilter,
    /// Deliveries rendered so far, compared against the configured cap.
    delivered: u32,
    out: Box<dyn Write + Send>,
}

impl SessionState {
    pub fn new(kind: ClientKind, cfg: SessionConfig) -> Result<Self> {
        let filter = TopicFilter::new(&cfg.filter_outs)?;
        let scheduler = RepeatScheduler::new(cfg.repeat_count, cfg.repeat_delay);
        Ok(Self {
            kind,
            cfg: Arc::new(cfg),
            shared: Arc::new(Shared::new()),
            scheduler,
            filter,
            delivered: 0,
            out: Box::new(io::stdout()),
        })
    }

    pub fn with_output(mut self, out: Box<dyn Write + Send>) -> Self {
        self.out = out;
        self
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle { shared: self.shared.clone() }
    }

    /// Drive the session to completion. Streaming mode moves event
    /// processing onto a background task so standard input can be read
    /// here; every other mode pumps events on this task.
    pub async fn run<E>(self, engine: Arc<E>, events: EventStream) -> Result<()>
    where
        E: Engine + 'static,
    {
        if self.kind == ClientKind::Pub && self.cfg.pub_mode == Some(PubMode::StdinLine) {
            self.run_streaming(engine, events, tokio::io::stdin()).await
        } else {
            self.run_pump(engine.as_ref(), events).await
        }
    }

    async fn run_pump<E>(mut self, engine: &E, mut events: EventStream) -> Result<()>
    where
        E: Engine + ?Sized,
    {
        let far_future = Duration::from_secs(u32::MAX as u64);
        let timeout =
            if self.cfg.timeout > 0 { Duration::from_secs(self.cfg.timeout) } else { far_future };
        let timeout_delay = sleep(timeout);
        tokio::pin!(timeout_delay);

        loop {
            let mut done = false;
            tokio::select! {
                ev = events.recv() => match ev {
                    Some(ev) => {
                        if !self.dispatch(engine, ev).await? {
                            done = true;
                        }
                    }
                    None => done = true,
                },
                _ = sleep(self.scheduler.tick()) => {
                    if self.scheduler.due() {
                        self.publish_configured(engine).await?;
                    }
                }
                _ = &mut timeout_delay => {
                    log::debug!("session timeout reached, stopping");
                    self.shared.stop();
                    timeout_delay.as_mut().reset(Instant::now() + far_future);
                }
            }
            if done {
                break;
            }
            // stop trigger observed: disconnect at the next safe point,
            // unless a pending publish still gates the shutdown
            if !self.shared.processing()
                && !self.shared.disconnect_sent()
                && self.shared.gate_mid().is_none()
            {
                self.request_disconnect(engine).await;
            }
        }

        if let Some(e) = self.shared.take_failure() {
            return Err(e.into());
        }
        Ok(())
    }

    async fn run_streaming<E, R>(self, engine: Arc<E>, events: EventStream, input: R) -> Result<()>
    where
        E: Engine + 'static,
        R: AsyncRead + Unpin,
    {
        let pump =
            tokio::spawn(pump_events(self.cfg.clone(), self.shared.clone(), engine.clone(), events));
        streamer::run(&self.cfg, &self.shared, engine.as_ref(), input).await?;
        pump.await??;

        if let Some(e) = self.shared.take_failure() {
            return Err(e.into());
        }
        Ok(())
    }

    /// One event, one handler. Events for a session arrive strictly in
    /// order and a handler runs to completion before the next dispatch.
    /// Returns false once the session reached its terminal state.
    async fn dispatch<E>(&mut self, engine: &E, ev: Event) -> Result<bool>
    where
        E: Engine + ?Sized,
    {
        log::debug!("event: {:?}", ev);
        match ev {
            Event::ConnAck { reason, session_present } => {
                self.on_connect(engine, reason, session_present).await?
            }
            Event::PubAck { mid, reason } => self.on_puback(engine, mid, reason).await?,
            Event::Message(msg) => self.on_message(engine, msg).await?,
            Event::SubAck { mid, granted } => self.on_suback(engine, mid, granted).await?,
            Event::Disconnected { reason } => {
                self.on_disconnected(reason);
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn on_connect<E>(
        &mut self,
        engine: &E,
        reason: ConnectReason,
        session_present: bool,
    ) -> Result<()>
    where
        E: Engine + ?Sized,
    {
        if !reason.is_success() {
            if !self.cfg.quiet {
                log::error!("{}", reason.reason_string());
            }
            self.shared.set_failure(ClientError::ConnectionRefused(reason));
            self.shared.stop();
            self.request_disconnect(engine).await;
            return Ok(());
        }
        log::debug!("connected, session_present: {}", session_present);

        match self.kind {
            ClientKind::Pub => match self.cfg.pub_mode {
                Some(PubMode::Message | PubMode::File | PubMode::StdinWhole | PubMode::Null) => {
                    self.publish_configured(engine).await?;
                }
                Some(PubMode::StdinLine) => self.shared.set_status(StreamStatus::ReadyToRead),
                None => {}
            },
            ClientKind::Sub => {
                engine.subscribe(&self.cfg.topics, self.cfg.qos).await?;
                for unsub_topic in &self.cfg.unsub_topics {
                    engine.unsubscribe(unsub_topic).await?;
                }
            }
        }
        Ok(())
    }

    async fn on_puback<E>(&mut self, engine: &E, mid: Mid, reason: AckReason) -> Result<()>
    where
        E: Engine + ?Sized,
    {
        self.shared.set_acked_mid(mid);
        if reason.is_error() && !self.cfg.quiet {
            log::warn!("Publish {} failed: {}.", mid, reason.reason_string());
        }
        match self.kind {
            ClientKind::Sub => {
                // a pending retained-clearing publish gates the disconnect
                if !self.shared.processing()
                    && (self.shared.gate_mid() == Some(mid) || self.shared.gate_mid().is_none())
                {
                    self.request_disconnect(engine).await;
                }
            }
            ClientKind::Pub => {
                if self.scheduler.on_acked() {
                    log::debug!("publish {} acknowledged, repeat armed", mid);
                } else if !self.shared.disconnect_sent() {
                    self.request_disconnect(engine).await;
                }
            }
        }
        Ok(())
    }

    async fn on_message<E>(&mut self, engine: &E, msg: Delivery) -> Result<()>
    where
        E: Engine + ?Sized,
    {
        if !self.shared.processing() {
            return Ok(());
        }

        if self.cfg.remove_retained && msg.retain {
            // clear the broker's retained copy of this topic
            match engine.publish(&msg.topic, Bytes::new(), QoS::AtLeastOnce, true).await {
                Ok(mid) => self.shared.set_gate_mid(mid),
                Err(e) => {
                    if !self.cfg.quiet {
                        log::warn!("failed to clear retained message on {}: {}", msg.topic, e);
                    }
                }
            }
        }

        if self.cfg.retained_only && !msg.retain {
            // the first live message ends a retained-only session
            self.shared.stop();
            if self.shared.gate_mid().is_none() {
                self.request_disconnect(engine).await;
            }
            return Ok(());
        }

        if msg.retain && self.cfg.no_retain {
            return Ok(());
        }
        if self.filter.is_excluded(&msg.topic) {
            return Ok(());
        }

        format::print_message(self.out.as_mut(), &self.cfg, &msg)?;

        if self.cfg.msg_count > 0 {
            self.delivered += 1;
            if self.delivered == self.cfg.msg_count {
                self.shared.stop();
                if self.shared.gate_mid().is_none() {
                    self.request_disconnect(engine).await;
                }
            }
        }
        Ok(())
    }

    async fn on_suback<E>(&mut self, engine: &E, mid: Mid, granted: Vec<GrantedQos>) -> Result<()>
    where
        E: Engine + ?Sized,
    {
        if !self.cfg.quiet {
            let mut line = format!("Subscribed (mid: {})", mid);
            for (i, qos) in granted.iter().enumerate() {
                let sep = if i == 0 { ": " } else { ", " };
                let _ = write!(line, "{}{}", sep, qos);
            }
            writeln!(self.out, "{}", line)?;
            self.out.flush()?;
        }
        if self.cfg.exit_after_sub {
            self.request_disconnect(engine).await;
        }
        Ok(())
    }

    fn on_disconnected(&mut self, reason: Option<String>) {
        self.shared.set_disconnected();
        if let Some(reason) = reason {
            if !self.shared.disconnect_sent() {
                if !self.cfg.quiet {
                    log::error!("{}", reason);
                }
                self.shared.set_failure(ClientError::Engine(reason));
            }
        }
    }

    /// Publish the configured command/file/null payload; used for the
    /// initial publish and every scheduled repeat.
    async fn publish_configured<E>(&mut self, engine: &E) -> Result<()>
    where
        E: Engine + ?Sized,
    {
        let payload = match self.cfg.pub_mode {
            Some(PubMode::Null) => Bytes::new(),
            Some(PubMode::Message | PubMode::File | PubMode::StdinWhole) => {
                Bytes::from(self.cfg.message.clone())
            }
            _ => return Ok(()),
        };
        let topic = match &self.cfg.topic {
            Some(topic) => topic.clone(),
            None => return Ok(()),
        };
        self.scheduler.note_publish();
        match engine.publish(&topic, payload, self.cfg.qos, self.cfg.retain).await {
            Ok(mid) => log::debug!("publish issued, mid: {}", mid),
            Err(e) => {
                if !self.cfg.quiet {
                    log::error!("{}", e);
                }
                self.request_disconnect(engine).await;
            }
        }
        Ok(())
    }

    async fn request_disconnect<E>(&self, engine: &E)
    where
        E: Engine + ?Sized,
    {
        if self.shared.try_send_disconnect() {
            if let Err(e) = engine.disconnect().await {
                log::debug!("disconnect request failed: {:?}", e);
                self.shared.set_disconnected();
            }
        }
    }
}

/// Background event pump for streaming mode: services acknowledgments and
/// the connection lifecycle while the driver task reads standard input.
async fn pump_events<E>(
    cfg: Arc<SessionConfig>,
    shared: Arc<Shared>,
    engine: Arc<E>,
    mut events: EventStream,
) -> Result<()>
where
    E: Engine + 'static,
{
    while let Some(ev) = events.recv().await {
        match ev {
            Event::ConnAck { reason, .. } => {
                if reason.is_success() {
                    shared.set_status(StreamStatus::ReadyToRead);
                } else {
                    if !cfg.quiet {
                        log::error!("{}", reason.reason_string());
                    }
                    shared.set_failure(ClientError::ConnectionRefused(reason));
                    shared.stop();
                    shared.set_disconnected();
                    break;
                }
            }
            Event::PubAck { mid, reason } => {
                shared.set_acked_mid(mid);
                if reason.is_error() && !cfg.quiet {
                    log::warn!("Publish {} failed: {}.", mid, reason.reason_string());
                }
                // the final line's ack drains the session
                if shared.gate_mid() == Some(mid) && shared.try_send_disconnect() {
                    if let Err(e) = engine.disconnect().await {
                        log::debug!("disconnect request failed: {:?}", e);
                        shared.set_disconnected();
                    }
                }
            }
            Event::Disconnected { reason } => {
                if let Some(reason) = reason {
                    if !shared.disconnect_sent() {
                        if !cfg.quiet {
                            log::error!("{}", reason);
                        }
                        shared.set_failure(ClientError::Engine(reason));
                    }
                }
                shared.set_disconnected();
                break;
            }
            Event::Message(_) | Event::SubAck { .. } => {}
        }
    }
    shared.set_disconnected();
    Ok(())
}

/// Connect, subscribe to one topic, wait for `count` deliveries, then
/// disconnect and return them.
pub async fn subscribe_simple<E>(
    engine: &E,
    mut events: EventStream,
    topic: &str,
    qos: QoS,
    count: usize,
) -> Result<Vec<Delivery>>
where
    E: Engine + ?Sized,
{
    let topics = vec![topic.to_string()];
    let mut collected = Vec::with_capacity(count);
    while let Some(ev) = events.recv().await {
        match ev {
            Event::ConnAck { reason, .. } => {
                if !reason.is_success() {
                    return Err(ClientError::ConnectionRefused(reason).into());
                }
                engine.subscribe(&topics, qos).await?;
            }
            Event::Message(msg) => {
                if collected.len() < count {
                    collected.push(msg);
                }
                if collected.len() >= count {
                    let _ = engine.disconnect().await;
                }
            }
            Event::Disconnected { reason } => {
                if collected.len() < count {
                    return Err(anyhow!(reason
                        .unwrap_or_else(|| "connection closed before all messages arrived".into())));
                }
                break;
            }
            _ => {}
        }
    }
    Ok(collected)
}
