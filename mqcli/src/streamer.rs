use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::SessionConfig;
use crate::engine::Engine;
use crate::error::ClientError;
use crate::session::Shared;
use crate::types::Mid;
use crate::Result;

const LINE_BUF_SIZE: usize = 1024;

/// Interval for the connect-wait and final-acknowledgment polls.
const WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// Streaming-session connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Connecting,
    ReadyToRead,
    WaitingLastAck,
    Disconnecting,
}

/// Incremental newline-terminated line reader over a growable buffer.
/// When a chunk arrives without a newline the buffer grows in place and
/// reading resumes where it left off; no bytes are duplicated or dropped
/// across a grow.
pub struct LineReader<R> {
    src: R,
    buf: Vec<u8>,
    scratch: Vec<u8>,
    scanned: usize,
}

impl<R> LineReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(src: R) -> Self {
        Self { src, buf: Vec::with_capacity(LINE_BUF_SIZE), scratch: vec![0u8; LINE_BUF_SIZE], scanned: 0 }
    }

    /// Next line with the trailing newline stripped; `Ok(None)` at end of
    /// input. An unterminated tail is not a line and is discarded.
    pub async fn next_line(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(pos) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') {
                let pos = self.scanned + pos;
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop();
                self.scanned = 0;
                return Ok(Some(line));
            }
            self.scanned = self.buf.len();

            self.buf.try_reserve(LINE_BUF_SIZE).map_err(|_| ClientError::OutOfMemory)?;
            let n = self.src.read(&mut self.scratch).await?;
            if n == 0 {
                if !self.buf.is_empty() {
                    log::debug!("discarding {} bytes of unterminated input", self.buf.len());
                    self.buf.clear();
                    self.scanned = 0;
                }
                return Ok(None);
            }
            self.buf.extend_from_slice(&self.scratch[..n]);
        }
    }
}

/// Publish every line of `input` as its own message, then wait for the
/// final acknowledgment before requesting the disconnect. Runs on the
/// driver task while a background pump services protocol events.
pub(crate) async fn run<E, R>(
    cfg: &SessionConfig,
    shared: &Shared,
    engine: &E,
    input: R,
) -> Result<()>
where
    E: Engine + ?Sized,
    R: AsyncRead + Unpin,
{
    // nothing to read until the connect result arrives
    while shared.connected() && shared.status() == StreamStatus::Connecting {
        tokio::time::sleep(WAIT_INTERVAL).await;
    }

    let topic = match &cfg.topic {
        Some(topic) => topic.as_str(),
        None => return Err(ClientError::Config("no publish topic configured".into()).into()),
    };

    let mut reader = LineReader::new(input);
    let mut last_line_mid: Option<Mid> = None;
    // a stop request ends the read loop at the next line boundary
    while shared.connected() && shared.processing() {
        match reader.next_line().await? {
            Some(line) => {
                match engine.publish(topic, Bytes::from(line), cfg.qos, cfg.retain).await {
                    Ok(mid) => last_line_mid = Some(mid),
                    Err(e) => {
                        if !cfg.quiet {
                            log::error!("Publish returned an error, disconnecting: {}", e);
                        }
                        shared.set_status(StreamStatus::Disconnecting);
                        request_disconnect(shared, engine).await;
                        drain(shared).await;
                        return Ok(());
                    }
                }
            }
            None => break,
        }
    }

    match last_line_mid {
        None => {
            // empty input: nothing was ever published
            shared.set_status(StreamStatus::Disconnecting);
            request_disconnect(shared, engine).await;
        }
        Some(mid) => {
            shared.set_gate_mid(mid);
            shared.set_status(StreamStatus::WaitingLastAck);
            while shared.connected() {
                if shared.acked_mid() == Some(mid) || !shared.processing() {
                    request_disconnect(shared, engine).await;
                }
                tokio::time::sleep(WAIT_INTERVAL).await;
            }
        }
    }
    drain(shared).await;
    Ok(())
}

async fn request_disconnect<E: Engine + ?Sized>(shared: &Shared, engine: &E) {
    if shared.try_send_disconnect() {
        if let Err(e) = engine.disconnect().await {
            log::debug!("disconnect request failed: {:?}", e);
            shared.set_disconnected();
        }
    }
}

async fn drain(shared: &Shared) {
    while shared.connected() {
        tokio::time::sleep(WAIT_INTERVAL).await;
    }
}
