//! DAP client transport: Content-Length framed JSON over TCP.
//!
//! A reader task owns the read half of the stream, correlates responses to
//! in-flight requests by `request_seq` and forwards events to the dispatcher.
//! The write half is shared behind a lock so concurrent script runners can
//! issue requests against the same session.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::config::DebuggerConfig;
use crate::error::{DebuggerError, Result};
use crate::protocol::{Event, ProtocolMessage, Request, Response};

/// A session over which protocol requests can be sent.
///
/// The engine only needs one primitive: a round trip that resolves to the
/// response body or to an error when the response carries a failure. Events
/// arrive out-of-band on the channel handed out at connection time.
#[async_trait]
pub trait DapTransport: Send + Sync {
    async fn request(&self, command: &str, arguments: Option<Value>) -> Result<Value>;
}

type InflightMap = Arc<DashMap<i64, oneshot::Sender<Response>>>;

pub struct TcpTransport {
    writer: Mutex<OwnedWriteHalf>,
    seq: AtomicI64,
    inflight: InflightMap,
    closed: Arc<AtomicBool>,
}

impl TcpTransport {
    /// Opens the connection to the debug adapter. The socket might take a
    /// while to appear, so attempts are retried with a fixed delay up to the
    /// configured ceiling.
    pub async fn connect(
        config: &DebuggerConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Event>)> {
        for attempt in 0..config.connect_attempts {
            match TcpStream::connect((config.host.as_str(), config.port)).await {
                Ok(stream) => {
                    debug!(attempt, "connected to debug adapter");
                    return Ok(Self::attach(stream));
                }
                Err(err) => {
                    debug!(attempt, %err, "connection attempt failed");
                    tokio::time::sleep(config.connect_retry_delay()).await;
                }
            }
        }
        Err(DebuggerError::Connection(format!(
            "Unable to connect to debugger at {}:{}",
            config.host, config.port
        )))
    }

    /// Binds a transport to an already-open stream and starts the reader
    /// task. Returns the transport and the event channel.
    pub fn attach(stream: TcpStream) -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (reader, writer) = stream.into_split();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let inflight: InflightMap = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(read_loop(reader, inflight.clone(), event_tx, closed.clone()));

        let transport = Arc::new(Self {
            writer: Mutex::new(writer),
            seq: AtomicI64::new(1),
            inflight,
            closed,
        });
        (transport, event_rx)
    }

    async fn write_message(&self, msg: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let header = format!("Content-Length: {}\r\n\r\n", msg.len());
        writer.write_all(header.as_bytes()).await?;
        writer.write_all(msg.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl DapTransport for TcpTransport {
    async fn request(&self, command: &str, arguments: Option<Value>) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DebuggerError::Connection(format!(
                "Session closed before {command} request"
            )));
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inflight.insert(seq, tx);

        // The reader may have exited between the check above and the insert;
        // it sets the flag before clearing the map, so re-checking here
        // guarantees the sender cannot be parked in a dead map.
        if self.closed.load(Ordering::SeqCst) {
            self.inflight.remove(&seq);
            return Err(DebuggerError::Connection(format!(
                "Session closed before {command} request"
            )));
        }

        let msg = serde_json::to_string(&ProtocolMessage::Request(Request {
            seq,
            command: command.to_string(),
            arguments,
        }))?;

        if let Err(err) = self.write_message(&msg).await {
            self.inflight.remove(&seq);
            return Err(err);
        }

        let response = rx.await.map_err(|_| {
            DebuggerError::Connection(format!("Session closed before {command} response"))
        })?;

        if response.success {
            Ok(response.body.unwrap_or(Value::Null))
        } else {
            Err(DebuggerError::Protocol(
                response
                    .message
                    .unwrap_or_else(|| format!("{command} request failed")),
            ))
        }
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    inflight: InflightMap,
    events: mpsc::UnboundedSender<Event>,
    closed: Arc<AtomicBool>,
) {
    loop {
        let msg = match read_message(&mut reader).await {
            Ok(msg) => msg,
            Err(err) => {
                debug!(%err, "session read loop ended");
                break;
            }
        };
        match serde_json::from_str::<ProtocolMessage>(&msg) {
            Ok(ProtocolMessage::Response(response)) => {
                if let Some((_, tx)) = inflight.remove(&response.request_seq) {
                    let _ = tx.send(response);
                } else {
                    warn!(request_seq = response.request_seq, "response with no in-flight request");
                }
            }
            Ok(ProtocolMessage::Event(event)) => {
                let _ = events.send(event);
            }
            Ok(ProtocolMessage::Request(request)) => {
                // Reverse requests are not part of the consumed surface.
                warn!(command = %request.command, "ignoring reverse request");
            }
            Err(err) => {
                warn!(%err, "failed to parse incoming message");
            }
        }
    }
    // Flag first, then wake every waiter; the session is gone and late
    // requests must not wait on it.
    closed.store(true, Ordering::SeqCst);
    inflight.clear();
}

/// Reads one message: headers terminated by a blank line, then a JSON body
/// of Content-Length bytes.
async fn read_message(reader: &mut OwnedReadHalf) -> Result<String> {
    let mut headers = String::new();
    let mut buf = [0u8; 1];

    loop {
        reader.read_exact(&mut buf).await?;
        headers.push(buf[0] as char);
        if headers.ends_with("\r\n\r\n") {
            break;
        }
    }

    let content_length = headers
        .lines()
        .find(|line| line.starts_with("Content-Length:"))
        .and_then(|line| line.split(':').nth(1))
        .and_then(|s| s.trim().parse::<usize>().ok())
        .ok_or_else(|| DebuggerError::Protocol("Missing Content-Length header".to_string()))?;

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;

    String::from_utf8(body)
        .map_err(|err| DebuggerError::Protocol(format!("Invalid UTF-8 in message body: {err}")))
}
