//! Control-link message framing.
//!
//! Every message is serialized to JSON, base64-encoded and terminated by a
//! newline. The base64 layer guarantees a frame never contains the terminator,
//! so no length prefix is needed.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf},
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::remote::tunnel::{
    addr::{AddrError, Address},
    token,
    transport::BoxedStream,
};

pub const MAX_FRAME_BYTES: usize = 1 << 20; // 1 MiB
const MESSAGE_ID_LEN: usize = 16;
const RECEIVE_QUEUE_DEPTH: usize = 1;
// Serialized form of "no deadline".
const ZERO_TIME: &str = "0001-01-01T00:00:00Z";

const TYPE_CREATE: &str = "create";
const TYPE_WRITE: &str = "write";
const TYPE_CLOSE: &str = "close";
const TYPE_SET_DEADLINE: &str = "set_deadline";
const TYPE_SET_READ_DEADLINE: &str = "set_read_deadline";
const TYPE_SET_WRITE_DEADLINE: &str = "set_write_deadline";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("address: {0}")]
    Addr(#[from] AddrError),
    #[error("deadline: {0}")]
    Deadline(#[from] chrono::ParseError),
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("frame exceeds {MAX_FRAME_BYTES} bytes")]
    FrameTooLarge,
    #[error("control link closed")]
    LinkClosed,
}

impl ProtocolError {
    /// Errors confined to one well-formed frame; the link can carry on.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProtocolError::UnknownType(_) | ProtocolError::Addr(_))
    }
}

/// Which deadline of the remote socket a deadline message targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineKind {
    Both,
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Create { remote: Address, local: Address },
    Write(Bytes),
    Close,
    SetDeadline {
        kind: DeadlineKind,
        deadline: Option<SystemTime>,
    },
}

impl Payload {
    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::Create { .. } => TYPE_CREATE,
            Payload::Write(_) => TYPE_WRITE,
            Payload::Close => TYPE_CLOSE,
            Payload::SetDeadline { kind, .. } => match kind {
                DeadlineKind::Both => TYPE_SET_DEADLINE,
                DeadlineKind::Read => TYPE_SET_READ_DEADLINE,
                DeadlineKind::Write => TYPE_SET_WRITE_DEADLINE,
            },
        }
    }
}

/// One control-link message.
///
/// `id` is a fresh random token per message. For `create` it doubles as the id
/// of the connection being created, so `conn_id == id` there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub conn_id: String,
    pub payload: Payload,
}

impl Message {
    pub fn create(remote: Address, local: Address) -> Self {
        let id = token::chars(MESSAGE_ID_LEN);
        Self {
            conn_id: id.clone(),
            id,
            payload: Payload::Create { remote, local },
        }
    }

    pub fn write(conn_id: &str, data: Bytes) -> Self {
        Self::with_payload(conn_id, Payload::Write(data))
    }

    pub fn close(conn_id: &str) -> Self {
        Self::with_payload(conn_id, Payload::Close)
    }

    pub fn deadline(conn_id: &str, kind: DeadlineKind, deadline: Option<SystemTime>) -> Self {
        Self::with_payload(conn_id, Payload::SetDeadline { kind, deadline })
    }

    fn with_payload(conn_id: &str, payload: Payload) -> Self {
        Self {
            id: token::chars(MESSAGE_ID_LEN),
            conn_id: conn_id.to_string(),
            payload,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    data: WireData,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireData {
    #[serde(default)]
    id: String,
    // base64 text; null when the message carries no bytes
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    deadline: String,
    #[serde(default)]
    close: bool,
}

fn format_deadline(t: Option<SystemTime>) -> String {
    match t {
        Some(t) => humantime::format_rfc3339_nanos(t).to_string(),
        None => ZERO_TIME.to_string(),
    }
}

fn parse_deadline(s: &str) -> Result<Option<SystemTime>, ProtocolError> {
    let s = s.trim();
    if s.is_empty() || s.starts_with("0001-01-01T00:00:00") {
        return Ok(None);
    }
    Ok(Some(DateTime::parse_from_rfc3339(s)?.into()))
}

impl From<&Message> for WireMessage {
    fn from(msg: &Message) -> Self {
        let mut data = WireData {
            id: msg.conn_id.clone(),
            deadline: ZERO_TIME.to_string(),
            ..WireData::default()
        };
        match &msg.payload {
            Payload::Create { remote, local } => {
                data.id = remote.encode();
                data.data = Some(STANDARD.encode(local.encode()));
            }
            Payload::Write(b) => data.data = Some(STANDARD.encode(b)),
            Payload::Close => data.close = true,
            Payload::SetDeadline { deadline, .. } => data.deadline = format_deadline(*deadline),
        }
        WireMessage {
            id: msg.id.clone(),
            kind: msg.payload.type_name().to_string(),
            data,
        }
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = ProtocolError;

    fn try_from(w: WireMessage) -> Result<Self, Self::Error> {
        let bytes = match w.data.data.as_deref() {
            Some(b64) => Bytes::from(STANDARD.decode(b64)?),
            None => Bytes::new(),
        };
        let deadline = |kind| -> Result<Payload, ProtocolError> {
            Ok(Payload::SetDeadline {
                kind,
                deadline: parse_deadline(&w.data.deadline)?,
            })
        };
        let (conn_id, payload) = match w.kind.as_str() {
            TYPE_CREATE => {
                let local = String::from_utf8(bytes.to_vec()).map_err(AddrError::from)?;
                let payload = Payload::Create {
                    remote: Address::decode(&w.data.id)?,
                    local: Address::decode(&local)?,
                };
                (w.id.clone(), payload)
            }
            TYPE_WRITE => (w.data.id.clone(), Payload::Write(bytes)),
            TYPE_CLOSE => (w.data.id.clone(), Payload::Close),
            TYPE_SET_DEADLINE => (w.data.id.clone(), deadline(DeadlineKind::Both)?),
            TYPE_SET_READ_DEADLINE => (w.data.id.clone(), deadline(DeadlineKind::Read)?),
            TYPE_SET_WRITE_DEADLINE => (w.data.id.clone(), deadline(DeadlineKind::Write)?),
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };
        Ok(Message {
            id: w.id,
            conn_id,
            payload,
        })
    }
}

/// Serializes a message into one newline-terminated frame.
pub fn encode_frame(msg: &Message) -> Result<String, ProtocolError> {
    let json = serde_json::to_vec(&WireMessage::from(msg))?;
    let mut frame = STANDARD.encode(json);
    frame.push('\n');
    Ok(frame)
}

/// Parses one frame; surrounding whitespace (the terminator, a stray `\r`) is ignored.
pub fn decode_frame(line: &str) -> Result<Message, ProtocolError> {
    let raw = STANDARD.decode(line.trim())?;
    let wire: WireMessage = serde_json::from_slice(&raw)?;
    Message::try_from(wire)
}

/// Splits an authenticated stream into the two ends of the message transport.
pub fn link(stream: BoxedStream) -> (Sender, Receiver) {
    let (rd, wr) = tokio::io::split(stream);
    (Sender::new(wr), Receiver::new(rd))
}

/// Writing end of a control link. Cheap to clone; all clones share one
/// writer lock so concurrent frames never interleave.
#[derive(Clone)]
pub struct Sender {
    inner: Arc<SenderInner>,
}

struct SenderInner {
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedStream>>>,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("closed", &*self.inner.closed.borrow())
            .finish_non_exhaustive()
    }
}

impl Sender {
    pub fn new(writer: WriteHalf<BoxedStream>) -> Self {
        let (closed, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(SenderInner {
                writer: tokio::sync::Mutex::new(Some(writer)),
                closed,
            }),
        }
    }

    pub async fn send(&self, msg: &Message) -> Result<(), ProtocolError> {
        let frame = encode_frame(msg)?;
        if frame.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge);
        }
        let mut closed = self.inner.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(ProtocolError::LinkClosed);
        }

        // A blocked write must not outlive close().
        tokio::select! {
            res = self.write_frame(frame.as_bytes()) => res,
            _ = closed.wait_for(|c| *c) => Err(ProtocolError::LinkClosed),
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), ProtocolError> {
        let mut guard = self.inner.writer.lock().await;
        let Some(w) = guard.as_mut() else {
            return Err(ProtocolError::LinkClosed);
        };
        w.write_all(frame).await?;
        w.flush().await?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    pub async fn close(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }
        let writer = self.inner.writer.lock().await.take();
        if let Some(mut w) = writer {
            let _ = tokio::time::timeout(Duration::from_secs(1), w.shutdown()).await;
        }
    }
}

/// Reading end of a control link.
///
/// A background task decodes frames into a queue of depth 1, so a slow
/// consumer stalls the socket read. Any framing error ends the stream.
pub struct Receiver {
    rx: mpsc::Receiver<Message>,
    task: JoinHandle<()>,
}

impl Receiver {
    pub fn new(reader: ReadHalf<BoxedStream>) -> Self {
        let (tx, rx) = mpsc::channel(RECEIVE_QUEUE_DEPTH);
        let task = tokio::spawn(receive_loop(reader, tx));
        Self { rx, task }
    }

    /// Next message, or `None` once the link is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn close(&mut self) {
        self.task.abort();
        self.rx.close();
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn receive_loop(reader: ReadHalf<BoxedStream>, tx: mpsc::Sender<Message>) {
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        let msg = match read_frame(&mut reader, &mut line).await {
            Ok(Some(m)) => m,
            Ok(None) => break,
            Err(err) if err.is_recoverable() => {
                tracing::warn!(err = %err, "tunnel: skipping message");
                continue;
            }
            Err(err) => {
                tracing::warn!(err = %err, "tunnel: dropping control link");
                break;
            }
        };
        if tx.send(msg).await.is_err() {
            break;
        }
    }
}

async fn read_frame(
    reader: &mut BufReader<ReadHalf<BoxedStream>>,
    line: &mut String,
) -> Result<Option<Message>, ProtocolError> {
    line.clear();
    let n = reader
        .take(MAX_FRAME_BYTES as u64 + 1)
        .read_line(line)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if n > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge);
    }
    if !line.ends_with('\n') {
        // EOF in the middle of a frame.
        return Ok(None);
    }
    decode_frame(line).map(Some)
}
