//! Client-side virtual connections.
//!
//! A [`VirtualConn`] looks like an accepted socket to application code but its
//! bytes travel as `write` messages over the control link. Inbound bytes are
//! queued by the multiplexer and drained by reads.

use std::{
    collections::HashMap,
    future::Future,
    io,
    pin::Pin,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU8, Ordering},
    },
    task::{Context, Poll},
    time::SystemTime,
};

use bytes::Bytes;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::{RwLock, mpsc, watch},
};

use crate::remote::tunnel::{
    addr::Address,
    protocol::{DeadlineKind, Message, Payload, ProtocolError, Sender},
};

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Largest payload carried by one `write` message; keeps frames well under
/// the transport's frame limit.
pub const MAX_WRITE_CHUNK: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("already closed")]
    AlreadyClosed,
    #[error("control link: {0}")]
    Link(#[from] ProtocolError),
}

impl From<ConnError> for io::Error {
    fn from(err: ConnError) -> Self {
        let kind = match &err {
            ConnError::AlreadyClosed => io::ErrorKind::NotConnected,
            ConnError::Link(_) => io::ErrorKind::BrokenPipe,
        };
        io::Error::new(kind, err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Open,
    Closing,
    Closed,
}

/// Table of live connections on one control link.
pub(crate) type ConnTable = RwLock<HashMap<String, Arc<ConnShared>>>;

/// State shared between a [`VirtualConn`] and its multiplexer.
pub(crate) struct ConnShared {
    id: String,
    state: AtomicU8,
    sender: Sender,
    cancel: watch::Sender<bool>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    table: Weak<ConnTable>,
}

impl ConnShared {
    fn state(&self) -> ConnState {
        match self.state.load(Ordering::Acquire) {
            OPEN => ConnState::Open,
            CLOSING => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }

    /// Sends a message tied to this connection. Once the connection is closed
    /// the send is abandoned.
    async fn send(&self, msg: Message) -> Result<(), ConnError> {
        if self.state() != ConnState::Open {
            return Err(ConnError::AlreadyClosed);
        }
        let mut cancel = self.cancel.subscribe();
        tokio::select! {
            res = self.sender.send(&msg) => res.map_err(ConnError::from),
            _ = cancel.wait_for(|c| *c) => Err(ConnError::AlreadyClosed),
        }
    }

    async fn write(&self, mut data: Bytes) -> Result<usize, ConnError> {
        let n = data.len();
        loop {
            let chunk = data.split_to(data.len().min(MAX_WRITE_CHUNK));
            self.send(Message::write(&self.id, chunk)).await?;
            if data.is_empty() {
                return Ok(n);
            }
        }
    }

    /// Notifies the peer, then releases local resources. A failed notification
    /// leaves the connection open so the close can be retried.
    pub(crate) async fn close(&self) -> Result<(), ConnError> {
        if self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ConnError::AlreadyClosed);
        }
        if let Err(err) = self.sender.send(&Message::close(&self.id)).await {
            let _ = self.state.compare_exchange(
                CLOSING,
                OPEN,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            return Err(err.into());
        }
        self.release().await;
        Ok(())
    }

    /// Closes without notifying the peer: it already knows, or the link is gone.
    pub(crate) async fn close_local(&self) {
        if self.state.swap(CLOSED, Ordering::AcqRel) == CLOSED {
            return;
        }
        self.release().await;
    }

    async fn release(&self) {
        self.state.store(CLOSED, Ordering::Release);
        self.cancel.send_replace(true);
        // Dropping the queue's sender turns pending reads into EOF.
        if let Ok(mut inbound) = self.inbound.lock() {
            inbound.take();
        }
        if let Some(table) = self.table.upgrade() {
            let removed = table.write().await.remove(&self.id);
            if removed.is_some() {
                metrics::gauge!("remote_serve_active_virtual_connections").decrement(1.0);
            }
        }
    }

    /// Applies a message the peer sent for this connection.
    pub(crate) async fn handle(&self, payload: Payload) {
        match payload {
            Payload::Close => self.close_local().await,
            Payload::Write(data) => {
                let delivered = self
                    .inbound
                    .lock()
                    .ok()
                    .and_then(|q| q.as_ref().map(|tx| tx.send(data).is_ok()))
                    .unwrap_or(false);
                if !delivered {
                    tracing::debug!(conn = %self.id, "tunnel: reader gone; closing connection");
                    if let Err(err) = self.close().await {
                        tracing::debug!(conn = %self.id, err = %err, "tunnel: close after failed delivery");
                    }
                }
            }
            other => {
                tracing::warn!(
                    conn = %self.id,
                    kind = other.type_name(),
                    "tunnel: connection received unexpected message type"
                );
            }
        }
    }
}

type WriteFuture = Pin<Box<dyn Future<Output = io::Result<usize>> + Send>>;
type CloseFuture = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;

/// An accepted connection whose bytes travel over the control link.
///
/// Implements [`AsyncRead`] and [`AsyncWrite`], so it can be handed to
/// anything that serves a socket. Writes are acknowledged once the frame is on
/// the control link; there is no end-to-end acknowledgment.
pub struct VirtualConn {
    shared: Arc<ConnShared>,
    local: Address,
    remote: Address,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
    write_fut: Option<WriteFuture>,
    close_fut: Option<CloseFuture>,
}

impl std::fmt::Debug for VirtualConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualConn")
            .field("id", &self.shared.id)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}

impl VirtualConn {
    pub(crate) fn new(
        id: String,
        local: Address,
        remote: Address,
        sender: Sender,
        table: Weak<ConnTable>,
    ) -> (Self, Arc<ConnShared>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel, _cancel_rx) = watch::channel(false);
        let shared = Arc::new(ConnShared {
            id,
            state: AtomicU8::new(OPEN),
            sender,
            cancel,
            inbound: Mutex::new(Some(tx)),
            table,
        });
        let conn = Self {
            shared: shared.clone(),
            local,
            remote,
            inbound: rx,
            pending: Bytes::new(),
            write_fut: None,
            close_fut: None,
        };
        (conn, shared)
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn local_addr(&self) -> &Address {
        &self.local
    }

    pub fn remote_addr(&self) -> &Address {
        &self.remote
    }

    pub fn state(&self) -> ConnState {
        self.shared.state()
    }

    /// Forwards `data` to the remote socket and reports the full length.
    pub async fn send(&self, data: &[u8]) -> Result<usize, ConnError> {
        self.shared.write(Bytes::copy_from_slice(data)).await
    }

    pub async fn close(&self) -> Result<(), ConnError> {
        self.shared.close().await
    }

    /// Sets both deadlines of the remote socket. `None` clears them.
    pub async fn set_deadline(&self, t: Option<SystemTime>) -> Result<(), ConnError> {
        self.set(DeadlineKind::Both, t).await
    }

    pub async fn set_read_deadline(&self, t: Option<SystemTime>) -> Result<(), ConnError> {
        self.set(DeadlineKind::Read, t).await
    }

    pub async fn set_write_deadline(&self, t: Option<SystemTime>) -> Result<(), ConnError> {
        self.set(DeadlineKind::Write, t).await
    }

    async fn set(&self, kind: DeadlineKind, t: Option<SystemTime>) -> Result<(), ConnError> {
        self.shared
            .send(Message::deadline(&self.shared.id, kind, t))
            .await
    }
}

impl AsyncRead for VirtualConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        while this.pending.is_empty() {
            match this.inbound.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => this.pending = chunk,
                // Sender dropped: the connection is closed.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = this.pending.len().min(buf.remaining());
        buf.put_slice(&this.pending.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for VirtualConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let fut = this.write_fut.get_or_insert_with(|| {
            let shared = this.shared.clone();
            let data = Bytes::copy_from_slice(&buf[..buf.len().min(MAX_WRITE_CHUNK)]);
            Box::pin(async move { shared.write(data).await.map_err(io::Error::from) })
        });
        let res = std::task::ready!(fut.as_mut().poll(cx));
        this.write_fut = None;
        Poll::Ready(res)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let fut = this.close_fut.get_or_insert_with(|| {
            let shared = this.shared.clone();
            Box::pin(async move {
                match shared.close().await {
                    Ok(()) | Err(ConnError::AlreadyClosed) => Ok(()),
                    Err(err) => Err(err.into()),
                }
            })
        });
        let res = std::task::ready!(fut.as_mut().poll(cx));
        this.close_fut = None;
        Poll::Ready(res)
    }
}

impl Drop for VirtualConn {
    fn drop(&mut self) {
        if self.shared.state() != ConnState::Open {
            return;
        }
        // Like dropping a socket: tell the peer the connection is gone.
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            let shared = self.shared.clone();
            rt.spawn(async move {
                let _ = shared.close().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::tunnel::protocol::{self, Receiver};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Harness {
        table: Arc<ConnTable>,
        conn: VirtualConn,
        shared: Arc<ConnShared>,
        peer: Receiver,
        _peer_tx: Sender,
        _rx: Receiver,
    }

    fn harness() -> Harness {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = protocol::link(Box::new(a));
        let (peer_tx, peer) = protocol::link(Box::new(b));
        let table: Arc<ConnTable> = Arc::new(RwLock::new(HashMap::new()));
        let (conn, shared) = VirtualConn::new(
            "c1".into(),
            Address::new("tcp", "0.0.0.0:5000"),
            Address::new("tcp", "198.51.100.9:4444"),
            tx,
            Arc::downgrade(&table),
        );
        Harness {
            table,
            conn,
            shared,
            peer,
            _peer_tx: peer_tx,
            _rx: rx,
        }
    }

    #[tokio::test]
    async fn writes_become_write_messages() {
        let mut h = harness();
        assert_eq!(h.conn.send(b"hello").await.unwrap(), 5);
        h.conn.write_all(b" world").await.unwrap();

        for want in [&b"hello"[..], &b" world"[..]] {
            let m = h.peer.recv().await.unwrap();
            assert_eq!(m.conn_id, "c1");
            assert_eq!(m.payload, Payload::Write(Bytes::copy_from_slice(want)));
        }
    }

    #[tokio::test]
    async fn large_writes_are_split_into_chunks() {
        let mut h = harness();
        let body: Vec<u8> = (0..MAX_WRITE_CHUNK * 2 + 10).map(|i| i as u8).collect();
        let sender = tokio::spawn({
            let shared = h.shared.clone();
            let body = Bytes::from(body.clone());
            async move { shared.write(body).await }
        });

        let mut got = Vec::new();
        while got.len() < body.len() {
            let m = h.peer.recv().await.unwrap();
            let Payload::Write(chunk) = m.payload else {
                panic!("unexpected payload");
            };
            assert!(chunk.len() <= MAX_WRITE_CHUNK);
            got.extend_from_slice(&chunk);
        }
        assert_eq!(got, body);
        assert_eq!(sender.await.unwrap().unwrap(), body.len());

        // poll_write takes at most one chunk per call.
        let n = h.conn.write(&body).await.unwrap();
        assert_eq!(n, MAX_WRITE_CHUNK);
    }

    #[tokio::test]
    async fn delivered_bytes_are_read_in_order() {
        let mut h = harness();
        h.shared.handle(Payload::Write(Bytes::from_static(b"ab"))).await;
        h.shared.handle(Payload::Write(Bytes::from_static(b"cde"))).await;

        let mut buf = [0u8; 5];
        h.conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcde");
    }

    #[tokio::test]
    async fn second_close_reports_already_closed() {
        let mut h = harness();
        h.table
            .write()
            .await
            .insert("c1".into(), h.shared.clone());

        h.conn.close().await.unwrap();
        let m = h.peer.recv().await.unwrap();
        assert_eq!(m.payload, Payload::Close);
        assert!(h.table.read().await.is_empty());
        assert_eq!(h.conn.state(), ConnState::Closed);

        assert!(matches!(h.conn.close().await, Err(ConnError::AlreadyClosed)));
        assert!(matches!(
            h.conn.send(b"late").await,
            Err(ConnError::AlreadyClosed)
        ));
    }

    #[tokio::test]
    async fn failed_close_can_be_retried() {
        let h = harness();
        h.shared.sender.close().await;
        assert!(matches!(h.conn.close().await, Err(ConnError::Link(_))));
        assert_eq!(h.conn.state(), ConnState::Open);
    }

    #[tokio::test]
    async fn peer_close_ends_reads_without_echo() {
        let mut h = harness();
        h.table
            .write()
            .await
            .insert("c1".into(), h.shared.clone());

        h.shared.handle(Payload::Write(Bytes::from_static(b"x"))).await;
        h.shared.handle(Payload::Close).await;
        assert!(h.table.read().await.is_empty());

        let mut out = Vec::new();
        h.conn.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"x");

        // Nothing was sent back for a close the peer initiated.
        h.conn.send(b"").await.unwrap_err();
        let quiet =
            tokio::time::timeout(std::time::Duration::from_millis(50), h.peer.recv()).await;
        assert!(quiet.is_err());
    }

    #[tokio::test]
    async fn deadlines_are_forwarded() {
        let mut h = harness();
        let t = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(2_000_000_000);
        h.conn.set_read_deadline(Some(t)).await.unwrap();
        h.conn.set_deadline(None).await.unwrap();

        let m = h.peer.recv().await.unwrap();
        assert_eq!(
            m.payload,
            Payload::SetDeadline {
                kind: DeadlineKind::Read,
                deadline: Some(t)
            }
        );
        let m = h.peer.recv().await.unwrap();
        assert_eq!(
            m.payload,
            Payload::SetDeadline {
                kind: DeadlineKind::Both,
                deadline: None
            }
        );
    }

    #[tokio::test]
    async fn dropping_the_conn_notifies_peer() {
        let Harness {
            conn,
            mut peer,
            _peer_tx,
            _rx,
            ..
        } = harness();
        drop(conn);
        let m = peer.recv().await.unwrap();
        assert_eq!(m.payload, Payload::Close);
    }
}
