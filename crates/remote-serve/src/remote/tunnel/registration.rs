use std::{
    collections::HashMap,
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime},
};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{RwLock, watch},
};

use crate::remote::{
    net,
    tunnel::{
        addr::Address,
        protocol::{DeadlineKind, Message, Payload, Receiver, Sender},
    },
};

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Deadlines {
    read: Option<SystemTime>,
    write: Option<SystemTime>,
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "i/o deadline exceeded")
}

fn until(deadline: SystemTime) -> Duration {
    deadline
        .duration_since(SystemTime::now())
        .unwrap_or(Duration::ZERO)
}

struct ActiveConnGuard;

impl ActiveConnGuard {
    fn new() -> Self {
        metrics::counter!("remote_serve_virtual_connections_total").increment(1);
        metrics::gauge!("remote_serve_active_virtual_connections").increment(1.0);
        Self
    }
}

impl Drop for ActiveConnGuard {
    fn drop(&mut self) {
        metrics::gauge!("remote_serve_active_virtual_connections").decrement(1.0);
    }
}

/// A real socket accepted on the exposed port.
struct RealConn {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    deadlines: watch::Sender<Deadlines>,
    stop: watch::Sender<bool>,
    _active: ActiveConnGuard,
}

impl RealConn {
    async fn write(&self, data: &[u8]) -> io::Result<()> {
        let deadline = self.deadlines.borrow().write;
        let mut w = self.writer.lock().await;
        match deadline {
            Some(t) => tokio::time::timeout(until(t), w.write_all(data))
                .await
                .map_err(|_| timed_out())?,
            None => w.write_all(data).await,
        }
    }

    fn set_deadline(&self, kind: DeadlineKind, t: Option<SystemTime>) -> io::Result<()> {
        let mut next = *self.deadlines.borrow();
        match kind {
            DeadlineKind::Both => {
                next.read = t;
                next.write = t;
            }
            DeadlineKind::Read => next.read = t,
            DeadlineKind::Write => next.write = t,
        }
        // Fails once the forwarder, the only subscriber, has exited.
        self.deadlines
            .send(next)
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))
    }

    async fn close(&self) {
        self.stop.send_replace(true);
        let mut w = self.writer.lock().await;
        let _ = tokio::time::timeout(Duration::from_secs(1), w.shutdown()).await;
    }
}

/// The server-side binding of one exposed port to one authenticated control
/// link.
///
/// Accepts real sockets on the port, announces each with a `create` message and
/// relays bytes both ways. Ends when closed, replaced or when the link fails.
pub struct Registration {
    port: String,
    key: String,
    local_addr: SocketAddr,
    conns: RwLock<HashMap<String, Arc<RealConn>>>,
    sender: Sender,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    listener_released: watch::Sender<bool>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("port", &self.port)
            .field("key", &self.key)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl Registration {
    /// Binds `port` and starts serving it over the given control link.
    pub async fn start(
        port: String,
        key: String,
        sender: Sender,
        receiver: Receiver,
    ) -> io::Result<Arc<Self>> {
        let listener = TcpListener::bind(&*net::normalize_bind_addr(&port)).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, _rx) = watch::channel(false);
        let (listener_released, _rx) = watch::channel(false);

        let reg = Arc::new(Self {
            port,
            key,
            local_addr,
            conns: RwLock::new(HashMap::new()),
            sender,
            closed: AtomicBool::new(false),
            shutdown,
            listener_released,
        });

        tokio::spawn(reg.clone().accept_loop(listener));
        tokio::spawn(reg.clone().dispatch_loop(receiver));

        tracing::info!(
            port = %reg.port,
            key = %reg.key,
            addr = %reg.local_addr,
            "tunnel: registration listening"
        );
        Ok(reg)
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn connection_count(&self) -> usize {
        self.conns.read().await.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the registration has been closed.
    pub async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|v| *v).await;
    }

    /// Closes every tracked socket, the control link and the listener.
    /// Returns once the port has been released; repeated calls only wait.
    pub async fn close(&self) {
        let mut released = self.listener_released.subscribe();
        if self.closed.swap(true, Ordering::AcqRel) {
            let _ = released.wait_for(|v| *v).await;
            return;
        }
        self.shutdown.send_replace(true);

        let conns: Vec<Arc<RealConn>> = self.conns.write().await.drain().map(|(_, c)| c).collect();
        for c in conns {
            c.close().await;
        }
        self.sender.close().await;
        let _ = released.wait_for(|v| *v).await;
        tracing::info!(port = %self.port, key = %self.key, "tunnel: registration closed");
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        let failed = loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.wait_for(|v| *v) => break false,
                res = listener.accept() => res,
            };
            match accepted {
                Ok((stream, peer)) => self.on_accept(stream, peer).await,
                Err(err) => {
                    tracing::warn!(port = %self.port, err = %err, "tunnel: accept failed");
                    break true;
                }
            }
        };
        drop(listener);
        self.listener_released.send_replace(true);
        if failed {
            self.close().await;
        }
    }

    async fn on_accept(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let local = stream.local_addr().unwrap_or(self.local_addr);
        let msg = Message::create(Address::tcp(peer), Address::tcp(local));
        let id = msg.conn_id.clone();

        let (rd, wr) = stream.into_split();
        let (deadlines, deadlines_rx) = watch::channel(Deadlines::default());
        let (stop, stop_rx) = watch::channel(false);
        let conn = Arc::new(RealConn {
            writer: tokio::sync::Mutex::new(wr),
            deadlines,
            stop,
            _active: ActiveConnGuard::new(),
        });
        // Track before announcing so the client's first reply finds it.
        self.conns.write().await.insert(id.clone(), conn.clone());

        if let Err(err) = self.sender.send(&msg).await {
            tracing::warn!(port = %self.port, peer = %peer, err = %err, "tunnel: no client available for new connection");
            self.evict(&id).await;
            conn.close().await;
            return;
        }
        tracing::debug!(port = %self.port, conn = %id, peer = %peer, "tunnel: connection announced");

        tokio::spawn(self.clone().forward(id, rd, deadlines_rx, stop_rx));
    }

    /// Relays bytes from a real socket to the client until it ends.
    async fn forward(
        self: Arc<Self>,
        id: String,
        mut rd: OwnedReadHalf,
        mut deadlines: watch::Receiver<Deadlines>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let read_deadline = deadlines.borrow_and_update().read;
            let res = tokio::select! {
                biased;
                _ = stop.wait_for(|v| *v) => return,
                _ = deadlines.changed() => continue,
                res = read_with_deadline(&mut rd, &mut buf, read_deadline) => res,
            };
            match res {
                Ok(n) if n > 0 => {
                    let msg = Message::write(&id, Bytes::copy_from_slice(&buf[..n]));
                    if let Err(err) = self.sender.send(&msg).await {
                        tracing::warn!(port = %self.port, err = %err, "tunnel: control link write failed");
                        self.close().await;
                        return;
                    }
                    metrics::counter!("remote_serve_bytes_relayed_total").increment(n as u64);
                }
                res => {
                    if let Err(err) = res {
                        tracing::debug!(conn = %id, err = %err, "tunnel: real socket read ended");
                    }
                    if self.sender.send(&Message::close(&id)).await.is_err() {
                        self.close().await;
                        return;
                    }
                    if let Some(c) = self.evict(&id).await {
                        c.close().await;
                    }
                    return;
                }
            }
        }
    }

    /// Applies client messages to the tracked real sockets.
    async fn dispatch_loop(self: Arc<Self>, mut receiver: Receiver) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let msg = tokio::select! {
                biased;
                _ = shutdown.wait_for(|v| *v) => break,
                m = receiver.recv() => m,
            };
            let Some(msg) = msg else {
                tracing::info!(port = %self.port, "tunnel: control link ended");
                break;
            };
            let id = msg.conn_id;
            let Some(conn) = self.lookup(&id).await else {
                // Already removed, e.g. raced with a close.
                continue;
            };
            match msg.payload {
                Payload::Close => {
                    if let Some(c) = self.evict(&id).await {
                        c.close().await;
                    }
                }
                Payload::Write(data) => {
                    self.apply(&id, conn.write(&data)).await;
                }
                Payload::SetDeadline { kind, deadline } => {
                    self.apply(&id, async { conn.set_deadline(kind, deadline) })
                        .await;
                }
                Payload::Create { .. } => {
                    tracing::warn!(port = %self.port, conn = %id, "tunnel: client sent create; ignoring");
                }
            }
        }
        receiver.close();
        self.close().await;
    }

    /// Runs `effect` against one socket. On failure the client is told to
    /// close its side and the socket is evicted; if even that notification
    /// fails the whole registration goes down.
    async fn apply<F>(&self, id: &str, effect: F)
    where
        F: Future<Output = io::Result<()>>,
    {
        let Err(err) = effect.await else {
            return;
        };
        tracing::debug!(port = %self.port, conn = %id, err = %err, "tunnel: connection failed");
        if self.sender.send(&Message::close(id)).await.is_err() {
            self.close().await;
            return;
        }
        if let Some(c) = self.evict(id).await {
            c.close().await;
        }
    }

    async fn lookup(&self, id: &str) -> Option<Arc<RealConn>> {
        self.conns.read().await.get(id).cloned()
    }

    async fn evict(&self, id: &str) -> Option<Arc<RealConn>> {
        self.conns.write().await.remove(id)
    }
}

async fn read_with_deadline(
    rd: &mut OwnedReadHalf,
    buf: &mut [u8],
    deadline: Option<SystemTime>,
) -> io::Result<usize> {
    match deadline {
        Some(t) => tokio::time::timeout(until(t), rd.read(buf))
            .await
            .map_err(|_| timed_out())?,
        None => rd.read(buf).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::tunnel::protocol;

    struct Harness {
        reg: Arc<Registration>,
        client_tx: Sender,
        client_rx: Receiver,
    }

    async fn harness() -> Harness {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let (server_tx, server_rx) = protocol::link(Box::new(a));
        let (client_tx, client_rx) = protocol::link(Box::new(b));
        let reg = Registration::start("127.0.0.1:0".into(), "alice".into(), server_tx, server_rx)
            .await
            .unwrap();
        Harness {
            reg,
            client_tx,
            client_rx,
        }
    }

    async fn next_create(rx: &mut Receiver) -> (String, Address) {
        let m = rx.recv().await.unwrap();
        let Payload::Create { remote, .. } = m.payload else {
            panic!("expected create, got {:?}", m.payload);
        };
        (m.conn_id, remote)
    }

    #[tokio::test]
    async fn accepted_socket_is_announced_and_relayed() {
        let mut h = harness().await;
        let mut ext = TcpStream::connect(h.reg.local_addr()).await.unwrap();
        let (id, remote) = next_create(&mut h.client_rx).await;
        assert_eq!(remote.text(), ext.local_addr().unwrap().to_string());

        ext.write_all(b"ping").await.unwrap();
        let m = h.client_rx.recv().await.unwrap();
        assert_eq!(m.conn_id, id);
        assert_eq!(m.payload, Payload::Write(Bytes::from_static(b"ping")));

        h.client_tx
            .send(&Message::write(&id, Bytes::from_static(b"pong")))
            .await
            .unwrap();
        let mut buf = [0u8; 4];
        ext.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn client_close_closes_real_socket() {
        let mut h = harness().await;
        let mut ext = TcpStream::connect(h.reg.local_addr()).await.unwrap();
        let (id, _) = next_create(&mut h.client_rx).await;

        h.client_tx.send(&Message::close(&id)).await.unwrap();
        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(2), ext.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(h.reg.connection_count().await, 0);
    }

    #[tokio::test]
    async fn real_socket_eof_sends_close() {
        let mut h = harness().await;
        let ext = TcpStream::connect(h.reg.local_addr()).await.unwrap();
        let (id, _) = next_create(&mut h.client_rx).await;
        drop(ext);

        let m = h.client_rx.recv().await.unwrap();
        assert_eq!(m.conn_id, id);
        assert_eq!(m.payload, Payload::Close);
    }

    #[tokio::test]
    async fn expired_read_deadline_closes_connection() {
        let mut h = harness().await;
        let _ext = TcpStream::connect(h.reg.local_addr()).await.unwrap();
        let (id, _) = next_create(&mut h.client_rx).await;

        let past = SystemTime::now() - Duration::from_secs(1);
        h.client_tx
            .send(&Message::deadline(&id, DeadlineKind::Read, Some(past)))
            .await
            .unwrap();

        let m = tokio::time::timeout(Duration::from_secs(2), h.client_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(m.conn_id, id);
        assert_eq!(m.payload, Payload::Close);
    }

    #[tokio::test]
    async fn messages_for_unknown_connections_are_ignored() {
        let mut h = harness().await;
        h.client_tx
            .send(&Message::write("nope", Bytes::from_static(b"x")))
            .await
            .unwrap();
        h.client_tx.send(&Message::close("nope")).await.unwrap();

        let _ext = TcpStream::connect(h.reg.local_addr()).await.unwrap();
        next_create(&mut h.client_rx).await;
        assert!(!h.reg.is_closed());
    }

    #[tokio::test]
    async fn link_loss_tears_everything_down() {
        let mut h = harness().await;
        let mut ext = TcpStream::connect(h.reg.local_addr()).await.unwrap();
        next_create(&mut h.client_rx).await;
        let addr = h.reg.local_addr();

        h.client_tx.close().await;
        drop(h.client_rx);
        tokio::time::timeout(Duration::from_secs(2), h.reg.closed())
            .await
            .unwrap();

        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(2), ext.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        drop(ext);

        // The port is free again once close() returns.
        h.reg.close().await;
        TcpListener::bind(addr).await.unwrap();
    }
}
