use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{RwLock, mpsc, watch},
};

use crate::remote::tunnel::{
    auth::{self, AuthError},
    conn::{ConnTable, VirtualConn},
    protocol::{Message, Payload, Receiver, Sender},
    transport::{BoxedStream, StreamListener},
};

const ACCEPT_QUEUE_DEPTH: usize = 8;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("closed")]
    Closed,
    #[error("dial: {0}")]
    Dial(#[from] std::io::Error),
    #[error("auth: {0}")]
    Auth(#[from] AuthError),
}

/// The private side of a tunnel.
///
/// Dials the server, authenticates and then surfaces every connection the
/// server accepts on the requested port through [`Client::accept`].
pub struct Client {
    inner: Arc<Inner>,
    accepted: tokio::sync::Mutex<mpsc::Receiver<VirtualConn>>,
    server_addr: Option<SocketAddr>,
}

struct Inner {
    sender: Sender,
    conns: Arc<ConnTable>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server_addr", &self.server_addr)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Dials `server_addr` and asks it to expose `port` (e.g. `":5000"`).
    pub async fn dial(
        server_addr: &str,
        key: &str,
        secret: &str,
        port: &str,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(server_addr).await?;
        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr().ok();
        let client = Self::handshake(Box::new(stream), peer, key, secret, port).await?;
        tracing::info!(server = %server_addr, key = %key, port = %port, "tunnel: connected");
        Ok(client)
    }

    /// Runs the handshake over an already connected stream.
    pub async fn handshake(
        stream: BoxedStream,
        server_addr: Option<SocketAddr>,
        key: &str,
        secret: &str,
        port: &str,
    ) -> Result<Self, ClientError> {
        let (sender, receiver) = auth::connect(stream, key, secret, port).await?;
        Ok(Self::from_link(sender, receiver, server_addr))
    }

    pub fn from_link(sender: Sender, receiver: Receiver, server_addr: Option<SocketAddr>) -> Self {
        let (shutdown, _rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE_DEPTH);
        let inner = Arc::new(Inner {
            sender,
            conns: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
        });
        tokio::spawn(dispatch_loop(inner.clone(), receiver, tx));
        Self {
            inner,
            accepted: tokio::sync::Mutex::new(rx),
            server_addr,
        }
    }

    /// Next connection accepted by the server. Fails with
    /// [`ClientError::Closed`] once the control link has ended.
    pub async fn accept(&self) -> Result<VirtualConn, ClientError> {
        let mut rx = self.accepted.lock().await;
        rx.recv().await.ok_or(ClientError::Closed)
    }

    /// Stops the dispatch loop; every open connection is closed.
    pub fn close(&self) {
        self.inner.shutdown.send_replace(true);
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.server_addr
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.conns.read().await.len()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

async fn dispatch_loop(inner: Arc<Inner>, mut receiver: Receiver, accepted: mpsc::Sender<VirtualConn>) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        let msg = tokio::select! {
            biased;
            _ = shutdown.wait_for(|v| *v) => break,
            m = receiver.recv() => m,
        };
        let Some(msg) = msg else {
            break;
        };

        match msg.payload {
            Payload::Create { remote, local } => {
                let (conn, shared) = VirtualConn::new(
                    msg.conn_id.clone(),
                    local,
                    remote,
                    inner.sender.clone(),
                    Arc::downgrade(&inner.conns),
                );
                inner.conns.write().await.insert(msg.conn_id, shared);
                metrics::counter!("remote_serve_virtual_connections_total").increment(1);
                metrics::gauge!("remote_serve_active_virtual_connections").increment(1.0);
                tracing::debug!(conn = %conn.id(), remote = %conn.remote_addr(), "tunnel: new connection");

                // A full queue stalls the whole link until the application accepts.
                tokio::select! {
                    biased;
                    _ = shutdown.wait_for(|v| *v) => break,
                    res = accepted.send(conn) => {
                        if res.is_err() {
                            break;
                        }
                    }
                }
            }
            payload => {
                let conn = inner.conns.read().await.get(&msg.conn_id).cloned();
                match conn {
                    Some(conn) => conn.handle(payload).await,
                    None => {
                        tracing::trace!(conn = %msg.conn_id, "tunnel: message for unknown connection");
                    }
                }
            }
        }
    }

    receiver.close();
    drop(accepted);
    let conns: Vec<_> = inner.conns.read().await.values().cloned().collect();
    for c in conns {
        c.close_local().await;
    }
    inner.sender.close().await;
    tracing::info!("tunnel: control link closed");
}

#[async_trait]
impl StreamListener for Client {
    async fn accept(&self) -> anyhow::Result<BoxedStream> {
        let conn = Client::accept(self).await?;
        Ok(Box::new(conn))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.addr()
    }

    async fn close(&self) -> anyhow::Result<()> {
        Client::close(self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::tunnel::{addr::Address, protocol};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn create(id_remote: &str) -> Message {
        Message::create(
            Address::new("tcp", id_remote),
            Address::new("tcp", "0.0.0.0:5000"),
        )
    }

    fn pair() -> (Client, Sender, Receiver) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = protocol::link(Box::new(a));
        let (server_tx, server_rx) = protocol::link(Box::new(b));
        (Client::from_link(tx, rx, None), server_tx, server_rx)
    }

    #[tokio::test]
    async fn create_surfaces_a_connection_with_addresses() {
        let (client, server_tx, _server_rx) = pair();
        let m = create("203.0.113.5:1234");
        server_tx.send(&m).await.unwrap();

        let conn = client.accept().await.unwrap();
        assert_eq!(conn.id(), m.conn_id);
        assert_eq!(conn.remote_addr().text(), "203.0.113.5:1234");
        assert_eq!(conn.local_addr().text(), "0.0.0.0:5000");
        assert_eq!(client.connection_count().await, 1);
    }

    #[tokio::test]
    async fn bytes_reach_only_their_connection() {
        let (client, server_tx, _server_rx) = pair();
        let (m1, m2) = (create("a:1"), create("b:2"));
        server_tx.send(&m1).await.unwrap();
        server_tx.send(&m2).await.unwrap();
        let mut c1 = client.accept().await.unwrap();
        let mut c2 = client.accept().await.unwrap();

        for i in 0..20u8 {
            let (id, b) = if i % 3 == 0 { (&m2.conn_id, b'2') } else { (&m1.conn_id, b'1') };
            server_tx
                .send(&Message::write(id, Bytes::from(vec![b; 3])))
                .await
                .unwrap();
        }
        server_tx.send(&Message::close(&m1.conn_id)).await.unwrap();
        server_tx.send(&Message::close(&m2.conn_id)).await.unwrap();

        let mut out1 = Vec::new();
        c1.read_to_end(&mut out1).await.unwrap();
        let mut out2 = Vec::new();
        c2.read_to_end(&mut out2).await.unwrap();
        assert_eq!(out1, vec![b'1'; 13 * 3]);
        assert_eq!(out2, vec![b'2'; 7 * 3]);
    }

    #[tokio::test]
    async fn local_writes_and_close_reach_the_server() {
        let (client, server_tx, mut server_rx) = pair();
        let m = create("a:1");
        server_tx.send(&m).await.unwrap();
        let mut conn = client.accept().await.unwrap();

        conn.write_all(b"pong").await.unwrap();
        conn.shutdown().await.unwrap();

        let got = server_rx.recv().await.unwrap();
        assert_eq!(got.payload, Payload::Write(Bytes::from_static(b"pong")));
        let got = server_rx.recv().await.unwrap();
        assert_eq!(got.conn_id, m.conn_id);
        assert_eq!(got.payload, Payload::Close);
        assert_eq!(client.connection_count().await, 0);
    }

    #[tokio::test]
    async fn accept_reports_closed_after_link_ends() {
        let (client, server_tx, server_rx) = pair();
        server_tx.send(&create("a:1")).await.unwrap();
        let mut conn = client.accept().await.unwrap();

        server_tx.close().await;
        drop(server_rx);

        assert!(matches!(client.accept().await, Err(ClientError::Closed)));
        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(2), conn.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn close_unwinds_dispatch() {
        let (client, _server_tx, _server_rx) = pair();
        client.close();
        let res = tokio::time::timeout(Duration::from_secs(2), client.accept())
            .await
            .unwrap();
        assert!(matches!(res, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn unaccepted_connections_apply_backpressure() {
        let (client, server_tx, _server_rx) = pair();
        // Queue depth plus the one held by the blocked dispatch loop.
        for i in 0..ACCEPT_QUEUE_DEPTH + 1 {
            server_tx.send(&create(&format!("r:{i}"))).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.connection_count().await, ACCEPT_QUEUE_DEPTH + 1);

        for _ in 0..ACCEPT_QUEUE_DEPTH + 1 {
            client.accept().await.unwrap();
        }
    }
}
