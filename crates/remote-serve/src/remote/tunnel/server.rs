use std::{collections::HashMap, io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::{Mutex, RwLock, watch},
};

use crate::remote::{
    net,
    tunnel::{
        auth::{self, AuthTable, Handshake},
        registration::Registration,
    },
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The public side of a tunnel.
///
/// Accepts control links, authenticates them against an [`AuthTable`] and
/// keeps one [`Registration`] per requested port. A newer client asking for
/// the same port replaces the older one.
pub struct Server {
    inner: Arc<Inner>,
    local_addr: SocketAddr,
}

struct Inner {
    auths: AuthTable,
    registrations: RwLock<HashMap<String, Arc<Registration>>>,
    // Serializes replace-then-bind so two clients racing for one port can't
    // both tear down the old registration.
    registering: Mutex<()>,
    shutdown: watch::Sender<bool>,
    done: watch::Sender<bool>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl Server {
    pub async fn bind(addr: &str, auths: AuthTable) -> io::Result<Self> {
        let listener = TcpListener::bind(&*net::normalize_bind_addr(addr)).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, _rx) = watch::channel(false);
        let (done, _rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            auths,
            registrations: RwLock::new(HashMap::new()),
            registering: Mutex::new(()),
            shutdown,
            done,
        });

        tracing::info!(addr = %local_addr, keys = inner.auths.len(), "tunnel: listening");
        tokio::spawn(accept_loop(inner.clone(), listener));
        Ok(Self { inner, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting control links and closes every registration.
    pub async fn close(&self) {
        self.inner.shutdown.send_replace(true);
        self.done().await;
    }

    /// Resolves once the server has shut down.
    pub async fn done(&self) {
        let mut rx = self.inner.done.subscribe();
        let _ = rx.wait_for(|v| *v).await;
    }

    /// Ports with a live registration.
    pub async fn ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self.inner.registrations.read().await.keys().cloned().collect();
        ports.sort();
        ports
    }

    pub async fn registration(&self, port: &str) -> Option<Arc<Registration>> {
        self.inner.registrations.read().await.get(port).cloned()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.inner.shutdown.send_replace(true);
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.wait_for(|v| *v) => break,
            res = listener.accept() => res,
        };
        match accepted {
            Ok((stream, peer)) => {
                tokio::spawn(handle_link(inner.clone(), stream, peer));
            }
            Err(err) => {
                tracing::warn!(err = %err, "tunnel: control accept failed");
                break;
            }
        }
    }
    drop(listener);
    inner.shutdown.send_replace(true);

    let regs: Vec<Arc<Registration>> = {
        let _guard = inner.registering.lock().await;
        inner.registrations.write().await.drain().map(|(_, r)| r).collect()
    };
    for r in regs {
        r.close().await;
    }
    tracing::info!("tunnel: server closed");
    inner.done.send_replace(true);
}

async fn handle_link(inner: Arc<Inner>, stream: TcpStream, peer: SocketAddr) {
    let _ = stream.set_nodelay(true);
    let hs = match tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        auth::accept(Box::new(stream), &inner.auths),
    )
    .await
    {
        Ok(Ok(hs)) => hs,
        Ok(Err(err)) => {
            metrics::counter!("remote_serve_auth_failures_total").increment(1);
            tracing::warn!(client = %peer, err = %err, "auth: handshake rejected");
            return;
        }
        Err(_) => {
            metrics::counter!("remote_serve_auth_failures_total").increment(1);
            tracing::warn!(client = %peer, "auth: handshake timed out");
            return;
        }
    };
    metrics::counter!("remote_serve_control_links_total").increment(1);
    tracing::info!(client = %peer, key = %hs.key, port = %hs.port, "auth: client authenticated");

    register(inner, hs).await;
}

async fn register(inner: Arc<Inner>, hs: Handshake) {
    let Handshake {
        key,
        port,
        sender,
        receiver,
    } = hs;

    let _guard = inner.registering.lock().await;
    if *inner.shutdown.borrow() {
        sender.close().await;
        return;
    }

    let old = inner.registrations.write().await.remove(&port);
    if let Some(old) = old {
        tracing::info!(port = %port, old_key = %old.key(), new_key = %key, "tunnel: registration replaced");
        old.close().await;
    }

    let reg = match Registration::start(port.clone(), key, sender.clone(), receiver).await {
        Ok(reg) => reg,
        Err(err) => {
            tracing::warn!(port = %port, err = %err, "tunnel: cannot listen on requested port");
            sender.close().await;
            return;
        }
    };
    inner
        .registrations
        .write()
        .await
        .insert(port.clone(), reg.clone());
    drop(_guard);

    tokio::spawn(async move {
        reg.closed().await;
        let mut regs = inner.registrations.write().await;
        if regs.get(&port).is_some_and(|cur| Arc::ptr_eq(cur, &reg)) {
            regs.remove(&port);
            tracing::debug!(port = %port, "tunnel: registration removed");
        }
    });
}
