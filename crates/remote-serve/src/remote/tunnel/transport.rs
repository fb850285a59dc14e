use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::TcpListener;

use crate::remote::net;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Something that hands out accepted byte streams: a plain TCP listener or a
/// tunnel client whose connections arrive over a control link.
#[async_trait]
pub trait StreamListener: Send + Sync {
    async fn accept(&self) -> anyhow::Result<BoxedStream>;
    fn local_addr(&self) -> Option<SocketAddr>;
    async fn close(&self) -> anyhow::Result<()>;
}

pub struct TcpStreamListener {
    ln: TcpListener,
}

impl TcpStreamListener {
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        let ln = TcpListener::bind(&*net::normalize_bind_addr(addr)).await?;
        Ok(Self { ln })
    }
}

#[async_trait]
impl StreamListener for TcpStreamListener {
    async fn accept(&self) -> anyhow::Result<BoxedStream> {
        let (c, _) = self.ln.accept().await?;
        let _ = c.set_nodelay(true);
        Ok(Box::new(c))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }

    async fn close(&self) -> anyhow::Result<()> {
        // Dropping the listener releases the socket.
        Ok(())
    }
}
