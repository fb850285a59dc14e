//! Serve one handler from either a local listener or a tunnel, chosen by the
//! listen address.

use std::future::Future;

use anyhow::Context;

use crate::remote::{
    config::ListenTarget,
    tunnel::{
        client::{Client, ClientError},
        transport::{BoxedStream, StreamListener, TcpStreamListener},
    },
};

pub async fn bind(target: &ListenTarget) -> anyhow::Result<Box<dyn StreamListener>> {
    match target {
        ListenTarget::Local(addr) => {
            let ln = TcpStreamListener::bind(addr)
                .await
                .with_context(|| format!("serve: listen {addr}"))?;
            tracing::info!(addr = ?ln.local_addr(), "serve: listening locally");
            Ok(Box::new(ln))
        }
        ListenTarget::Remote {
            control_addr,
            key,
            secret,
            port,
        } => {
            let client = Client::dial(control_addr, key, secret, port)
                .await
                .with_context(|| format!("serve: dial tunnel {control_addr}"))?;
            tracing::info!(server = %control_addr, port = %port, "serve: listening through tunnel");
            Ok(Box::new(client))
        }
    }
}

/// Parses `addr` and binds it.
pub async fn listen(addr: &str) -> anyhow::Result<Box<dyn StreamListener>> {
    bind(&ListenTarget::parse(addr)?).await
}

/// Runs `handler` on every accepted stream until the listener ends. A tunnel
/// whose control link closes ends the loop without error.
pub async fn serve<F, Fut>(listener: &dyn StreamListener, handler: F) -> anyhow::Result<()>
where
    F: Fn(BoxedStream) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        match listener.accept().await {
            Ok(stream) => {
                tokio::spawn(handler(stream));
            }
            Err(err) if matches!(err.downcast_ref::<ClientError>(), Some(ClientError::Closed)) => {
                tracing::info!("serve: tunnel closed");
                return Ok(());
            }
            Err(err) => return Err(err.context("serve: accept")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::tunnel::{auth::AuthTable, server::Server};
    use std::time::Duration;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    async fn echo(mut stream: BoxedStream) {
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn roundtrip(addr: std::net::SocketAddr) {
        let mut c = TcpStream::connect(addr).await.unwrap();
        c.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(2), c.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn serves_local_listener() {
        let ln = listen("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move { serve(ln.as_ref(), echo).await });
        roundtrip(addr).await;
    }

    #[tokio::test]
    async fn serves_through_tunnel() {
        let auths: AuthTable = [("alice", "secret")].into_iter().collect();
        let srv = Server::bind("127.0.0.1:0", auths).await.unwrap();
        let url = ListenTarget::remote_url(
            &srv.local_addr().to_string(),
            "alice",
            "secret",
            "127.0.0.1:0",
        );

        let ln = listen(&url).await.unwrap();
        let done = tokio::spawn(async move { serve(ln.as_ref(), echo).await });

        let exposed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(r) = srv.registration("127.0.0.1:0").await {
                    return r.local_addr();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        roundtrip(exposed).await;

        // Shutting the server down ends the serve loop cleanly.
        srv.close().await;
        let res = tokio::time::timeout(Duration::from_secs(2), done)
            .await
            .unwrap()
            .unwrap();
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn bad_credentials_fail_to_bind() {
        let auths: AuthTable = [("alice", "secret")].into_iter().collect();
        let srv = Server::bind("127.0.0.1:0", auths).await.unwrap();
        let url = ListenTarget::remote_url(&srv.local_addr().to_string(), "alice", "x", ":0");
        assert!(listen(&url).await.is_err());
    }
}
