use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpStream;

use crate::remote::{
    config,
    serve,
    tunnel::{server::Server, transport::BoxedStream},
};

/// Runs the public side until a shutdown signal arrives.
pub async fn run_server(listen: &str, auths: &str) -> anyhow::Result<()> {
    let auths = config::parse_auths(auths)?;
    if auths.is_empty() {
        tracing::warn!("auth: no keys configured; every client will be rejected");
    }
    let server = Server::bind(listen, auths)
        .await
        .with_context(|| format!("tunnel: listen {listen}"))?;

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
        }
        _ = server.done() => {}
    }

    // Hard cap so a stuck peer can't stall exit.
    if tokio::time::timeout(Duration::from_secs(5), server.close())
        .await
        .is_err()
    {
        tracing::warn!("shutdown: server did not close in time");
    }
    Ok(())
}

/// Exposes the local service at `forward` through the tunnel named by `url`.
pub async fn run_client(url: &str, forward: &str) -> anyhow::Result<()> {
    let listener = serve::listen(url).await?;
    let forward = forward.to_string();

    let res = tokio::select! {
        res = serve::serve(listener.as_ref(), |stream| relay(stream, forward.clone())) => res,
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            Ok(())
        }
    };
    let _ = listener.close().await;
    res
}

async fn relay(mut inbound: BoxedStream, forward: String) {
    let mut outbound = match TcpStream::connect(&forward).await {
        Ok(s) => s,
        Err(err) => {
            tracing::warn!(forward = %forward, err = %err, "serve: dial local service failed");
            return;
        }
    };
    let _ = outbound.set_nodelay(true);
    match tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
        Ok((up, down)) => {
            tracing::debug!(forward = %forward, up, down, "serve: relay finished");
        }
        Err(err) => {
            tracing::debug!(forward = %forward, err = %err, "serve: relay ended with error");
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
