//! Delivery of progress events over persistent byte-stream connections.
//!
//! Each connection gets its own subscriber. Events are written as one JSON
//! document per line; anything the peer sends is read and discarded and only
//! serves to notice that it went away.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::{HubHandle, Subscriber};

/// How long a single event write may stall before the peer is given up on
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pump events from `subscriber` into `stream` until either side closes
pub async fn serve_connection<S>(subscriber: Subscriber, stream: S) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    serve_with_timeout(subscriber, stream, WRITE_TIMEOUT).await
}

/// [`serve_connection`] with an explicit bound on each write; a peer that
/// stops reading ends the session with [`io::ErrorKind::TimedOut`]
pub async fn serve_with_timeout<S>(
    mut subscriber: Subscriber,
    stream: S,
    write_timeout: Duration,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let mut inbound = tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    let result = loop {
        tokio::select! {
            event = subscriber.recv() => {
                let Some(event) = event else {
                    debug!("Mailbox of subscriber {} closed", subscriber.id());
                    break Ok(());
                };
                let mut line = match serde_json::to_vec(&event) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Failed to serialize progress event: {}", e);
                        continue;
                    }
                };
                line.push(b'\n');
                match tokio::time::timeout(write_timeout, writer.write_all(&line)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break Err(e),
                    Err(_) => {
                        warn!("Progress subscriber {} stopped reading, closing", subscriber.id());
                        break Err(io::Error::new(io::ErrorKind::TimedOut, "event write timed out"));
                    }
                }
            }
            _ = &mut inbound => {
                debug!("Peer of subscriber {} disconnected", subscriber.id());
                break Ok(());
            }
        }
    };

    inbound.abort();
    let _ = tokio::time::timeout(write_timeout, writer.shutdown()).await;
    subscriber.close().await;
    result
}

/// Accept connections on `addr` and serve each one as a subscriber.
///
/// Runs until the listener fails or the hub stops.
pub async fn listen(addr: SocketAddr, hub: HubHandle) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Progress stream listening on {}", listener.local_addr()?);
    accept_loop(listener, hub).await
}

pub async fn accept_loop(listener: TcpListener, hub: HubHandle) -> io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let Some(subscriber) = hub.register().await else {
            info!("Progress hub stopped, closing listener");
            return Ok(());
        };
        debug!("Progress subscriber {} connected from {}", subscriber.id(), peer);
        tokio::spawn(async move {
            if let Err(e) = serve_connection(subscriber, stream).await {
                debug!("Progress connection {} ended: {}", peer, e);
            }
        });
    }
}
