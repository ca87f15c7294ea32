//! TCP stream relay: accept loop and per-connection handling.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::connection::ConnectionInfo;
use crate::endpoint::Protocol;
use crate::error::{Error, Result};
use crate::relay::pump::relay_tcp;
use crate::relay::{is_transient, stopped, RelayContext};

/// Accept connections until the session is stopped or the listener fails.
///
/// The listener is dropped, and the port released, when this returns.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<RelayContext>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => {
                debug!("{} listener closed", ctx.key);
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, client_addr)) => {
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, client_addr, &ctx).await {
                            warn!("{} connection from {} dropped: {}", ctx.key, client_addr, e);
                        }
                    });
                }
                Err(e) if is_transient(&e) => {
                    warn!("Temporary error accepting on {}: {}", ctx.key, e);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Dial the target for one accepted connection and pump until either side closes.
async fn handle_connection(
    inbound: TcpStream,
    client_addr: SocketAddr,
    ctx: &RelayContext,
) -> Result<()> {
    debug!("New connection on {} from {}", ctx.key, client_addr);

    let target = ctx.target.socket_addr_string();
    let outbound = match dial(&target, ctx.limits.connect_timeout()).await {
        Ok(stream) => stream,
        Err(e) => {
            ctx.stats.record_failed_dial();
            return Err(e);
        }
    };

    let _ = inbound.set_nodelay(true);
    let _ = outbound.set_nodelay(true);

    let info = ConnectionInfo::new(
        ctx.session_id,
        Protocol::Tcp,
        client_addr.to_string(),
        ctx.target.clone(),
    );
    let conn_id = info.id;
    ctx.stats.add_connection(info).await;

    let (bytes_sent, bytes_received) = relay_tcp(inbound, outbound, ctx.limits.buffer_size).await;

    ctx.stats
        .close_connection(conn_id, bytes_sent, bytes_received)
        .await;

    debug!(
        "Connection closed: {} -> {} (sent: {}, recv: {})",
        client_addr, target, bytes_sent, bytes_received
    );

    Ok(())
}

/// Connect to the target, honouring an optional timeout.
pub(crate) async fn dial(target: &str, timeout: Option<Duration>) -> Result<TcpStream> {
    let connect = TcpStream::connect(target);

    let connected = match timeout {
        Some(limit) => tokio::time::timeout(limit, connect)
            .await
            .map_err(|_| Error::Timeout(target.to_string()))?,
        None => connect.await,
    };

    connected.map_err(|source| Error::DialFailed {
        target: target.to_string(),
        source,
    })
}
