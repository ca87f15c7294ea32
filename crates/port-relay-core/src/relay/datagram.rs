//! UDP datagram relay.
//!
//! Each client address seen on the listening socket gets its own association:
//! a socket connected to the target. Client datagrams leave through that
//! socket, and whatever the target sends back on it is returned to that client
//! through the listening socket. Traffic in either direction keeps an
//! association alive; after an idle period it expires and is recreated by the
//! client's next datagram.
//!
//! Reply tasks hold the listening socket, so the receive loop joins them all
//! before it returns. The port is free once the loop has exited.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::ConnectionInfo;
use crate::endpoint::Protocol;
use crate::error::Result;
use crate::relay::{is_transient, stopped, RelayContext};

/// Largest payload a single datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

type Associations = Arc<Mutex<HashMap<SocketAddr, Arc<Association>>>>;

/// One client's path to the target.
struct Association {
    id: Uuid,
    socket: UdpSocket,
    bytes_sent: AtomicU64,
    opened: Instant,
    /// Milliseconds after `opened` of the last datagram either way.
    last_active: AtomicU64,
}

impl Association {
    fn touch(&self) {
        let elapsed = self.opened.elapsed().as_millis() as u64;
        self.last_active.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn idle_deadline(&self, idle: Duration) -> Instant {
        self.opened + Duration::from_millis(self.last_active.load(Ordering::Relaxed)) + idle
    }
}

/// Receive datagrams until the session is stopped or the socket fails.
pub(crate) async fn receive_loop(
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    ctx: Arc<RelayContext>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let associations: Associations = Arc::new(Mutex::new(HashMap::new()));
    let mut replies = Replies {
        tasks: JoinSet::new(),
        halt: watch::channel(false).0,
    };
    let result =
        forward_datagrams(&socket, target, &associations, &mut replies, &ctx, &mut shutdown).await;

    // Reply tasks hold the socket too.
    let _ = replies.halt.send(true);
    while replies.tasks.join_next().await.is_some() {}
    debug!("{} socket closed", ctx.key);
    result
}

/// Reply tasks of one session and the signal that ends them.
struct Replies {
    tasks: JoinSet<()>,
    halt: watch::Sender<bool>,
}

async fn forward_datagrams(
    socket: &Arc<UdpSocket>,
    target: SocketAddr,
    associations: &Associations,
    replies: &mut Replies,
    ctx: &Arc<RelayContext>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let (n, client_addr) = tokio::select! {
            _ = stopped(shutdown) => return Ok(()),
            Some(_) = replies.tasks.join_next(), if !replies.tasks.is_empty() => continue,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) if is_transient(&e) => {
                    debug!("Temporary error reading on {}: {}", ctx.key, e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let association =
            match associate(client_addr, target, socket, associations, replies, ctx).await {
                Ok(association) => association,
                Err(e) => {
                    warn!(
                        "Error opening UDP path {} -> {}: {}",
                        client_addr, target, e
                    );
                    continue;
                }
            };

        match association.socket.send(&buf[..n]).await {
            Ok(sent) => {
                association.touch();
                association
                    .bytes_sent
                    .fetch_add(sent as u64, Ordering::Relaxed);
            }
            Err(e) => warn!(
                "Error forwarding UDP data from {} to {}: {}",
                client_addr, target, e
            ),
        }
    }
}

/// Look up the client's association, creating it and its reply task if needed.
///
/// Only the receive loop inserts, so the map lock is not held while the new
/// socket is bound.
async fn associate(
    client_addr: SocketAddr,
    target: SocketAddr,
    listener: &Arc<UdpSocket>,
    associations: &Associations,
    replies: &mut Replies,
    ctx: &Arc<RelayContext>,
) -> io::Result<Arc<Association>> {
    if let Some(existing) = associations.lock().await.get(&client_addr) {
        return Ok(Arc::clone(existing));
    }

    let bind_addr: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(target).await?;
    let local_addr = socket.local_addr()?;

    let info = ConnectionInfo::new(
        ctx.session_id,
        Protocol::Udp,
        client_addr.to_string(),
        ctx.target.clone(),
    );
    let association = Arc::new(Association {
        id: info.id,
        socket,
        bytes_sent: AtomicU64::new(0),
        opened: Instant::now(),
        last_active: AtomicU64::new(0),
    });

    associations
        .lock()
        .await
        .insert(client_addr, Arc::clone(&association));
    ctx.stats.add_connection(info).await;

    debug!(
        "Created UDP association {} <-> {} on {}",
        client_addr, local_addr, ctx.key
    );

    replies.tasks.spawn(relay_replies(
        Arc::clone(&association),
        client_addr,
        Arc::clone(listener),
        Arc::clone(associations),
        Arc::clone(ctx),
        replies.halt.subscribe(),
    ));

    Ok(association)
}

/// Forward target replies back to one client until idle or halted.
async fn relay_replies(
    association: Arc<Association>,
    client_addr: SocketAddr,
    listener: Arc<UdpSocket>,
    associations: Associations,
    ctx: Arc<RelayContext>,
    mut halt: watch::Receiver<bool>,
) {
    let idle = ctx.limits.udp_idle_timeout();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut bytes_received: u64 = 0;

    loop {
        let deadline = association.idle_deadline(idle);
        tokio::select! {
            _ = stopped(&mut halt) => break,
            _ = time::sleep_until(deadline) => {
                // The client may have sent since the deadline was taken.
                if association.idle_deadline(idle) <= Instant::now() {
                    debug!("UDP association for {} idle, closing", client_addr);
                    break;
                }
            }
            reply = association.socket.recv(&mut buf) => match reply {
                Err(e) if is_transient(&e) => {
                    debug!("Target unreachable for {}: {}", client_addr, e);
                }
                Err(e) => {
                    warn!("Error reading UDP reply for {}: {}", client_addr, e);
                    break;
                }
                Ok(n) => {
                    association.touch();
                    match listener.send_to(&buf[..n], client_addr).await {
                        Ok(_) => bytes_received += n as u64,
                        Err(e) => warn!("Error forwarding UDP response to {}: {}", client_addr, e),
                    }
                }
            }
        }
    }

    {
        let mut map = associations.lock().await;
        if map
            .get(&client_addr)
            .is_some_and(|current| Arc::ptr_eq(current, &association))
        {
            map.remove(&client_addr);
        }
    }

    ctx.stats
        .close_connection(
            association.id,
            association.bytes_sent.load(Ordering::Relaxed),
            bytes_received,
        )
        .await;
}
