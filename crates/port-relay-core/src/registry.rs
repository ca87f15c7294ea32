//! Registry of active relay sessions.
//!
//! A [`Registry`] is a cheap handle; clone it into whatever needs to start or
//! stop relays. It holds one table per protocol behind a single lock. The lock
//! only ever covers map bookkeeping: binding, resolving and all socket I/O
//! happen with it released.
//!
//! Starting a relay reserves its key under the lock, binds the socket, then
//! publishes the session and spawns its loop. Stopping removes the session,
//! fires its shutdown signal and waits for the loop task to exit, which only
//! happens once the listening socket is closed. Accepted TCP connections are
//! not waited for and keep pumping until a peer closes; UDP associations hold
//! the session's socket, so the loop reaps them before it exits.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::LimitsConfig;
use crate::endpoint::{Endpoint, Protocol, SessionKey};
use crate::error::{Error, Result};
use crate::relay::{datagram, stream, RelayContext};
use crate::stats::Stats;
use crate::store::Rule;

/// Public view of an active relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub protocol: Protocol,
    pub listen: Endpoint,
    /// Address the socket actually bound.
    pub bound_addr: SocketAddr,
    pub target: Endpoint,
    pub started_at: DateTime<Utc>,
}

/// A rule whose relay could not be started or stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleFailure {
    pub rule_id: String,
    pub protocol: Protocol,
    pub error: String,
}

struct Session {
    info: SessionInfo,
    shutdown: watch::Sender<bool>,
    /// Loop task; it owns the listening socket.
    task: JoinHandle<()>,
}

impl Session {
    /// Signal the loop and wait until it has closed the socket.
    ///
    /// Returns false if the loop had already exited on its own.
    async fn close(self) -> bool {
        let signalled = self.shutdown.send(true).is_ok();
        if let Err(e) = self.task.await {
            error!("{} relay loop failed: {}", self.info.listen, e);
        }
        signalled
    }
}

enum Slot {
    /// Key reserved while its socket is being bound.
    Starting,
    Running(Session),
}

#[derive(Default)]
struct SessionTable {
    stream: HashMap<SessionKey, Slot>,
    datagram: HashMap<SessionKey, Slot>,
}

impl SessionTable {
    fn map(&self, protocol: Protocol) -> &HashMap<SessionKey, Slot> {
        match protocol {
            Protocol::Tcp => &self.stream,
            Protocol::Udp => &self.datagram,
        }
    }

    fn map_mut(&mut self, protocol: Protocol) -> &mut HashMap<SessionKey, Slot> {
        match protocol {
            Protocol::Tcp => &mut self.stream,
            Protocol::Udp => &mut self.datagram,
        }
    }

    fn running(&self) -> impl Iterator<Item = &Session> {
        self.stream
            .values()
            .chain(self.datagram.values())
            .filter_map(|slot| match slot {
                Slot::Running(session) => Some(session),
                Slot::Starting => None,
            })
    }
}

struct Inner {
    sessions: Mutex<SessionTable>,
    limits: LimitsConfig,
    stats: Arc<Stats>,
}

/// Socket bound for a session that has not been published yet.
enum Bound {
    Stream(TcpListener),
    Datagram(UdpSocket, SocketAddr),
}

/// Handle to the table of active relays.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new(limits: LimitsConfig, stats: Arc<Stats>) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(SessionTable::default()),
                limits,
                stats,
            }),
        }
    }

    /// Statistics shared by every relay of this registry.
    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.inner.stats)
    }

    /// Start a TCP relay from `listen_addr:listen_port` to `target_addr:target_port`.
    pub async fn start_stream(
        &self,
        listen_addr: &str,
        listen_port: &str,
        target_addr: &str,
        target_port: &str,
    ) -> Result<SessionInfo> {
        self.start(Protocol::Tcp, listen_addr, listen_port, target_addr, target_port)
            .await
    }

    /// Stop the TCP relay listening on `listen_addr:listen_port`.
    pub async fn stop_stream(&self, listen_addr: &str, listen_port: &str) -> Result<()> {
        self.stop(Protocol::Tcp, listen_addr, listen_port).await
    }

    /// Start a UDP relay from `listen_addr:listen_port` to `target_addr:target_port`.
    pub async fn start_datagram(
        &self,
        listen_addr: &str,
        listen_port: &str,
        target_addr: &str,
        target_port: &str,
    ) -> Result<SessionInfo> {
        self.start(Protocol::Udp, listen_addr, listen_port, target_addr, target_port)
            .await
    }

    /// Stop the UDP relay bound on `listen_addr:listen_port`.
    pub async fn stop_datagram(&self, listen_addr: &str, listen_port: &str) -> Result<()> {
        self.stop(Protocol::Udp, listen_addr, listen_port).await
    }

    pub async fn is_stream_running(&self, listen_addr: &str, listen_port: &str) -> bool {
        self.is_running(Protocol::Tcp, listen_addr, listen_port).await
    }

    pub async fn is_datagram_running(&self, listen_addr: &str, listen_port: &str) -> bool {
        self.is_running(Protocol::Udp, listen_addr, listen_port).await
    }

    /// Active sessions, oldest first.
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let table = self.inner.sessions.lock().await;
        let mut sessions: Vec<_> = table.running().map(|s| s.info.clone()).collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    /// Number of active sessions across both protocols.
    pub async fn session_count(&self) -> usize {
        self.inner.sessions.lock().await.running().count()
    }

    /// Stop every active session. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let sessions: Vec<Session> = {
            let mut table = self.inner.sessions.lock().await;
            let mut drained = Vec::new();
            for protocol in [Protocol::Tcp, Protocol::Udp] {
                let map = table.map_mut(protocol);
                let keys: Vec<SessionKey> = map
                    .iter()
                    .filter(|(_, slot)| matches!(slot, Slot::Running(_)))
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in keys {
                    if let Some(Slot::Running(session)) = map.remove(&key) {
                        drained.push(session);
                    }
                }
            }
            drained
        };

        let count = sessions.len();
        join_all(sessions.into_iter().map(Session::close)).await;
        if count > 0 {
            info!("Stopped {} forwards", count);
        }
        count
    }

    /// Start the TCP and UDP relays of each rule. Failures are collected, not fatal.
    pub async fn start_rules(&self, rules: &[Rule]) -> Vec<RuleFailure> {
        let attempts = rules.iter().flat_map(|rule| {
            [Protocol::Tcp, Protocol::Udp].map(|protocol| async move {
                self.start(
                    protocol,
                    &rule.listen_addr,
                    &rule.listen_port,
                    &rule.target_addr,
                    &rule.target_port,
                )
                .await
                .err()
                .map(|e| RuleFailure {
                    rule_id: rule.id.clone(),
                    protocol,
                    error: e.to_string(),
                })
            })
        });

        join_all(attempts).await.into_iter().flatten().collect()
    }

    /// Stop the TCP and UDP relays of each rule. Failures are collected, not fatal.
    pub async fn stop_rules(&self, rules: &[Rule]) -> Vec<RuleFailure> {
        let mut failures = Vec::new();
        for rule in rules {
            for protocol in [Protocol::Tcp, Protocol::Udp] {
                if let Err(e) = self
                    .stop(protocol, &rule.listen_addr, &rule.listen_port)
                    .await
                {
                    failures.push(RuleFailure {
                        rule_id: rule.id.clone(),
                        protocol,
                        error: e.to_string(),
                    });
                }
            }
        }
        failures
    }

    async fn start(
        &self,
        protocol: Protocol,
        listen_addr: &str,
        listen_port: &str,
        target_addr: &str,
        target_port: &str,
    ) -> Result<SessionInfo> {
        let listen = Endpoint::listen(listen_addr, listen_port)?;
        let target = Endpoint::target(target_addr, target_port)?;
        let key = SessionKey::new(protocol, listen.clone());

        self.reserve(&key).await?;

        let (bound, bound_addr) = match bind(&key, &target).await {
            Ok(bound) => bound,
            Err(e) => {
                self.release(&key).await;
                return Err(e);
            }
        };

        let info = SessionInfo {
            id: Uuid::new_v4(),
            protocol,
            listen,
            bound_addr,
            target: target.clone(),
            started_at: Utc::now(),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = Arc::new(RelayContext {
            session_id: info.id,
            key: key.clone(),
            target,
            limits: self.inner.limits.clone(),
            stats: Arc::clone(&self.inner.stats),
        });

        // Publish before the loop can run so a fatal error always finds its entry.
        let mut table = self.inner.sessions.lock().await;
        let task = spawn_loop(Arc::downgrade(&self.inner), bound, ctx, shutdown_rx);
        table.map_mut(protocol).insert(
            key,
            Slot::Running(Session {
                info: info.clone(),
                shutdown: shutdown_tx,
                task,
            }),
        );
        drop(table);

        info!(
            "Started {} forward: {} -> {}",
            protocol.as_str().to_uppercase(),
            info.listen,
            info.target
        );
        Ok(info)
    }

    async fn stop(&self, protocol: Protocol, listen_addr: &str, listen_port: &str) -> Result<()> {
        let key = SessionKey::new(protocol, Endpoint::listen(listen_addr, listen_port)?);

        let session = {
            let mut table = self.inner.sessions.lock().await;
            let map = table.map_mut(protocol);
            match map.remove(&key) {
                Some(Slot::Running(session)) => session,
                Some(Slot::Starting) => {
                    map.insert(key.clone(), Slot::Starting);
                    return Err(Error::NotRunning(key));
                }
                None => return Err(Error::NotRunning(key)),
            }
        };

        if !session.close().await {
            warn!("{} relay loop had already exited", key);
            return Err(Error::CloseFailed(key));
        }

        info!(
            "Stopped {} forward: {}",
            protocol.as_str().to_uppercase(),
            key.listen
        );
        Ok(())
    }

    async fn is_running(&self, protocol: Protocol, listen_addr: &str, listen_port: &str) -> bool {
        let Ok(listen) = Endpoint::listen(listen_addr, listen_port) else {
            return false;
        };
        let key = SessionKey::new(protocol, listen);

        let table = self.inner.sessions.lock().await;
        matches!(table.map(protocol).get(&key), Some(Slot::Running(_)))
    }

    async fn reserve(&self, key: &SessionKey) -> Result<()> {
        let mut table = self.inner.sessions.lock().await;
        let map = table.map_mut(key.protocol);
        if map.contains_key(key) {
            return Err(Error::AlreadyRunning(key.clone()));
        }
        map.insert(key.clone(), Slot::Starting);
        Ok(())
    }

    async fn release(&self, key: &SessionKey) {
        let mut table = self.inner.sessions.lock().await;
        let map = table.map_mut(key.protocol);
        if matches!(map.get(key), Some(Slot::Starting)) {
            map.remove(key);
        }
    }
}

impl Inner {
    /// Drop a session whose loop died, unless it was already replaced.
    async fn forget(&self, key: &SessionKey, session_id: Uuid) {
        let mut table = self.sessions.lock().await;
        let map = table.map_mut(key.protocol);
        if matches!(map.get(key), Some(Slot::Running(s)) if s.info.id == session_id) {
            map.remove(key);
        }
    }
}

/// Bind the listening socket for `key`, resolving a UDP target first.
async fn bind(key: &SessionKey, target: &Endpoint) -> Result<(Bound, SocketAddr)> {
    let addr = key.listen.socket_addr_string();
    let bind_failed = |source| Error::BindFailed {
        addr: addr.clone(),
        source,
    };

    match key.protocol {
        Protocol::Tcp => {
            let listener = TcpListener::bind(&addr).await.map_err(bind_failed)?;
            let local = listener.local_addr()?;
            Ok((Bound::Stream(listener), local))
        }
        Protocol::Udp => {
            let target_addr = resolve(target).await?;
            let socket = UdpSocket::bind(&addr).await.map_err(bind_failed)?;
            let local = socket.local_addr()?;
            Ok((Bound::Datagram(socket, target_addr), local))
        }
    }
}

async fn resolve(target: &Endpoint) -> Result<SocketAddr> {
    let addr = target.socket_addr_string();
    let mut resolved = tokio::net::lookup_host(&addr)
        .await
        .map_err(|e| Error::AddressResolution(format!("{}: {}", addr, e)))?;
    let first = resolved
        .next()
        .ok_or_else(|| Error::AddressResolution(format!("{}: no addresses", addr)));
    first
}

fn spawn_loop(
    registry: Weak<Inner>,
    bound: Bound,
    ctx: Arc<RelayContext>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = match bound {
            Bound::Stream(listener) => {
                stream::accept_loop(listener, Arc::clone(&ctx), shutdown).await
            }
            Bound::Datagram(socket, target) => {
                datagram::receive_loop(Arc::new(socket), target, Arc::clone(&ctx), shutdown).await
            }
        };

        if let Err(e) = result {
            error!("{} relay loop stopped: {}", ctx.key, e);
            if let Some(inner) = registry.upgrade() {
                inner.forget(&ctx.key, ctx.session_id).await;
            }
        }
    })
}
