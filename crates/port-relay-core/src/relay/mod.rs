//! Forwarding loops owned by relay sessions.

pub mod datagram;
pub mod pump;
pub mod stream;

pub use pump::relay_tcp;

use std::io;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::LimitsConfig;
use crate::endpoint::{Endpoint, SessionKey};
use crate::stats::Stats;

/// State a session's loop and its per-connection tasks share.
#[derive(Debug)]
pub(crate) struct RelayContext {
    pub session_id: Uuid,
    pub key: SessionKey,
    pub target: Endpoint,
    pub limits: LimitsConfig,
    pub stats: Arc<Stats>,
}

/// Resolves once the session is stopped or its registry entry is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(unix)]
fn is_descriptor_exhaustion(err: &io::Error) -> bool {
    // ENFILE, EMFILE
    matches!(err.raw_os_error(), Some(23) | Some(24))
}

#[cfg(not(unix))]
fn is_descriptor_exhaustion(_err: &io::Error) -> bool {
    false
}

/// Errors a listening socket can report without being dead.
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || is_descriptor_exhaustion(err)
}
