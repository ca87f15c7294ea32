//! Traffic counters and the connection ledger shared by every relay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::connection::ConnectionInfo;

/// Point-in-time snapshot of the counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Flows whose target could not be dialed.
    pub failed_dials: u64,
    /// Client to target, summed over closed flows.
    pub total_bytes_sent: u64,
    /// Target to client, summed over closed flows.
    pub total_bytes_received: u64,
    pub uptime_secs: i64,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Counters {
    opened: AtomicU64,
    failed_dials: AtomicU64,
    sent: AtomicU64,
    received: AtomicU64,
}

/// Open flows by id plus a bounded tail of closed ones.
#[derive(Debug, Default)]
struct Ledger {
    open: HashMap<Uuid, ConnectionInfo>,
    closed: VecDeque<ConnectionInfo>,
}

#[derive(Debug)]
pub struct Stats {
    counters: Counters,
    ledger: RwLock<Ledger>,
    max_history: usize,
    started_at: DateTime<Utc>,
}

impl Stats {
    /// `max_history` bounds the closed-flow tail; 0 keeps none.
    pub fn new(max_history: usize) -> Self {
        Self {
            counters: Counters::default(),
            ledger: RwLock::new(Ledger::default()),
            max_history,
            started_at: Utc::now(),
        }
    }

    pub async fn add_connection(&self, info: ConnectionInfo) {
        self.counters.opened.fetch_add(1, Ordering::Relaxed);
        self.ledger.write().await.open.insert(info.id, info);
    }

    pub fn record_failed_dial(&self) {
        self.counters.failed_dials.fetch_add(1, Ordering::Relaxed);
    }

    /// Close an open flow and append it to history. Unknown ids are ignored.
    pub async fn close_connection(&self, id: Uuid, bytes_sent: u64, bytes_received: u64) {
        let mut ledger = self.ledger.write().await;
        let Some(mut info) = ledger.open.remove(&id) else {
            return;
        };

        info.finish(bytes_sent, bytes_received);
        self.counters.sent.fetch_add(bytes_sent, Ordering::Relaxed);
        self.counters
            .received
            .fetch_add(bytes_received, Ordering::Relaxed);
        debug!(
            "Connection {} from {} closed after {}s",
            info.id,
            info.client_addr,
            info.duration_secs()
        );

        if self.max_history == 0 {
            return;
        }
        while ledger.closed.len() >= self.max_history {
            ledger.closed.pop_front();
        }
        ledger.closed.push_back(info);
    }

    pub async fn get_aggregated(&self) -> AggregatedStats {
        let open = self.ledger.read().await.open.len() as u64;

        AggregatedStats {
            total_connections: self.counters.opened.load(Ordering::Relaxed),
            active_connections: open,
            failed_dials: self.counters.failed_dials.load(Ordering::Relaxed),
            total_bytes_sent: self.counters.sent.load(Ordering::Relaxed),
            total_bytes_received: self.counters.received.load(Ordering::Relaxed),
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            started_at: self.started_at,
        }
    }

    /// Open flows, oldest first.
    pub async fn get_active(&self) -> Vec<ConnectionInfo> {
        let mut open: Vec<_> = self.ledger.read().await.open.values().cloned().collect();
        open.sort_by_key(|info| info.connected_at);
        open
    }

    /// Closed flows, newest first.
    pub async fn get_history(&self, limit: Option<usize>) -> Vec<ConnectionInfo> {
        let ledger = self.ledger.read().await;
        let limit = limit.unwrap_or(usize::MAX);
        ledger.closed.iter().rev().take(limit).cloned().collect()
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new(1000)
    }
}
