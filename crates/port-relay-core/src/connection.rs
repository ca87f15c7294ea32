//! Records for relayed TCP connections and UDP client associations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::endpoint::{Endpoint, Protocol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Active,
    Closed,
}

/// One relayed flow: a TCP connection, or all datagrams from one UDP client
/// while its association lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: Uuid,
    /// Relay session that accepted the flow.
    pub session_id: Uuid,
    pub protocol: Protocol,
    /// Peer address as seen by the listening socket.
    pub client_addr: String,
    pub target: Endpoint,
    pub state: ConnectionState,
    pub connected_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Client to target.
    pub bytes_sent: u64,
    /// Target to client.
    pub bytes_received: u64,
}

impl ConnectionInfo {
    pub fn new(session_id: Uuid, protocol: Protocol, client_addr: String, target: Endpoint) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            protocol,
            client_addr,
            target,
            state: ConnectionState::Active,
            connected_at: Utc::now(),
            closed_at: None,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    /// Close the record with the final byte counts of the flow.
    pub fn finish(&mut self, bytes_sent: u64, bytes_received: u64) {
        self.state = ConnectionState::Closed;
        self.closed_at = Some(Utc::now());
        self.bytes_sent = bytes_sent;
        self.bytes_received = bytes_received;
    }

    /// Lifetime of the flow so far, or until it closed.
    pub fn duration_secs(&self) -> i64 {
        let end = self.closed_at.unwrap_or_else(Utc::now);
        (end - self.connected_at).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_records_totals() {
        let target = Endpoint::target("127.0.0.1", "80").unwrap();
        let mut info = ConnectionInfo::new(Uuid::new_v4(), Protocol::Tcp, "127.0.0.1:5000".into(), target);
        assert_eq!(info.state, ConnectionState::Active);
        assert!(info.closed_at.is_none());

        info.finish(10, 20);

        assert_eq!(info.state, ConnectionState::Closed);
        assert_eq!((info.bytes_sent, info.bytes_received), (10, 20));
        assert!(info.duration_secs() >= 0);
    }
}
