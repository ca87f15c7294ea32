//! # Port-Relay Core
//!
//! Core library for the port-relay forwarding service.
//! Provides the relay registry, TCP stream relays, UDP datagram relays and the
//! persistent rule store.

pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod interfaces;
pub mod registry;
pub mod relay;
pub mod stats;
pub mod store;

pub use config::{Config, LimitsConfig, LoggingConfig, ServerConfig, StartupConfig, StorageConfig};
pub use connection::{ConnectionInfo, ConnectionState};
pub use endpoint::{Endpoint, Protocol, SessionKey};
pub use error::{Error, Result};
pub use interfaces::{local_ipv4_addresses, LocalAddress};
pub use registry::{Registry, RuleFailure, SessionInfo};
pub use stats::{AggregatedStats, Stats};
pub use store::{Rule, RuleStore, RuleUpdate, Template};
