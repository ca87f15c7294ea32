//! # Port-Relay API
//!
//! REST control API for starting and stopping relays and managing rules.

pub mod handlers;
pub mod router;

pub use handlers::AppState;
pub use router::create_router;
