//! AgentRelay Protocol
//!
//! Shared types for communication between the relay server and clients.
//! Chat responses are framed as NDJSON event streams; subscriber
//! connections receive the same events as JSON over WebSocket.

use uuid::Uuid;

// Re-exports
pub mod client;
pub mod server;
pub mod types;

pub use client::{ChatRequest, ExecutionOptions};
pub use server::SubscriberMessage;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
