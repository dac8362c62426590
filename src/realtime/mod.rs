pub mod client;
pub mod events;
pub mod hub;

pub use client::run_connection;
pub use hub::{Hub, PeerHandle, OUTBOUND_QUEUE_SIZE, REQUIRED_PEERS};
