//! SSH front end and upstream client.
//!
//! Accepts SSH connections from Git clients, authenticates them against the
//! identity store and hands each exec request to the relay.  Outbound
//! connections to the forge authenticate with the client's forwarded agent.

pub mod channel;
pub mod server;
pub mod session;
pub mod upstream;

pub use server::{load_host_key, start_ssh_server, HostKeySource};
pub use upstream::RusshConnector;
