//! Inbound developer identities and upstream host-key pinning.
//!
//! Both tables are loaded at startup and only read afterwards.

pub mod identity;
pub mod known_hosts;

pub use identity::{wire_format, FileIdentityStore, IdentityStore, UserIdentity};
pub use known_hosts::{fingerprint_of, KnownHosts};
