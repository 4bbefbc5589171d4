//! Git transport plumbing: exec command validation and pkt-line framing.
//!
//! The gateway never interprets pack contents; it only needs to know which
//! command a client asked for, which repository it targets, and where the
//! upstream's capability advertisement ends.

pub mod command;
pub mod pktline;

pub use command::{parse_exec, CommandError, ExecCommand, GitCommand, RepoTarget};
