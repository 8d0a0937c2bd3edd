//! remit — one-way delta file synchronization over an authenticated transport.
//!
//! The client inventories local sources, a worker deployed on the remote host
//! classifies them against the destination tree, and only missing content or
//! changed byte regions cross the wire, zstd-compressed, inside a framed
//! binary protocol.

pub mod bootstrap;
pub mod checksum;
pub mod classify;
pub mod client;
pub mod delta;
pub mod error;
pub mod filter;
pub mod inventory;
pub mod logger;
pub mod options;
pub mod progress;
pub mod protocol;
pub mod pump;
pub mod remote;
pub mod server;
pub mod session;
