//! Sudo audit log server: receives command execution events and terminal
//! I/O captures from sudo clients over a framed TCP/TLS protocol, persists
//! them as event logs and replayable I/O logs, and acknowledges durable
//! progress back to the client. Optionally forwards or store-and-forwards
//! every connection to an upstream log server.

pub mod cli;
pub mod codec;
pub mod config;
pub mod defaults;
pub mod eventlog;
pub mod iolog;
pub mod journal;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod transport;
