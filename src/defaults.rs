use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::config::ListenAddress;

/// Identifier sent in every ServerHello.
pub const SERVER_ID: &str = concat!("Sudo Audit Server ", env!("CARGO_PKG_VERSION"));

pub const CONFIG_FILE: &str = "/etc/sudo_logsrvd.conf";

/// Default port for both plaintext and TLS listeners.
pub const fn port() -> u16 {
    30343
}

pub fn listen_address() -> Vec<ListenAddress> {
    vec![ListenAddress {
        addr: SocketAddr::from(([0, 0, 0, 0], port())),
        tls: false,
    }]
}

/// Per-connection I/O timeout for writes and the TLS handshake. Reads have
/// no timeout; client messages may arrive at arbitrary times.
pub const fn server_timeout() -> Duration {
    Duration::from_secs(30)
}

/// How often durable progress is acknowledged to the client.
pub const fn ack_frequency() -> Duration {
    Duration::from_secs(10)
}

/// How long graceful shutdown waits for clients to drain before forcing exit.
pub const fn shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Upper bound on a single wire message, guarding against hostile peers.
pub const fn max_message_size() -> usize {
    2 * 1024 * 1024
}

pub const fn tcp_keepalive() -> bool {
    true
}

pub fn pid_file() -> Option<PathBuf> {
    Some(PathBuf::from("/var/run/sudo/sudo_logsrvd.pid"))
}

pub fn iolog_dir() -> PathBuf {
    PathBuf::from("/var/log/sudo-io")
}

pub const fn iolog_mode() -> u32 {
    0o600
}

pub fn journal_dir() -> PathBuf {
    PathBuf::from("/var/log/sudo_logsrvd")
}

pub fn eventlog_file() -> PathBuf {
    PathBuf::from("/var/log/sudo.log")
}

pub const fn relay_connect_timeout() -> Duration {
    Duration::from_secs(30)
}
