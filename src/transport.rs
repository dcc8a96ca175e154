//! The transport layer: plain TCP or TLS streams and their configuration.

pub mod stream;
pub mod tls;

pub use stream::IoStream;
