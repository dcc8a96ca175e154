//! Listening sockets: one accept loop per configured address.

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpStream},
    time,
};
use tokio_rustls::rustls::Session;
use tracing::{debug, error, info, warn};

use crate::config::ListenAddress;
use crate::server::{connection, ServerContext};
use crate::transport::{tls, IoStream};

pub(crate) struct Listener {
    inner: TcpListener,
    tls: bool,
}

impl Listener {
    /// Create a non-blocking listening socket for `address`.
    pub(crate) fn bind(address: &ListenAddress) -> io::Result<Listener> {
        let domain = if address.addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        if address.addr.is_ipv6() {
            // Disable IPv4-mapped IPv6 addresses; v4 gets its own listener.
            socket.set_only_v6(true)?;
        }
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&address.addr.into())?;
        socket.listen(1024)?;

        let listener = TcpListener::from_std(socket.into())?;
        Ok(Listener {
            inner: listener,
            tls: address.tls,
        })
    }

    /// Accept connections forever, spawning one task per client.
    pub(crate) async fn accept_loop(self, ctx: Arc<ServerContext>) {
        loop {
            match self.inner.accept().await {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_client(stream, peer, self.tls, ctx.clone()));
                }
                Err(err) => {
                    warn!("unable to accept new connection: {}", err);
                    // Back off briefly so fd exhaustion does not spin.
                    time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn handle_client(stream: TcpStream, peer: SocketAddr, tls: bool, ctx: Arc<ServerContext>) {
    let peer_ip = peer.ip().to_string();
    info!(peer = %peer_ip, "new connection");

    if ctx.config.server.tcp_keepalive {
        if let Err(err) = SockRef::from(&stream).set_keepalive(true) {
            debug!(peer = %peer_ip, "unable to set SO_KEEPALIVE: {}", err);
        }
    }
    // Protocol messages are small; send them immediately.
    if let Err(err) = stream.set_nodelay(true) {
        debug!(peer = %peer_ip, "unable to set TCP_NODELAY: {}", err);
    }

    let io_stream = if tls {
        let acceptor = match &ctx.tls_acceptor {
            Some(acceptor) => acceptor.clone(),
            None => {
                error!(peer = %peer_ip, "TLS listener without TLS configuration");
                return;
            }
        };
        match time::timeout(ctx.config.server.timeout, acceptor.accept(stream)).await {
            Ok(Ok(tls_stream)) => {
                // Chain trust is rustls' job; the certificate must also name
                // the address the connection actually came from.
                if ctx.config.server.tls_verify
                    && !peer_certificate_matches(&tls_stream, peer.ip())
                {
                    error!(peer = %peer_ip, "peer certificate does not match connection address");
                    return;
                }
                IoStream::from(tls_stream)
            }
            Ok(Err(err)) => {
                error!(peer = %peer_ip, "TLS handshake error: {}", err);
                return;
            }
            Err(_) => {
                error!(peer = %peer_ip, "TLS handshake timed out");
                return;
            }
        }
    } else {
        IoStream::from(stream)
    };

    if let Some((version, cipher)) = io_stream.tls_parameters() {
        debug!(peer = %peer_ip, "TLS version: {}, negotiated cipher suite: {}", version, cipher);
    }

    if let Err(err) = connection::handle(io_stream, peer_ip.clone(), ctx).await {
        debug!(peer = %peer_ip, "connection ended with error: {}", err);
    }
}

fn peer_certificate_matches(
    tls_stream: &tokio_rustls::server::TlsStream<TcpStream>,
    peer_ip: IpAddr,
) -> bool {
    let (_, session) = tls_stream.get_ref();
    match session
        .get_peer_certificates()
        .as_ref()
        .and_then(|certs| certs.first())
    {
        Some(cert) => tls::validate_peer_identity(&cert.0, peer_ip),
        None => false,
    }
}
