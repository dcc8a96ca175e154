//! Utilities for reading PEM files as [`Certificate`]s and [`PrivateKey`]s,
//! building the TLS acceptor and connector from the configuration, and
//! matching a presented certificate against the connection's peer address.

use std::{fs::File, io, io::Read, net::IpAddr, path::Path, sync::Arc};
use tokio_rustls::{
    rustls::{
        AllowAnyAuthenticatedClient, Certificate, ClientCertVerifier, ClientConfig, NoClientAuth,
        PrivateKey, RootCertStore, ServerConfig,
    },
    TlsAcceptor, TlsConnector,
};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::config;

/// Read the file at `path` into memory as a vector of PEM-encoded
/// `CERTIFICATE`s, silently skipping any entries which are not labeled
/// `CERTIFICATE`.
pub fn read_certificates(path: impl AsRef<Path>) -> Result<Vec<Certificate>, io::Error> {
    let mut file = File::open(&path)?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;

    let mut certificates = Vec::new();
    for pem::Pem { contents, .. } in pem::parse_many(contents)
        .into_iter()
        .filter(|p| p.tag == "CERTIFICATE")
    {
        certificates.push(Certificate(contents));
    }
    Ok(certificates)
}

/// Read the file at `path` as a single PEM-encoded private key.
pub fn read_private_key(path: impl AsRef<Path>) -> Result<PrivateKey, io::Error> {
    let mut file = File::open(&path)?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;

    let pem = pem::parse(contents).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid PEM encoding in private key: {}", e),
        )
    })?;
    match pem.tag.as_str() {
        "PRIVATE KEY" | "RSA PRIVATE KEY" | "EC PRIVATE KEY" => Ok(PrivateKey(pem.contents)),
        tag => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("not labeled as a private key: '{}'", tag),
        )),
    }
}

fn root_store(path: impl AsRef<Path>) -> Result<RootCertStore, io::Error> {
    let mut store = RootCertStore::empty();
    for certificate in read_certificates(path)? {
        store.add(&certificate).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "invalid CA certificate")
        })?;
    }
    Ok(store)
}

/// Build the acceptor for TLS listeners. Client certificates are demanded
/// and verified against `tls_cacert` when `tls_verify` is set; X.509 chain
/// and hostname validation are rustls' concern.
pub fn acceptor(server: &config::ServerConfig) -> Result<TlsAcceptor, io::Error> {
    let certificate_chain_path = server.tls_cert.as_ref().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "tls_cert is not configured")
    })?;
    let private_key_path = server.tls_key.as_ref().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "tls_key is not configured")
    })?;

    let client_auth: Arc<dyn ClientCertVerifier> = match (&server.tls_cacert, server.tls_verify) {
        (Some(cacert), true) => AllowAnyAuthenticatedClient::new(root_store(cacert)?),
        _ => NoClientAuth::new(),
    };

    let mut server_config = ServerConfig::new(client_auth);
    server_config
        .set_single_cert(
            read_certificates(certificate_chain_path)?,
            read_private_key(private_key_path)?,
        )
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid server certificate chain or private key",
            )
        })?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Build the connector used for TLS relay connections, trusting the
/// configured CA bundle.
pub fn connector(relay: &config::RelayConfig) -> Result<TlsConnector, io::Error> {
    let mut client_config = ClientConfig::new();
    if let Some(cacert) = &relay.tls_cacert {
        client_config.root_store = root_store(cacert)?;
    }
    Ok(TlsConnector::from(Arc::new(client_config)))
}

/// Match a chain-verified peer certificate against the connection's source
/// address: an iPAddress subjectAltName equal to the peer IP, a dNSName
/// spelling of it, or, only when the certificate carries no subjectAltName,
/// a common name spelling of it. The accept path aborts the connection on
/// a mismatch, before any protocol traffic.
pub fn validate_peer_identity(cert_der: &[u8], peer_ip: IpAddr) -> bool {
    let cert = match X509Certificate::from_der(cert_der) {
        Ok((_, cert)) => cert,
        Err(_) => return false,
    };
    let peer_text = peer_ip.to_string();

    match cert.subject_alternative_name() {
        Ok(Some(san)) => {
            for name in &san.value.general_names {
                match name {
                    GeneralName::IPAddress(octets) => {
                        let matched = match peer_ip {
                            IpAddr::V4(v4) => *octets == v4.octets(),
                            IpAddr::V6(v6) => *octets == v6.octets(),
                        };
                        if matched {
                            return true;
                        }
                    }
                    GeneralName::DNSName(dns) => {
                        if dns.eq_ignore_ascii_case(&peer_text) {
                            return true;
                        }
                    }
                    _ => {}
                }
            }
            false
        }
        // No subjectAltName extension: the common name decides.
        _ => cert
            .subject()
            .iter_common_name()
            .filter_map(|cn| cn.as_str().ok())
            .any(|cn| cn.eq_ignore_ascii_case(&peer_text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unparseable_certificate_never_matches() {
        assert!(!validate_peer_identity(
            b"not a certificate",
            "127.0.0.1".parse().unwrap()
        ));
        assert!(!validate_peer_identity(&[], "::1".parse().unwrap()));
    }
}
