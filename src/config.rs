//! Server configuration, read from a TOML file at startup and on SIGHUP.

use {
    anyhow::Context,
    serde::{de, Deserialize, Deserializer},
    std::{
        fmt::{self, Display},
        net::SocketAddr,
        path::{Path, PathBuf},
        str::FromStr,
        time::Duration,
    },
    thiserror::Error,
};

use crate::defaults;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub iolog: IoLogConfig,
    #[serde(default)]
    pub eventlog: EventLogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct ServerConfig {
    #[serde(default = "defaults::listen_address")]
    pub listen_address: Vec<ListenAddress>,
    #[serde(with = "humantime_serde", default = "defaults::server_timeout")]
    pub timeout: Duration,
    #[serde(with = "humantime_serde", default = "defaults::ack_frequency")]
    pub ack_frequency: Duration,
    #[serde(with = "humantime_serde", default = "defaults::shutdown_timeout")]
    pub shutdown_timeout: Duration,
    #[serde(default = "defaults::max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "defaults::tcp_keepalive")]
    pub tcp_keepalive: bool,
    #[serde(default = "defaults::pid_file")]
    pub pid_file: Option<PathBuf>,
    /// PEM private key for TLS listeners.
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
    /// PEM certificate chain for TLS listeners.
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,
    /// CA bundle used to verify client certificates when `tls_verify` is set.
    #[serde(default)]
    pub tls_cacert: Option<PathBuf>,
    #[serde(default)]
    pub tls_verify: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_address: defaults::listen_address(),
            timeout: defaults::server_timeout(),
            ack_frequency: defaults::ack_frequency(),
            shutdown_timeout: defaults::shutdown_timeout(),
            max_message_size: defaults::max_message_size(),
            tcp_keepalive: defaults::tcp_keepalive(),
            pid_file: defaults::pid_file(),
            tls_key: None,
            tls_cert: None,
            tls_cacert: None,
            tls_verify: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct RelayConfig {
    /// Upstream log servers, tried in order until one accepts.
    #[serde(default)]
    pub relay_host: Vec<RelayAddress>,
    /// Journal to disk first, then replay to the relay once the client is done.
    #[serde(default)]
    pub store_first: bool,
    #[serde(default = "defaults::journal_dir")]
    pub journal_dir: PathBuf,
    #[serde(with = "humantime_serde", default = "defaults::relay_connect_timeout")]
    pub connect_timeout: Duration,
    /// CA bundle used to verify relay server certificates.
    #[serde(default)]
    pub tls_cacert: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            relay_host: Vec::new(),
            store_first: false,
            journal_dir: defaults::journal_dir(),
            connect_timeout: defaults::relay_connect_timeout(),
            tls_cacert: None,
        }
    }
}

impl RelayConfig {
    pub fn enabled(&self) -> bool {
        !self.relay_host.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct IoLogConfig {
    #[serde(default = "defaults::iolog_dir")]
    pub iolog_dir: PathBuf,
    /// Permissions for I/O log files, e.g. "0600".
    #[serde(
        deserialize_with = "deserialize_octal_mode",
        default = "defaults::iolog_mode"
    )]
    pub iolog_mode: u32,
}

impl Default for IoLogConfig {
    fn default() -> Self {
        IoLogConfig {
            iolog_dir: defaults::iolog_dir(),
            iolog_mode: defaults::iolog_mode(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct EventLogConfig {
    #[serde(default)]
    pub log_type: EventLogType,
    #[serde(default = "defaults::eventlog_file")]
    pub log_file: PathBuf,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        EventLogConfig {
            log_type: EventLogType::default(),
            log_file: defaults::eventlog_file(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLogType {
    /// JSON-lines records appended to `log_file`.
    Json,
    /// Structured records through the process log stream.
    Tracing,
    None,
}

impl Default for EventLogType {
    fn default() -> Self {
        EventLogType::Tracing
    }
}

fn deserialize_octal_mode<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let raw = String::deserialize(deserializer)?;
    u32::from_str_radix(&raw, 8)
        .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(&raw), &"an octal file mode"))
}

/// A local address to listen on, like `0.0.0.0:30343` or `[::]:30343(tls)`.
/// A leading `*` stands for the IPv4 wildcard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ListenAddress {
    pub addr: SocketAddr,
    pub tls: bool,
}

#[derive(Debug, Error)]
pub enum InvalidAddress {
    #[error("invalid listen address: {0}")]
    Listen(String),
    #[error("invalid relay address: {0}")]
    Relay(String),
    #[error("invalid port in address: {0}")]
    Port(String),
}

fn split_tls_suffix(s: &str) -> (&str, bool) {
    match s.strip_suffix("(tls)") {
        Some(rest) => (rest, true),
        None => (s, false),
    }
}

impl FromStr for ListenAddress {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rest, tls) = split_tls_suffix(s);
        let rest = match rest.strip_prefix("*:") {
            Some(port) => format!("0.0.0.0:{}", port),
            None => rest.to_string(),
        };
        let addr = rest
            .parse()
            .map_err(|_| InvalidAddress::Listen(s.to_string()))?;
        Ok(ListenAddress { addr, tls })
    }
}

impl Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}", self.addr, if self.tls { "(tls)" } else { "" })
    }
}

impl<'de> Deserialize<'de> for ListenAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(de::Error::custom)
    }
}

/// An upstream relay, `host[:port][(tls)]` where host may be a DNS name,
/// an IPv4 address, or a bracketed IPv6 address.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl FromStr for RelayAddress {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rest, tls) = split_tls_suffix(s);
        if rest.is_empty() {
            return Err(InvalidAddress::Relay(s.to_string()));
        }

        // Bracketed IPv6 hosts keep their colons.
        let (host, port) = if let Some(v6) = rest.strip_prefix('[') {
            match v6.split_once(']') {
                Some((host, "")) => (host, None),
                Some((host, port)) => (
                    host,
                    Some(port.strip_prefix(':').ok_or_else(|| {
                        InvalidAddress::Relay(s.to_string())
                    })?),
                ),
                None => return Err(InvalidAddress::Relay(s.to_string())),
            }
        } else {
            match rest.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };

        let port = match port {
            Some(p) => p
                .parse()
                .map_err(|_| InvalidAddress::Port(s.to_string()))?,
            None => defaults::port(),
        };

        Ok(RelayAddress {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

impl Display for RelayAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl<'de> Deserialize<'de> for RelayAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(de::Error::custom)
    }
}

impl Config {
    pub async fn load(config_path: impl AsRef<Path>) -> Result<Config, anyhow::Error> {
        let config_path = config_path.as_ref();
        let contents = tokio::fs::read_to_string(config_path)
            .await
            .with_context(|| format!("could not read {}", config_path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("could not parse {}", config_path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.server.listen_address.is_empty() {
            anyhow::bail!("no listen addresses configured");
        }
        if self.server.listen_address.iter().any(|l| l.tls)
            && (self.server.tls_cert.is_none() || self.server.tls_key.is_none())
        {
            anyhow::bail!("TLS listeners require tls_cert and tls_key");
        }
        if self.relay.store_first && !self.relay.enabled() {
            anyhow::bail!("store_first requires at least one relay_host");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_address_parses_wildcard_and_tls() {
        let plain: ListenAddress = "*:30343".parse().unwrap();
        assert_eq!(plain.addr, "0.0.0.0:30343".parse::<SocketAddr>().unwrap());
        assert!(!plain.tls);

        let tls: ListenAddress = "[::1]:30344(tls)".parse().unwrap();
        assert_eq!(tls.addr, "[::1]:30344".parse::<SocketAddr>().unwrap());
        assert!(tls.tls);

        assert!("not-an-address".parse::<ListenAddress>().is_err());
    }

    #[test]
    fn relay_address_parses_host_port_and_tls() {
        let relay: RelayAddress = "logs.example.com:30344(tls)".parse().unwrap();
        assert_eq!(relay.host, "logs.example.com");
        assert_eq!(relay.port, 30344);
        assert!(relay.tls);

        let bare: RelayAddress = "10.0.0.1".parse().unwrap();
        assert_eq!(bare.port, defaults::port());
        assert!(!bare.tls);

        let v6: RelayAddress = "[fe80::1]:2000".parse().unwrap();
        assert_eq!(v6.host, "fe80::1");
        assert_eq!(v6.port, 2000);
    }

    #[test]
    fn config_parses_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen_address = ["127.0.0.1:3000"]
            timeout = "45s"

            [iolog]
            iolog_mode = "0640"

            [eventlog]
            log_type = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.timeout, Duration::from_secs(45));
        assert_eq!(config.server.ack_frequency, defaults::ack_frequency());
        assert_eq!(config.iolog.iolog_mode, 0o640);
        assert_eq!(config.eventlog.log_type, EventLogType::Json);
        assert!(!config.relay.enabled());
    }

    #[test]
    fn store_first_without_relay_is_rejected() {
        let config: Config = toml::from_str(
            r#"
            [relay]
            store_first = true
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
