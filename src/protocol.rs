//! Wire messages exchanged between a sudo client and the audit server.
//!
//! Every message travels inside a frame: a 4-byte network-byte-order length
//! followed by the bincode encoding of a [`ClientMessage`] or
//! [`ServerMessage`]. The framing itself lives in [`crate::codec`].

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::time::Duration;
use thiserror::Error;

/// Seconds/nanoseconds pair used for submit times, I/O delays and commit
/// points. Nanoseconds are kept normalized to `0..1_000_000_000`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TimeSpec {
    pub tv_sec: i64,
    pub tv_nsec: i32,
}

pub const NSEC_PER_SEC: i32 = 1_000_000_000;

impl TimeSpec {
    pub const fn new(tv_sec: i64, tv_nsec: i32) -> Self {
        TimeSpec { tv_sec, tv_nsec }
    }

    /// True once any time has been recorded, mirroring `timespecisset`.
    pub fn is_set(&self) -> bool {
        self.tv_sec != 0 || self.tv_nsec != 0
    }

    /// Accumulate a delay, normalizing the nanosecond carry.
    pub fn add(&mut self, other: TimeSpec) {
        self.tv_sec += other.tv_sec;
        self.tv_nsec += other.tv_nsec;
        if self.tv_nsec >= NSEC_PER_SEC {
            self.tv_sec += 1;
            self.tv_nsec -= NSEC_PER_SEC;
        }
    }
}

impl From<Duration> for TimeSpec {
    fn from(d: Duration) -> Self {
        TimeSpec {
            tv_sec: d.as_secs() as i64,
            tv_nsec: d.subsec_nanos() as i32,
        }
    }
}

impl Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}, {}]", self.tv_sec, self.tv_nsec)
    }
}

/// A single key/value pair of command metadata from the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoMessage {
    pub key: String,
    pub value: InfoValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InfoValue {
    Number(i64),
    String(String),
    StringList(Vec<String>),
}

impl InfoMessage {
    pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        InfoMessage {
            key: key.into(),
            value: InfoValue::String(value.into()),
        }
    }

    pub fn number(key: impl Into<String>, value: i64) -> Self {
        InfoMessage {
            key: key.into(),
            value: InfoValue::Number(value),
        }
    }

    /// The value as a string, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            InfoValue::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Command accepted by the policy; opens the event (and optionally I/O) log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptMessage {
    pub submit_time: TimeSpec,
    pub info_msgs: Vec<InfoMessage>,
    /// Whether the client will stream I/O buffers for this session.
    pub expect_iobufs: bool,
}

/// Command rejected by the policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectMessage {
    pub submit_time: TimeSpec,
    pub reason: String,
    pub info_msgs: Vec<InfoMessage>,
}

/// Command finished; `run_time` is the total elapsed time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitMessage {
    pub exit_value: i32,
    pub error: String,
    pub signal: String,
    pub dumped_core: bool,
    pub run_time: Option<TimeSpec>,
}

/// Resume an interrupted session at `resume_point`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartMessage {
    pub log_id: String,
    pub resume_point: TimeSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMessage {
    pub alert_time: TimeSpec,
    pub reason: String,
    pub info_msgs: Vec<InfoMessage>,
}

/// A chunk of captured terminal or fd data, `delay` after the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoBuffer {
    pub delay: TimeSpec,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeWindowSize {
    pub delay: TimeSpec,
    pub rows: u32,
    pub cols: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSuspend {
    pub delay: TimeSpec,
    /// Signal name without the SIG prefix, e.g. "TSTP" or "CONT".
    pub signal: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientHello {
    pub client_id: String,
}

/// Everything a client may send, one message per frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    Hello(ClientHello),
    Accept(AcceptMessage),
    Reject(RejectMessage),
    Exit(ExitMessage),
    Restart(RestartMessage),
    Alert(AlertMessage),
    TtyinBuf(IoBuffer),
    TtyoutBuf(IoBuffer),
    StdinBuf(IoBuffer),
    StdoutBuf(IoBuffer),
    StderrBuf(IoBuffer),
    WinsizeEvent(ChangeWindowSize),
    SuspendEvent(CommandSuspend),
}

/// Number of [`ClientMessage`] variants; must track the enum. Bincode
/// encodes the variant as a little-endian u32 tag, so a payload carrying a
/// tag at or past this bound is a well-framed message of an unknown type
/// rather than a corrupt one.
const CLIENT_MESSAGE_VARIANTS: u32 = 13;

#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame carried a message type this server does not know.
    #[error("unrecognized ClientMessage type {0}")]
    UnknownType(u32),
    #[error(transparent)]
    Malformed(#[from] bincode::Error),
}

impl ClientMessage {
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        match bincode::deserialize(buf) {
            Ok(msg) => Ok(msg),
            Err(err) => {
                if buf.len() >= 4 {
                    let tag = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
                    if tag >= CLIENT_MESSAGE_VARIANTS {
                        return Err(DecodeError::UnknownType(tag));
                    }
                }
                Err(DecodeError::Malformed(err))
            }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Short name used in logs and state-machine diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Hello(_) => "ClientHello",
            ClientMessage::Accept(_) => "AcceptMessage",
            ClientMessage::Reject(_) => "RejectMessage",
            ClientMessage::Exit(_) => "ExitMessage",
            ClientMessage::Restart(_) => "RestartMessage",
            ClientMessage::Alert(_) => "AlertMessage",
            ClientMessage::TtyinBuf(_) => "IoBuffer(ttyin)",
            ClientMessage::TtyoutBuf(_) => "IoBuffer(ttyout)",
            ClientMessage::StdinBuf(_) => "IoBuffer(stdin)",
            ClientMessage::StdoutBuf(_) => "IoBuffer(stdout)",
            ClientMessage::StderrBuf(_) => "IoBuffer(stderr)",
            ClientMessage::WinsizeEvent(_) => "ChangeWindowSize",
            ClientMessage::SuspendEvent(_) => "CommandSuspend",
        }
    }
}

/// First server frame on every connection.
///
/// `redirect` and `servers` are reserved for future load-balancing support;
/// they are never populated and are ignored when received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerHello {
    pub server_id: String,
    pub redirect: Option<String>,
    pub servers: Vec<String>,
}

impl ServerHello {
    pub fn new(server_id: impl Into<String>) -> Self {
        ServerHello {
            server_id: server_id.into(),
            redirect: None,
            servers: Vec::new(),
        }
    }
}

/// Everything the server may send, one message per frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    Hello(ServerHello),
    /// Durable progress up to this elapsed-time offset.
    CommitPoint(TimeSpec),
    /// I/O log identifier the client can use in a RestartMessage.
    LogId(String),
    Error(String),
}

impl ServerMessage {
    pub fn decode(buf: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(buf)
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timespec_accumulates_with_carry() {
        let mut elapsed = TimeSpec::new(0, 900_000_000);
        elapsed.add(TimeSpec::new(0, 200_000_000));
        assert_eq!(elapsed, TimeSpec::new(1, 100_000_000));
        assert!(elapsed.is_set());
        assert!(!TimeSpec::default().is_set());
    }

    #[test]
    fn timespec_orders_by_seconds_then_nanos() {
        assert!(TimeSpec::new(1, 0) > TimeSpec::new(0, 999_999_999));
        assert!(TimeSpec::new(2, 5) > TimeSpec::new(2, 4));
    }

    #[test]
    fn client_message_roundtrips() {
        let msg = ClientMessage::Accept(AcceptMessage {
            submit_time: TimeSpec::new(100, 0),
            info_msgs: vec![
                InfoMessage::string("command", "/bin/ls"),
                InfoMessage::number("lines", 24),
            ],
            expect_iobufs: true,
        });
        let bytes = msg.encode().unwrap();
        assert_eq!(ClientMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn truncated_message_fails_to_decode() {
        let bytes = ClientMessage::Hello(ClientHello {
            client_id: "sudo 1.9".into(),
        })
        .encode()
        .unwrap();
        match ClientMessage::decode(&bytes[..bytes.len() - 1]) {
            Err(DecodeError::Malformed(_)) => {}
            other => panic!("expected Malformed, got {:?}", other),
        }
    }

    #[test]
    fn unknown_variant_tag_is_distinguished() {
        // The last variant must carry the highest tag the constant admits.
        let last = ClientMessage::SuspendEvent(CommandSuspend {
            delay: TimeSpec::default(),
            signal: "TSTP".into(),
        })
        .encode()
        .unwrap();
        assert_eq!(
            u32::from_le_bytes([last[0], last[1], last[2], last[3]]),
            CLIENT_MESSAGE_VARIANTS - 1
        );

        match ClientMessage::decode(&99u32.to_le_bytes()) {
            Err(DecodeError::UnknownType(99)) => {}
            other => panic!("expected UnknownType, got {:?}", other),
        }
    }
}
