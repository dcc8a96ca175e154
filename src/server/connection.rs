//! The per-connection protocol core: framed message intake, the state
//! machine, the commit-point scheduler, and the error policy.
//!
//! Each connection is one task. Frames are handled in arrival order and
//! replies go through one ordered sink, so the original single-threaded
//! ordering guarantees hold without any locking.

use {
    bytes::Bytes,
    futures::{SinkExt, StreamExt},
    std::sync::Arc,
    thiserror::Error,
    tokio::time::{self, Instant},
    tokio_util::codec::Framed,
    tracing::{debug, info, warn},
};

use crate::{
    codec::{CodecError, MessageCodec},
    defaults,
    iolog::IoFd,
    journal::Journal,
    protocol::{ClientMessage, DecodeError, ServerHello, ServerMessage, TimeSpec},
    relay::{self, RelayError, RelayHandle},
    server::{
        dispatch::{DispatchError, Dispatcher, JournalStore, LocalStore},
        shutdown::Shutdown,
        ServerContext,
    },
    transport::IoStream,
};

/// Protocol states. Transitions only ever move forward; a handler that
/// cannot make its transition reports an error and the connection ends in
/// `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Initial,
    Running,
    Exited,
    Finished,
    Error,
    Shutdown,
}

#[derive(Debug, Error)]
pub(crate) enum ConnectionError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("timed out sending to the client")]
    PeerTimeout,
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct Connection {
    framed: Framed<IoStream, MessageCodec>,
    peer: String,
    state: ConnectionState,
    dispatcher: Dispatcher,
    store_first: bool,
    /// Set by an Accept with `expect_iobufs` or a successful Restart.
    log_io: bool,
    /// Durable progress; the value sent in commit points.
    elapsed_time: TimeSpec,
    /// When armed, a commit point fires at this instant.
    commit_deadline: Option<Instant>,
    /// Cleared once no further client messages are expected.
    reading: bool,
    /// Keeps the supervisor's drain channel open until this task ends.
    ctx: Arc<ServerContext>,
    shutdown: Shutdown,
}

enum Event {
    Frame(Bytes),
    ReadFailed(CodecError),
    Eof,
    Commit,
    Upstream(Option<ServerMessage>),
    Shutdown,
}

/// Serve one client connection to completion.
pub(crate) async fn handle(
    stream: IoStream,
    peer: String,
    ctx: Arc<ServerContext>,
) -> Result<(), ConnectionError> {
    let config = &ctx.config;

    // Select the message handling strategy for this connection's lifetime.
    let dispatcher = if config.relay.enabled() && !config.relay.store_first {
        Dispatcher::Relay(relay::connect(config, &peer).await?)
    } else if config.relay.enabled() {
        Dispatcher::Journal(JournalStore::new(Journal::create(&config.relay.journal_dir)?))
    } else {
        Dispatcher::Local(LocalStore::new(config, ctx.random_drop, &peer))
    };

    let mut connection = Connection {
        framed: Framed::new(stream, MessageCodec::new(config.server.max_message_size)),
        peer,
        state: ConnectionState::Initial,
        dispatcher,
        store_first: config.relay.store_first,
        log_io: false,
        elapsed_time: TimeSpec::default(),
        commit_deadline: None,
        reading: true,
        shutdown: Shutdown::new(ctx.notify_shutdown.subscribe()),
        ctx: ctx.clone(),
    };

    connection
        .send(ServerMessage::Hello(ServerHello::new(defaults::SERVER_ID)))
        .await?;
    let result = connection.run().await;

    let Connection {
        mut framed,
        dispatcher,
        state,
        store_first,
        peer,
        ..
    } = connection;
    debug!(peer = %peer, "closing connection");
    let _ = SinkExt::<Bytes>::close(&mut framed).await;

    // A finished store-first session hands its journal to a replay task.
    if store_first && state == ConnectionState::Finished {
        if let Some(journal) = dispatcher.into_journal() {
            relay::spawn_replay(journal, ctx.config.clone());
        }
    }
    result
}

impl Connection {
    async fn run(&mut self) -> Result<(), ConnectionError> {
        loop {
            let event = {
                let state = self.state;
                let reading = self.reading;
                let deadline = self.commit_deadline;
                let framed = &mut self.framed;
                let relay = self.dispatcher.relay_mut();
                let shutdown = &mut self.shutdown;
                tokio::select! {
                    _ = shutdown.recv(), if state != ConnectionState::Shutdown => Event::Shutdown,
                    _ = wait_until(deadline), if deadline.is_some() => Event::Commit,
                    msg = recv_upstream(relay) => Event::Upstream(msg),
                    frame = framed.next(), if reading => match frame {
                        Some(Ok(payload)) => Event::Frame(payload),
                        Some(Err(err)) => Event::ReadFailed(err),
                        None => Event::Eof,
                    },
                }
            };

            let done = match event {
                Event::Frame(payload) => self.handle_frame(payload).await?,
                Event::ReadFailed(CodecError::FrameTooLarge { len, max }) => {
                    debug!(peer = %self.peer, "client frame of {} bytes exceeds {}", len, max);
                    self.protocol_error("client message too large").await?
                }
                Event::ReadFailed(err) => return Err(err.into()),
                Event::Eof => {
                    if self.state != ConnectionState::Finished {
                        warn!(peer = %self.peer, "unexpected EOF");
                    }
                    true
                }
                Event::Commit => self.fire_commit().await?,
                Event::Upstream(Some(msg)) => self.handle_upstream(msg).await?,
                Event::Upstream(None) => {
                    warn!(peer = %self.peer, "relay connection closed");
                    true
                }
                Event::Shutdown => self.begin_shutdown(),
            };

            if done {
                return Ok(());
            }
        }
    }

    async fn handle_frame(&mut self, payload: Bytes) -> Result<bool, ConnectionError> {
        let msg = match ClientMessage::decode(&payload) {
            Ok(msg) => msg,
            Err(DecodeError::UnknownType(tag)) => {
                debug!(peer = %self.peer, "unknown ClientMessage variant {}", tag);
                return self.protocol_error("unrecognized ClientMessage type").await;
            }
            Err(err) => {
                debug!(peer = %self.peer, "unable to parse ClientMessage: {}", err);
                return self.protocol_error("invalid ClientMessage").await;
            }
        };
        debug!(peer = %self.peer, "received {}", msg.kind());

        if let Err(errstr) =
            precondition(self.state, &msg, self.log_io).and_then(|()| validate(&msg))
        {
            return self.protocol_error(errstr).await;
        }

        use ClientMessage::*;
        let outcome = match &msg {
            Hello(hello) => {
                info!(peer = %self.peer, client_id = %hello.client_id, "client hello");
                Ok(None)
            }
            Accept(accept) => self.dispatcher.accept(accept, &payload),
            Reject(reject) => self.dispatcher.reject(reject, &payload),
            Exit(exit) => self.dispatcher.exit(exit, &payload),
            Restart(restart) => self.dispatcher.restart(restart, &payload),
            Alert(alert) => self.dispatcher.alert(alert, &payload),
            TtyinBuf(buf) => self.dispatcher.iobuf(IoFd::Ttyin, buf, &payload),
            TtyoutBuf(buf) => self.dispatcher.iobuf(IoFd::Ttyout, buf, &payload),
            StdinBuf(buf) => self.dispatcher.iobuf(IoFd::Stdin, buf, &payload),
            StdoutBuf(buf) => self.dispatcher.iobuf(IoFd::Stdout, buf, &payload),
            StderrBuf(buf) => self.dispatcher.iobuf(IoFd::Stderr, buf, &payload),
            WinsizeEvent(winsize) => self.dispatcher.winsize(winsize, &payload),
            SuspendEvent(suspend) => self.dispatcher.suspend(suspend, &payload),
        };

        let reply = match outcome {
            Ok(reply) => reply,
            Err(DispatchError::RandomDrop) => {
                warn!(peer = %self.peer, "randomly dropping connection");
                return Ok(true);
            }
            Err(err) => return self.protocol_error(err.to_string()).await,
        };

        // Successful dispatch; advance the state machine.
        match &msg {
            Accept(accept) => {
                self.log_io = accept.expect_iobufs;
                self.state = ConnectionState::Running;
            }
            Reject(_) => self.state = ConnectionState::Finished,
            Restart(restart) => {
                self.log_io = true;
                self.elapsed_time = restart.resume_point;
                self.state = ConnectionState::Running;
            }
            Exit(exit) => {
                if let Some(run_time) = exit.run_time {
                    self.elapsed_time = run_time;
                }
                // No further client messages are expected after an exit.
                self.reading = false;
                if self.log_io {
                    self.state = ConnectionState::Exited;
                    if !self.dispatcher.is_relay() {
                        // Client is waiting for the final commit point.
                        self.commit_deadline = Some(Instant::now());
                    }
                } else {
                    self.state = ConnectionState::Finished;
                }
            }
            TtyinBuf(buf) | TtyoutBuf(buf) | StdinBuf(buf) | StdoutBuf(buf) | StderrBuf(buf) => {
                self.elapsed_time.add(buf.delay);
                self.enable_commit();
            }
            WinsizeEvent(winsize) => {
                self.elapsed_time.add(winsize.delay);
                self.enable_commit();
            }
            SuspendEvent(suspend) => {
                self.elapsed_time.add(suspend.delay);
                self.enable_commit();
            }
            Hello(_) | Alert(_) => {}
        }

        if let Some(reply) = reply {
            self.send(reply).await?;
        }
        Ok(self.state == ConnectionState::Finished)
    }

    /// Arm the commit timer if durable progress needs acknowledging and no
    /// acknowledgement is already pending. Relayed connections get their
    /// commit points from the upstream instead.
    fn enable_commit(&mut self) {
        if !self.dispatcher.is_relay() && self.commit_deadline.is_none() {
            self.commit_deadline = Some(Instant::now() + self.ctx.config.server.ack_frequency);
        }
    }

    /// Report durable progress to the client.
    async fn fire_commit(&mut self) -> Result<bool, ConnectionError> {
        self.commit_deadline = None;
        debug!(peer = %self.peer, "sending commit point {}", self.elapsed_time);
        self.send(ServerMessage::CommitPoint(self.elapsed_time))
            .await?;
        match self.state {
            ConnectionState::Exited => {
                self.state = ConnectionState::Finished;
                Ok(true)
            }
            ConnectionState::Shutdown => Ok(true),
            _ => Ok(false),
        }
    }

    /// A message from the upstream relay, forwarded to the client verbatim.
    async fn handle_upstream(&mut self, msg: ServerMessage) -> Result<bool, ConnectionError> {
        match msg {
            ServerMessage::Error(err) => {
                warn!(peer = %self.peer, "relay error: {}", err);
                self.send(ServerMessage::Error(err)).await?;
                self.state = ConnectionState::Error;
                Ok(true)
            }
            ServerMessage::CommitPoint(commit) => {
                self.send(ServerMessage::CommitPoint(commit)).await?;
                if self.state == ConnectionState::Exited {
                    self.state = ConnectionState::Finished;
                    return Ok(true);
                }
                Ok(false)
            }
            msg => {
                self.send(msg).await?;
                Ok(false)
            }
        }
    }

    /// Report a protocol failure to the client and end the connection.
    async fn protocol_error(
        &mut self,
        errstr: impl Into<String>,
    ) -> Result<bool, ConnectionError> {
        let errstr = errstr.into();
        warn!(peer = %self.peer, "{}", errstr);
        self.reading = false;
        if self.state == ConnectionState::Error {
            return Ok(true);
        }
        self.state = ConnectionState::Error;
        self.send(ServerMessage::Error(errstr)).await?;
        Ok(true)
    }

    fn begin_shutdown(&mut self) -> bool {
        debug!(peer = %self.peer, "shutting down connection");
        self.state = ConnectionState::Shutdown;
        self.reading = false;
        if self.dispatcher.is_relay() {
            // The relay task drains queued frames once the handle drops.
            true
        } else if self.log_io {
            // Send one final commit point before closing.
            self.commit_deadline = Some(Instant::now());
            false
        } else {
            true
        }
    }

    async fn send(&mut self, msg: ServerMessage) -> Result<(), ConnectionError> {
        let timeout = self.ctx.config.server.timeout;
        match time::timeout(timeout, self.framed.send(&msg)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ConnectionError::PeerTimeout),
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn recv_upstream(relay: Option<&mut RelayHandle>) -> Option<ServerMessage> {
    match relay {
        Some(relay) => relay.recv().await,
        None => std::future::pending().await,
    }
}

/// Check a message against the current state; the error text is what the
/// client sees in the ServerMessage error frame.
fn precondition(
    state: ConnectionState,
    msg: &ClientMessage,
    log_io: bool,
) -> Result<(), &'static str> {
    use ClientMessage::*;
    match msg {
        Hello(_) | Accept(_) | Reject(_) | Restart(_) => match state {
            ConnectionState::Initial => Ok(()),
            _ => Err("state machine error"),
        },
        Exit(_) => match state {
            ConnectionState::Running => Ok(()),
            _ => Err("state machine error"),
        },
        TtyinBuf(_) | TtyoutBuf(_) | StdinBuf(_) | StdoutBuf(_) | StderrBuf(_)
        | WinsizeEvent(_) | SuspendEvent(_) => {
            if state != ConnectionState::Running {
                Err("state machine error")
            } else if !log_io {
                Err("protocol error")
            } else {
                Ok(())
            }
        }
        // Alerts are permitted in any state.
        Alert(_) => Ok(()),
    }
}

/// Required-field checks, independent of state.
fn validate(msg: &ClientMessage) -> Result<(), &'static str> {
    match msg {
        ClientMessage::Accept(accept) if accept.info_msgs.is_empty() => {
            Err("invalid AcceptMessage")
        }
        ClientMessage::Reject(reject) if reject.info_msgs.is_empty() => {
            Err("invalid RejectMessage")
        }
        ClientMessage::Alert(alert) if alert.reason.is_empty() => Err("invalid AlertMessage"),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::*;

    fn accept(expect_iobufs: bool) -> ClientMessage {
        ClientMessage::Accept(AcceptMessage {
            submit_time: TimeSpec::new(1, 0),
            info_msgs: vec![InfoMessage::string("command", "/bin/true")],
            expect_iobufs,
        })
    }

    fn iobuf() -> ClientMessage {
        ClientMessage::TtyoutBuf(IoBuffer {
            delay: TimeSpec::default(),
            data: vec![],
        })
    }

    fn exit() -> ClientMessage {
        ClientMessage::Exit(ExitMessage {
            exit_value: 0,
            error: String::new(),
            signal: String::new(),
            dumped_core: false,
            run_time: None,
        })
    }

    #[test]
    fn initial_state_admits_session_openers_only() {
        use ConnectionState::*;
        for msg in &[
            accept(true),
            ClientMessage::Hello(ClientHello {
                client_id: "c".into(),
            }),
            ClientMessage::Reject(RejectMessage {
                submit_time: TimeSpec::new(1, 0),
                reason: "denied".into(),
                info_msgs: vec![InfoMessage::string("command", "/bin/true")],
            }),
            ClientMessage::Restart(RestartMessage {
                log_id: "ABCDEF".into(),
                resume_point: TimeSpec::default(),
            }),
        ] {
            assert!(precondition(Initial, msg, false).is_ok());
            for state in &[Running, Exited, Finished, Error, Shutdown] {
                assert_eq!(
                    precondition(*state, msg, false),
                    Err("state machine error")
                );
            }
        }
    }

    #[test]
    fn exit_requires_running() {
        use ConnectionState::*;
        assert!(precondition(Running, &exit(), false).is_ok());
        for state in &[Initial, Exited, Finished, Error, Shutdown] {
            assert_eq!(precondition(*state, &exit(), false), Err("state machine error"));
        }
    }

    #[test]
    fn io_messages_require_running_and_log_io() {
        use ConnectionState::*;
        let winsize = ClientMessage::WinsizeEvent(ChangeWindowSize {
            delay: TimeSpec::default(),
            rows: 24,
            cols: 80,
        });
        for msg in &[iobuf(), winsize] {
            assert!(precondition(Running, msg, true).is_ok());
            // An I/O buffer without an I/O log is a protocol error, not a
            // state machine error.
            assert_eq!(precondition(Running, msg, false), Err("protocol error"));
            assert_eq!(precondition(Initial, msg, true), Err("state machine error"));
        }
    }

    #[test]
    fn alerts_are_permitted_in_any_state() {
        use ConnectionState::*;
        let alert = ClientMessage::Alert(AlertMessage {
            alert_time: TimeSpec::new(5, 0),
            reason: "oh no".into(),
            info_msgs: vec![],
        });
        for state in &[Initial, Running, Exited, Finished, Error, Shutdown] {
            assert!(precondition(*state, &alert, false).is_ok());
        }
    }

    #[test]
    fn required_fields_are_validated() {
        assert!(validate(&accept(true)).is_ok());
        assert_eq!(
            validate(&ClientMessage::Accept(AcceptMessage {
                submit_time: TimeSpec::new(1, 0),
                info_msgs: vec![],
                expect_iobufs: false,
            })),
            Err("invalid AcceptMessage")
        );
        assert_eq!(
            validate(&ClientMessage::Alert(AlertMessage {
                alert_time: TimeSpec::new(1, 0),
                reason: String::new(),
                info_msgs: vec![],
            })),
            Err("invalid AlertMessage")
        );
    }
}
