//! Per-connection message handling strategies.
//!
//! A connection picks its strategy at construction time: store locally,
//! forward each raw frame to an upstream relay, or append raw frames to an
//! on-disk journal for later replay. The state machine in
//! [`super::connection`] is shared; only the storage side differs.

use bytes::Bytes;
use std::io;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    config::{Config, IoLogConfig},
    eventlog::{EventLog, EventRecord},
    iolog::{IoFd, IoLog},
    journal::Journal,
    protocol::{
        AcceptMessage, AlertMessage, ChangeWindowSize, CommandSuspend, ExitMessage, IoBuffer,
        RejectMessage, RestartMessage, ServerMessage,
    },
    relay::RelayHandle,
};

/// Handler failures. The display strings double as the error text sent to
/// the client in a ServerMessage before the connection is closed.
#[derive(Debug, Error)]
pub(crate) enum DispatchError {
    #[error("error creating I/O log")]
    CreateIoLog(#[source] io::Error),
    #[error("error logging accept event")]
    LogAccept(#[source] io::Error),
    #[error("error logging reject event")]
    LogReject(#[source] io::Error),
    #[error("error logging alert event")]
    LogAlert(#[source] io::Error),
    #[error("error writing IoBuffer")]
    WriteIoBuffer(#[source] io::Error),
    #[error("error writing ChangeWindowSize")]
    WriteWinsize(#[source] io::Error),
    #[error("error writing CommandSuspend")]
    WriteSuspend(#[source] io::Error),
    #[error("unable to restart I/O log")]
    Restart(#[source] io::Error),
    #[error("unable to write journal file")]
    Journal(#[source] io::Error),
    #[error("unable to relay message")]
    Relay,
    /// Debugging aid, never reported to the client: the connection is
    /// dropped abruptly to exercise client restart handling.
    #[error("randomly dropping connection")]
    RandomDrop,
}

type Reply = Option<ServerMessage>;
type DispatchResult = Result<Reply, DispatchError>;

/// The three interchangeable handler sets of the message dispatcher.
pub(crate) enum Dispatcher {
    Local(LocalStore),
    Relay(RelayHandle),
    Journal(JournalStore),
}

impl Dispatcher {
    pub(crate) fn is_relay(&self) -> bool {
        matches!(self, Dispatcher::Relay(_))
    }

    pub(crate) fn relay_mut(&mut self) -> Option<&mut RelayHandle> {
        match self {
            Dispatcher::Relay(handle) => Some(handle),
            _ => None,
        }
    }

    /// Release the journal for the store-and-forward replay handoff.
    pub(crate) fn into_journal(self) -> Option<Journal> {
        match self {
            Dispatcher::Journal(store) => Some(store.journal),
            _ => None,
        }
    }

    pub(crate) fn accept(&mut self, msg: &AcceptMessage, raw: &Bytes) -> DispatchResult {
        match self {
            Dispatcher::Local(store) => store.accept(msg),
            Dispatcher::Relay(handle) => forward(handle, raw),
            Dispatcher::Journal(store) => store.append(raw),
        }
    }

    pub(crate) fn reject(&mut self, msg: &RejectMessage, raw: &Bytes) -> DispatchResult {
        match self {
            Dispatcher::Local(store) => store.reject(msg),
            Dispatcher::Relay(handle) => forward(handle, raw),
            Dispatcher::Journal(store) => store.append(raw),
        }
    }

    pub(crate) fn exit(&mut self, msg: &ExitMessage, raw: &Bytes) -> DispatchResult {
        match self {
            Dispatcher::Local(store) => store.exit(msg),
            Dispatcher::Relay(handle) => forward(handle, raw),
            Dispatcher::Journal(store) => store.exit(raw),
        }
    }

    pub(crate) fn restart(&mut self, msg: &RestartMessage, raw: &Bytes) -> DispatchResult {
        match self {
            Dispatcher::Local(store) => store.restart(msg),
            Dispatcher::Relay(handle) => forward(handle, raw),
            Dispatcher::Journal(store) => store.append(raw),
        }
    }

    pub(crate) fn alert(&mut self, msg: &AlertMessage, raw: &Bytes) -> DispatchResult {
        match self {
            Dispatcher::Local(store) => store.alert(msg),
            Dispatcher::Relay(handle) => forward(handle, raw),
            Dispatcher::Journal(store) => store.append(raw),
        }
    }

    pub(crate) fn iobuf(&mut self, fd: IoFd, msg: &IoBuffer, raw: &Bytes) -> DispatchResult {
        match self {
            Dispatcher::Local(store) => store.iobuf(fd, msg),
            Dispatcher::Relay(handle) => forward(handle, raw),
            Dispatcher::Journal(store) => store.append(raw),
        }
    }

    pub(crate) fn winsize(&mut self, msg: &ChangeWindowSize, raw: &Bytes) -> DispatchResult {
        match self {
            Dispatcher::Local(store) => store.winsize(msg),
            Dispatcher::Relay(handle) => forward(handle, raw),
            Dispatcher::Journal(store) => store.append(raw),
        }
    }

    pub(crate) fn suspend(&mut self, msg: &CommandSuspend, raw: &Bytes) -> DispatchResult {
        match self {
            Dispatcher::Local(store) => store.suspend(msg),
            Dispatcher::Relay(handle) => forward(handle, raw),
            Dispatcher::Journal(store) => store.append(raw),
        }
    }
}

fn forward(handle: &RelayHandle, raw: &Bytes) -> DispatchResult {
    handle
        .forward(raw.clone())
        .map(|()| None)
        .map_err(|_| DispatchError::Relay)
}

/// Local storage: event log records plus replayable I/O logs.
pub(crate) struct LocalStore {
    event_log: EventLog,
    iolog_config: IoLogConfig,
    iolog: Option<IoLog>,
    record: Option<EventRecord>,
    random_drop: f64,
    peer: String,
}

impl LocalStore {
    pub(crate) fn new(config: &Config, random_drop: f64, peer: &str) -> LocalStore {
        LocalStore {
            event_log: EventLog::new(&config.eventlog),
            iolog_config: config.iolog.clone(),
            iolog: None,
            record: None,
            random_drop,
            peer: peer.to_string(),
        }
    }

    fn accept(&mut self, msg: &AcceptMessage) -> DispatchResult {
        let record = EventRecord::new(Some(msg.submit_time), &msg.info_msgs, &self.peer);

        let mut reply = None;
        if msg.expect_iobufs {
            let iolog =
                IoLog::create(&self.iolog_config, &record).map_err(DispatchError::CreateIoLog)?;
            // Send the log id so the client can restart after a failure.
            reply = Some(ServerMessage::LogId(iolog.log_id()));
            self.iolog = Some(iolog);
        }

        self.event_log
            .accept(&record, self.iolog.as_ref().map(IoLog::id))
            .map_err(DispatchError::LogAccept)?;
        self.record = Some(record);
        Ok(reply)
    }

    fn reject(&mut self, msg: &RejectMessage) -> DispatchResult {
        let record = EventRecord::new(Some(msg.submit_time), &msg.info_msgs, &self.peer);
        self.event_log
            .reject(&record, &msg.reason)
            .map_err(DispatchError::LogReject)?;
        self.record = Some(record);
        Ok(None)
    }

    fn exit(&mut self, msg: &ExitMessage) -> DispatchResult {
        if !msg.signal.is_empty() {
            debug!(
                peer = %self.peer,
                "command was killed by SIG{}{}",
                msg.signal,
                if msg.dumped_core { " (core dumped)" } else { "" }
            );
        } else {
            debug!(peer = %self.peer, "command exited with {}", msg.exit_value);
        }

        if let Some(iolog) = &mut self.iolog {
            // Failing to mark completion is not worth failing the session.
            if let Err(err) = iolog.finish() {
                warn!(peer = %self.peer, "unable to mark timing file complete: {}", err);
            }
        }
        Ok(None)
    }

    fn restart(&mut self, msg: &RestartMessage) -> DispatchResult {
        let iolog =
            IoLog::restart(&self.iolog_config, &msg.log_id).map_err(DispatchError::Restart)?;
        self.iolog = Some(iolog);
        Ok(None)
    }

    fn alert(&mut self, msg: &AlertMessage) -> DispatchResult {
        if !msg.info_msgs.is_empty() {
            self.record = Some(EventRecord::new(None, &msg.info_msgs, &self.peer));
        }
        self.event_log
            .alert(self.record.as_ref(), msg.alert_time, &msg.reason, &self.peer)
            .map_err(DispatchError::LogAlert)?;
        Ok(None)
    }

    fn iobuf(&mut self, fd: IoFd, msg: &IoBuffer) -> DispatchResult {
        let iolog = self.iolog.as_mut().ok_or_else(|| {
            DispatchError::WriteIoBuffer(io::Error::new(
                io::ErrorKind::NotConnected,
                "no open I/O log",
            ))
        })?;
        iolog
            .write_iobuf(fd, msg.delay, &msg.data)
            .map_err(DispatchError::WriteIoBuffer)?;

        // Random drop is a debugging tool to test client restart.
        if self.random_drop > 0.0 && rand::random::<f64>() < self.random_drop {
            return Err(DispatchError::RandomDrop);
        }
        Ok(None)
    }

    fn winsize(&mut self, msg: &ChangeWindowSize) -> DispatchResult {
        let iolog = self.iolog.as_mut().ok_or_else(|| {
            DispatchError::WriteWinsize(io::Error::new(
                io::ErrorKind::NotConnected,
                "no open I/O log",
            ))
        })?;
        iolog
            .write_winsize(msg.delay, msg.rows, msg.cols)
            .map_err(DispatchError::WriteWinsize)
            .map(|()| None)
    }

    fn suspend(&mut self, msg: &CommandSuspend) -> DispatchResult {
        let iolog = self.iolog.as_mut().ok_or_else(|| {
            DispatchError::WriteSuspend(io::Error::new(
                io::ErrorKind::NotConnected,
                "no open I/O log",
            ))
        })?;
        iolog
            .write_suspend(msg.delay, &msg.signal)
            .map_err(DispatchError::WriteSuspend)
            .map(|()| None)
    }
}

/// Journal storage: raw frames appended in arrival order, synced on exit.
pub(crate) struct JournalStore {
    journal: Journal,
}

impl JournalStore {
    pub(crate) fn new(journal: Journal) -> JournalStore {
        JournalStore { journal }
    }

    fn append(&mut self, raw: &Bytes) -> DispatchResult {
        self.journal
            .append_frame(raw)
            .map_err(DispatchError::Journal)?;
        Ok(None)
    }

    fn exit(&mut self, raw: &Bytes) -> DispatchResult {
        self.append(raw)?;
        self.journal.sync().map_err(DispatchError::Journal)?;
        Ok(None)
    }
}
