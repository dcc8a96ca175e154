//! Replayable I/O logs: a per-session directory holding a `timing` file and
//! one capture file per logged descriptor, plus a JSON info file describing
//! the session.
//!
//! Timing records are plain text, one event per line:
//! `<event> <seconds>.<nanoseconds> <detail>` where the detail is a byte
//! count for captures, `rows cols` for window changes, and a signal name for
//! suspends. Clearing the write bits on `timing` marks a completed session.

use rand::Rng;
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write as _},
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
};
use tracing::debug;

use crate::config::IoLogConfig;
use crate::eventlog::EventRecord;
use crate::protocol::TimeSpec;

/// Which captured stream an I/O buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoFd {
    Stdin,
    Stdout,
    Stderr,
    Ttyin,
    Ttyout,
}

impl IoFd {
    pub fn filename(self) -> &'static str {
        match self {
            IoFd::Stdin => "stdin",
            IoFd::Stdout => "stdout",
            IoFd::Stderr => "stderr",
            IoFd::Ttyin => "ttyin",
            IoFd::Ttyout => "ttyout",
        }
    }

    fn timing_event(self) -> u8 {
        match self {
            IoFd::Stdin => 0,
            IoFd::Stdout => 1,
            IoFd::Stderr => 2,
            IoFd::Ttyin => 3,
            IoFd::Ttyout => 4,
        }
    }
}

const TIMING_EVENT_WINSIZE: u8 = 5;
const TIMING_EVENT_SUSPEND: u8 = 7;

const ID_LEN: usize = 6;
const ID_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// An open I/O log session.
pub struct IoLog {
    dir: PathBuf,
    id: String,
    mode: u32,
    timing: File,
    captures: [File; 5],
}

impl IoLog {
    /// Create a fresh session directory under the configured I/O log root.
    pub fn create(config: &IoLogConfig, record: &EventRecord) -> io::Result<IoLog> {
        fs::create_dir_all(&config.iolog_dir)?;

        // Retry on the (unlikely) chance of an id collision.
        let (id, dir) = loop {
            let id = random_id();
            let dir = config.iolog_dir.join(&id);
            match fs::create_dir(&dir) {
                Ok(()) => break (id, dir),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err),
            }
        };

        write_info_file(&dir, config.iolog_mode, record)?;
        let (timing, captures) = open_files(&dir, config.iolog_mode)?;

        debug!(id = %id, "created I/O log {}", dir.display());
        Ok(IoLog {
            dir,
            id,
            mode: config.iolog_mode,
            timing,
            captures,
        })
    }

    /// Re-open an existing session for a restarting client. The log id is
    /// validated before touching the filesystem; a completed session has a
    /// read-only timing file and cannot be reopened.
    pub fn restart(config: &IoLogConfig, log_id: &str) -> io::Result<IoLog> {
        let id = parse_log_id(config, log_id).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "malformed I/O log id")
        })?;
        let dir = config.iolog_dir.join(&id);
        if !dir.is_dir() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such I/O log"));
        }

        // A cleared write bit on timing marks a completed session.
        let timing_mode = fs::metadata(dir.join("timing"))?.permissions().mode();
        if timing_mode & 0o200 == 0 {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "I/O log session already completed",
            ));
        }

        let (timing, captures) = open_files(&dir, config.iolog_mode)?;
        debug!(id = %id, "restarted I/O log {}", dir.display());
        Ok(IoLog {
            dir,
            id,
            mode: config.iolog_mode,
            timing,
            captures,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The identifier sent to the client in a LogId message and accepted
    /// back in a RestartMessage.
    pub fn log_id(&self) -> String {
        self.dir.display().to_string()
    }

    pub fn write_iobuf(&mut self, fd: IoFd, delay: TimeSpec, data: &[u8]) -> io::Result<()> {
        let capture = &mut self.captures[fd as usize];
        capture.write_all(data)?;
        writeln!(
            self.timing,
            "{} {}.{:09} {}",
            fd.timing_event(),
            delay.tv_sec,
            delay.tv_nsec,
            data.len()
        )
    }

    pub fn write_winsize(&mut self, delay: TimeSpec, rows: u32, cols: u32) -> io::Result<()> {
        writeln!(
            self.timing,
            "{} {}.{:09} {} {}",
            TIMING_EVENT_WINSIZE, delay.tv_sec, delay.tv_nsec, rows, cols
        )
    }

    pub fn write_suspend(&mut self, delay: TimeSpec, signal: &str) -> io::Result<()> {
        writeln!(
            self.timing,
            "{} {}.{:09} {}",
            TIMING_EVENT_SUSPEND, delay.tv_sec, delay.tv_nsec, signal
        )
    }

    /// Clear the write bits on the timing file to mark the session complete.
    pub fn finish(&mut self) -> io::Result<()> {
        self.timing.flush()?;
        let timing_path = self.dir.join("timing");
        let mode = self.mode & !0o222;
        fs::set_permissions(&timing_path, fs::Permissions::from_mode(mode))
    }
}

fn random_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ID_LEN)
        .map(|_| ID_CHARS[rng.gen_range(0..ID_CHARS.len())] as char)
        .collect()
}

/// Extract and validate the session id from a client-supplied log id, which
/// may be either the bare id or the full session path. Only plain
/// alphanumeric ids are accepted, so a hostile id cannot escape the log root.
pub fn parse_log_id(config: &IoLogConfig, log_id: &str) -> Option<String> {
    let id = Path::new(log_id)
        .strip_prefix(&config.iolog_dir)
        .ok()
        .and_then(Path::to_str)
        .unwrap_or(log_id);
    if !id.is_empty() && id.bytes().all(|b| b.is_ascii_alphanumeric()) {
        Some(id.to_string())
    } else {
        None
    }
}

fn open_files(dir: &Path, mode: u32) -> io::Result<(File, [File; 5])> {
    let open = |name: &str| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .mode(mode)
            .open(dir.join(name))
    };

    let timing = open("timing")?;
    let captures = [
        open(IoFd::Stdin.filename())?,
        open(IoFd::Stdout.filename())?,
        open(IoFd::Stderr.filename())?,
        open(IoFd::Ttyin.filename())?,
        open(IoFd::Ttyout.filename())?,
    ];
    Ok((timing, captures))
}

fn write_info_file(dir: &Path, mode: u32, record: &EventRecord) -> io::Result<()> {
    let mut info = serde_json::Map::new();
    if let Some(submit_time) = record.submit_time {
        info.insert("submit_time".into(), submit_time.tv_sec.into());
    }
    for &key in &["submituser", "runuser", "submithost", "command", "runcwd"] {
        if let Some(value) = record.string(key) {
            info.insert(key.into(), value.into());
        }
    }
    for &key in &["lines", "columns"] {
        if let Some(value) = record.number(key) {
            info.insert(key.into(), value.into());
        }
    }
    info.insert("peer".into(), record.peer.clone().into());

    let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .mode(mode)
        .open(dir.join("log.json"))?;
    writeln!(file, "{}", serde_json::Value::Object(info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::InfoMessage;

    fn config(dir: &Path) -> IoLogConfig {
        IoLogConfig {
            iolog_dir: dir.to_path_buf(),
            iolog_mode: 0o600,
        }
    }

    fn record() -> EventRecord {
        EventRecord::new(
            Some(TimeSpec::new(100, 0)),
            &[
                InfoMessage::string("command", "/bin/ls"),
                InfoMessage::string("submituser", "alice"),
                InfoMessage::number("lines", 24),
                InfoMessage::number("columns", 80),
            ],
            "192.0.2.1",
        )
    }

    #[test]
    fn create_writes_captures_and_timing() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path());
        let mut iolog = IoLog::create(&config, &record()).unwrap();

        iolog
            .write_iobuf(IoFd::Ttyout, TimeSpec::new(0, 10_000_000), b"hi\n")
            .unwrap();
        iolog.write_winsize(TimeSpec::new(0, 0), 24, 80).unwrap();
        iolog.write_suspend(TimeSpec::new(1, 0), "TSTP").unwrap();

        let dir = root.path().join(iolog.id());
        assert_eq!(fs::read(dir.join("ttyout")).unwrap(), b"hi\n");
        let timing = fs::read_to_string(dir.join("timing")).unwrap();
        let lines: Vec<&str> = timing.lines().collect();
        assert_eq!(lines[0], "4 0.010000000 3");
        assert_eq!(lines[1], "5 0.000000000 24 80");
        assert_eq!(lines[2], "7 1.000000000 TSTP");

        let info: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.join("log.json")).unwrap()).unwrap();
        assert_eq!(info["command"], "/bin/ls");
        assert_eq!(info["columns"], 80);
    }

    #[test]
    fn finish_clears_write_bits() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path());
        let mut iolog = IoLog::create(&config, &record()).unwrap();
        iolog.finish().unwrap();

        let metadata = fs::metadata(root.path().join(iolog.id()).join("timing")).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o222, 0);
    }

    #[test]
    fn restart_appends_to_existing_session() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path());
        let mut iolog = IoLog::create(&config, &record()).unwrap();
        iolog
            .write_iobuf(IoFd::Stdout, TimeSpec::new(0, 0), b"one")
            .unwrap();
        let log_id = iolog.log_id();
        drop(iolog);

        let mut restarted = IoLog::restart(&config, &log_id).unwrap();
        restarted
            .write_iobuf(IoFd::Stdout, TimeSpec::new(0, 0), b"two")
            .unwrap();

        let dir = root.path().join(restarted.id());
        assert_eq!(fs::read(dir.join("stdout")).unwrap(), b"onetwo");
    }

    #[test]
    fn restart_rejects_traversal_and_unknown_ids() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path());

        assert!(parse_log_id(&config, "../etc/passwd").is_none());
        assert!(parse_log_id(&config, "").is_none());
        assert!(IoLog::restart(&config, "ZZZZZZ").is_err());
    }

    #[test]
    fn completed_session_cannot_be_restarted() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path());
        let mut iolog = IoLog::create(&config, &record()).unwrap();
        iolog.finish().unwrap();
        let log_id = iolog.log_id();
        drop(iolog);

        assert!(IoLog::restart(&config, &log_id).is_err());
    }
}
