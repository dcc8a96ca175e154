//! Event log sink: one record per accept, reject, or alert.
//!
//! Records can be appended to a JSON-lines file, emitted through the process
//! log stream, or suppressed entirely. The I/O capture files are separate;
//! see [`crate::iolog`].

use serde_json::{Map, Value};
use std::{
    fs::OpenOptions,
    io::{self, Write as _},
    path::PathBuf,
    time::SystemTime,
};
use tracing::info;

use crate::config::{EventLogConfig, EventLogType};
use crate::protocol::{InfoMessage, InfoValue, TimeSpec};

/// Session metadata parsed from the first Accept, Reject, or Alert message.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub submit_time: Option<TimeSpec>,
    pub peer: String,
    pub info: Vec<InfoMessage>,
}

impl EventRecord {
    pub fn new(submit_time: Option<TimeSpec>, info: &[InfoMessage], peer: &str) -> Self {
        EventRecord {
            submit_time,
            peer: peer.to_string(),
            info: info.to_vec(),
        }
    }

    /// Look up a string-valued info key like "command" or "submituser".
    pub fn string(&self, key: &str) -> Option<&str> {
        self.info
            .iter()
            .find(|info| info.key == key)
            .and_then(InfoMessage::as_str)
    }

    pub fn number(&self, key: &str) -> Option<i64> {
        self.info.iter().find(|info| info.key == key).and_then(
            |info| match info.value {
                InfoValue::Number(n) => Some(n),
                _ => None,
            },
        )
    }
}

pub struct EventLog {
    log_type: EventLogType,
    log_file: PathBuf,
}

impl EventLog {
    pub fn new(config: &EventLogConfig) -> Self {
        EventLog {
            log_type: config.log_type,
            log_file: config.log_file.clone(),
        }
    }

    pub fn accept(&self, record: &EventRecord, iolog_id: Option<&str>) -> io::Result<()> {
        let mut details = record_json(record);
        if let Some(id) = iolog_id {
            details.insert("iolog_id".into(), id.into());
        }
        self.emit("accept", details)
    }

    pub fn reject(&self, record: &EventRecord, reason: &str) -> io::Result<()> {
        let mut details = record_json(record);
        details.insert("reason".into(), reason.into());
        self.emit("reject", details)
    }

    pub fn alert(
        &self,
        record: Option<&EventRecord>,
        alert_time: TimeSpec,
        reason: &str,
        peer: &str,
    ) -> io::Result<()> {
        let mut details = match record {
            Some(record) => record_json(record),
            None => {
                let mut details = Map::new();
                details.insert("peer".into(), peer.into());
                details
            }
        };
        details.insert("alert_time".into(), timespec_json(alert_time));
        details.insert("reason".into(), reason.into());
        self.emit("alert", details)
    }

    fn emit(&self, event: &str, mut details: Map<String, Value>) -> io::Result<()> {
        details.insert("event".into(), event.into());
        details.insert(
            "timestamp".into(),
            humantime::format_rfc3339_seconds(SystemTime::now())
                .to_string()
                .into(),
        );
        let record = Value::Object(details);

        match self.log_type {
            EventLogType::Json => {
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.log_file)?;
                writeln!(file, "{}", record)
            }
            EventLogType::Tracing => {
                info!(target: "sudo_logsrvd::eventlog", %record);
                Ok(())
            }
            EventLogType::None => Ok(()),
        }
    }
}

fn timespec_json(time: TimeSpec) -> Value {
    let mut object = Map::new();
    object.insert("seconds".into(), time.tv_sec.into());
    object.insert("nanoseconds".into(), time.tv_nsec.into());
    Value::Object(object)
}

/// Flatten the client-supplied info pairs the same way the JSON event
/// format does: numbers, strings, and string lists keyed by name.
fn record_json(record: &EventRecord) -> Map<String, Value> {
    let mut details = Map::new();
    if let Some(submit_time) = record.submit_time {
        details.insert("submit_time".into(), timespec_json(submit_time));
    }
    details.insert("peer".into(), record.peer.clone().into());
    for info in &record.info {
        let value = match &info.value {
            InfoValue::Number(n) => Value::from(*n),
            InfoValue::String(s) => Value::from(s.clone()),
            InfoValue::StringList(list) => Value::from(list.clone()),
        };
        details.insert(info.key.clone(), value);
    }
    details
}
