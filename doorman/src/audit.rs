//! Audit trail of firewall decisions, one JSON object per line.
//!
//! Separate from the `tracing` diagnostics: this records only what was opened,
//! closed or failed, so it can be shipped to a SIEM or grepped after the fact.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use serde::Serialize;
use syslog::{Facility, Formatter3164};
use tracing::error;

use crate::config::LoggingConfig;

pub const SYSLOG_TAG: &str = "knock-doorman";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    RuleAdded {
        client: String,
        source: String,
        port: String,
        expire: i64,
    },
    FailopenAdded {
        port: String,
        expire: i64,
    },
    RuleDeleted {
        source: String,
        port: String,
        expired: i64,
    },
    CommandFailed {
        command: String,
        stderr: String,
    },
}

#[derive(Serialize)]
struct AuditLine<'a> {
    ts: i64,
    #[serde(flatten)]
    event: &'a AuditEvent,
}

enum Sink {
    Stderr,
    File(File),
    Syslog(syslog::Logger<syslog::LoggerBackend, Formatter3164>),
    Null,
}

pub struct AuditLog {
    sink: Sink,
}

impl AuditLog {
    /// Picks the sink from `[logging]`: syslog wins over a file, stderr otherwise.
    pub fn from_config(cfg: &LoggingConfig) -> std::io::Result<Self> {
        if cfg.syslog {
            let formatter = Formatter3164 {
                facility: Facility::LOG_AUTH,
                hostname: None,
                process: SYSLOG_TAG.to_string(),
                pid: std::process::id(),
            };
            let writer = syslog::unix(formatter)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
            return Ok(Self {
                sink: Sink::Syslog(writer),
            });
        }
        match &cfg.audit_file {
            Some(path) => Self::file(path),
            None => Ok(Self::stderr()),
        }
    }

    pub fn file(path: &Path) -> std::io::Result<Self> {
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { sink: Sink::File(f) })
    }

    pub fn stderr() -> Self {
        Self { sink: Sink::Stderr }
    }

    /// Discards everything.
    pub fn null() -> Self {
        Self { sink: Sink::Null }
    }

    pub fn record(&mut self, ts: i64, event: AuditEvent) {
        if matches!(self.sink, Sink::Null) {
            return;
        }
        let line = match serde_json::to_string(&AuditLine { ts, event: &event }) {
            Ok(line) => line,
            Err(e) => {
                error!("failed to serialize audit event: {}", e);
                return;
            }
        };
        let res = match &mut self.sink {
            Sink::Stderr => writeln!(std::io::stderr(), "{}", line),
            Sink::File(f) => writeln!(f, "{}", line),
            Sink::Syslog(w) => w
                .info(&line)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string())),
            Sink::Null => Ok(()),
        };
        if let Err(e) = res {
            error!("failed to write audit record: {}", e);
        }
    }
}
