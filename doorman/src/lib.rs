#![forbid(unsafe_code)]

//! Port-knocking listener.
//!
//! Each registered client shares a TOTP secret with the listener. The current
//! one-time code (plus an optional PIN) is hashed into a short sequence of
//! `(port, payload length)` pairs; a source address that sends UDP packets
//! matching that sequence in order gets temporary `ufw` allow rules for the
//! client's configured ports.
//!
//! Packets are never received directly: `tcpdump` writes matching traffic to
//! a file which [`capture::CaptureMonitor`] follows and parses. Completed
//! sequences are turned into rules by [`firewall::FirewallController`], which
//! also expires them and installs fail-open rules on shutdown.

pub mod audit;
pub mod capture;
pub mod config;
pub mod error;
pub mod firewall;
pub mod orchestrator;
pub mod sequence;
pub mod tail;
pub mod totp;
pub mod tracker;
pub mod window;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use error::{CaptureError, ConfigError, DoormanError, KnockCountError};

/// Current wall-clock time in whole unix seconds.
pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs() as i64
}
