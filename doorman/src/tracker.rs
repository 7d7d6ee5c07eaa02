//! Per-client knock session tracking.
//!
//! A session is one source address working through one particular sequence.
//! An address may have several sessions at once: two first knocks can arrive
//! before either sequence completes, and they are followed independently.

use std::collections::HashMap;
use std::net::IpAddr;
use std::rc::Rc;

use tracing::{debug, info};

use crate::capture::KnockEvent;
use crate::config::{ClientProfile, PortSpec};
use crate::error::ConfigError;
use crate::firewall::FirewallController;
use crate::totp::CodeSource;
use crate::window::{RotatingWindow, SequenceWindow};

/// Sessions are pruned this long after they expire, matching the slack given
/// to window start times.
const PRUNE_SLACK: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnockSession {
    /// Window that was current (or previous) when the first knock arrived.
    pub window: Rc<SequenceWindow>,
    pub expiration_epoch: i64,
    pub matched: usize,
}

impl KnockSession {
    fn accepts(&self, event: &KnockEvent) -> bool {
        event.timestamp <= self.expiration_epoch
            && self
                .window
                .step_matches(self.matched, event.dest_port, event.length)
    }

    fn is_complete(&self) -> bool {
        self.matched >= self.window.steps()
    }
}

/// What a single event did to a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnockOutcome {
    Ignored,
    Started,
    Advanced,
    Completed,
}

pub struct KnockTracker {
    name: String,
    ports: Vec<PortSpec>,
    open_duration: u64,
    knock_expiration: i64,
    window: RotatingWindow,
    sessions: HashMap<IpAddr, Vec<KnockSession>>,
}

impl KnockTracker {
    pub fn new(profile: &ClientProfile, knock_expiration: i64) -> Result<Self, ConfigError> {
        let totp = profile.totp()?;
        Ok(Self::with_source(profile, knock_expiration, Box::new(totp)))
    }

    pub fn with_source(
        profile: &ClientProfile,
        knock_expiration: i64,
        source: Box<dyn CodeSource>,
    ) -> Self {
        Self {
            name: profile.name.clone(),
            ports: profile.ports.clone(),
            open_duration: profile.open_duration,
            knock_expiration,
            window: RotatingWindow::new(source, profile.pin.clone(), profile.knock_cnt),
            sessions: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn window(&self) -> &RotatingWindow {
        &self.window
    }

    pub fn sessions(&self, source: &IpAddr) -> &[KnockSession] {
        self.sessions.get(source).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn tracked_sources(&self) -> usize {
        self.sessions.len()
    }

    /// Rotates the window if due and drops expired sessions.
    pub fn housekeeping(&mut self, now: i64) {
        self.window.refresh(now);

        let cutoff = now - PRUNE_SLACK;
        self.sessions.retain(|source, list| {
            list.retain(|s| {
                let keep = s.expiration_epoch >= cutoff;
                if !keep {
                    debug!(%source, expiration = s.expiration_epoch, "removing expired session");
                }
                keep
            });
            !list.is_empty()
        });
    }

    pub fn process_knock(
        &mut self,
        event: &KnockEvent,
        now: i64,
        firewall: &mut FirewallController,
    ) -> KnockOutcome {
        self.housekeeping(now);

        if let Some(list) = self.sessions.get_mut(&event.source) {
            // first matching session in creation order takes the event
            if let Some(idx) = list.iter().position(|s| s.accepts(event)) {
                let session = &mut list[idx];
                session.matched += 1;
                debug!(
                    client = %self.name,
                    "knock {} received, port={} len={}",
                    session.matched,
                    event.dest_port,
                    event.length
                );
                if !session.is_complete() {
                    return KnockOutcome::Advanced;
                }
                list.remove(idx);
                if list.is_empty() {
                    self.sessions.remove(&event.source);
                }
                self.open_door(event.source, now, firewall);
                return KnockOutcome::Completed;
            }
        }

        let Some(window) = self.first_knock_window(event) else {
            return KnockOutcome::Ignored;
        };
        debug!(
            client = %self.name,
            "first knock received, port={} len={}",
            event.dest_port,
            event.length
        );
        let session = KnockSession {
            window,
            expiration_epoch: event.timestamp + self.knock_expiration,
            matched: 1,
        };
        if session.is_complete() {
            self.open_door(event.source, now, firewall);
            return KnockOutcome::Completed;
        }
        self.sessions.entry(event.source).or_default().push(session);
        KnockOutcome::Started
    }

    fn first_knock_window(&self, event: &KnockEvent) -> Option<Rc<SequenceWindow>> {
        self.window
            .candidates(event.timestamp)
            .find(|w| {
                w.step_matches(0, event.dest_port, event.length)
                    && event.timestamp >= w.start_epoch
            })
            .cloned()
    }

    /// Requests an allow rule for each of the client's ports.
    pub fn open_door(&self, source: IpAddr, now: i64, firewall: &mut FirewallController) {
        info!(client = %self.name, %source, "knock sequence complete, opening ports");
        for port in &self.ports {
            info!("opening port {} for {}", port, source);
            firewall.add_allow(source, port, &self.name, self.open_duration, now);
        }
    }
}
