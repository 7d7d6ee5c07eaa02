//! The listener's single-threaded event loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::capture::KnockSource;
use crate::error::DoormanError;
use crate::firewall::FirewallController;
use crate::tracker::KnockTracker;

/// Idle time after which trackers are housekept without an event.
const HOUSEKEEPING_INTERVAL: i64 = 5;

pub type ShutdownFlag = Arc<AtomicBool>;

pub struct Orchestrator<S> {
    source: S,
    trackers: Vec<KnockTracker>,
    firewall: FirewallController,
    shutdown: ShutdownFlag,
    clock: fn() -> i64,
    next_fw_check: i64,
    housekeeping_due: i64,
}

impl<S: KnockSource> Orchestrator<S> {
    pub fn new(
        source: S,
        trackers: Vec<KnockTracker>,
        firewall: FirewallController,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self::with_clock(source, trackers, firewall, shutdown, crate::now_unix)
    }

    /// Builds each tracker's first window right away, so knocks captured
    /// before the first event is processed are measured against it.
    pub fn with_clock(
        source: S,
        mut trackers: Vec<KnockTracker>,
        firewall: FirewallController,
        shutdown: ShutdownFlag,
        clock: fn() -> i64,
    ) -> Self {
        let now = clock();
        for tracker in &mut trackers {
            tracker.housekeeping(now);
        }
        Self {
            source,
            trackers,
            firewall,
            shutdown,
            clock,
            next_fw_check: 0,
            housekeeping_due: now + HOUSEKEEPING_INTERVAL,
        }
    }

    /// Runs until the capture fails or shutdown is requested, then tries to
    /// install the fail-open rules before handing back the error.
    pub fn run(&mut self) -> Result<(), DoormanError> {
        info!(clients = self.trackers.len(), "listening for knocks");
        let err = loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break DoormanError::Shutdown;
            }
            if let Err(e) = self.step() {
                break e;
            }
        };
        match &err {
            DoormanError::Shutdown => info!("shutdown requested"),
            e => error!("listener stopped: {}", e),
        }
        info!("attempting to add failopen rules if enabled");
        self.firewall.add_failopen_rules((self.clock)());
        Err(err)
    }

    /// One iteration: wait for at most one event, dispatch it, then run
    /// whatever periodic work is due.
    pub fn step(&mut self) -> Result<(), DoormanError> {
        let event = self.source.next_event()?;
        let now = (self.clock)();

        if let Some(event) = event {
            debug!(?event, "dispatching knock");
            for tracker in &mut self.trackers {
                tracker.process_knock(&event, now, &mut self.firewall);
            }
            self.housekeeping_due = now + HOUSEKEEPING_INTERVAL;
        }

        if self.next_fw_check <= now {
            self.next_fw_check = self.firewall.remove_expired(now);
        }
        // process_knock housekeeps on every event; this covers quiet periods
        if now > self.housekeeping_due {
            for tracker in &mut self.trackers {
                tracker.housekeeping(now);
            }
        }
        Ok(())
    }

    pub fn trackers(&self) -> &[KnockTracker] {
        &self.trackers
    }

    pub fn next_fw_check(&self) -> i64 {
        self.next_fw_check
    }
}
