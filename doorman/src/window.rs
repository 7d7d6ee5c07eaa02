//! Per-client knock sequence that rotates with the one-time code.

use std::rc::Rc;

use tracing::debug;

use crate::sequence;
use crate::totp::{CodeSource, PERIOD};

/// Slack before a new window's creation time during which knocks still count.
const START_SLACK: i64 = 1;
/// How long a window accepts first knocks: one period plus a little extra.
const WINDOW_LIFETIME: i64 = 35;

/// The sequence valid for one code value. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceWindow {
    pub start_epoch: i64,
    pub expiration_epoch: i64,
    pub code: String,
    pub ports: Vec<u16>,
    pub lengths: Vec<u8>,
}

impl SequenceWindow {
    pub fn steps(&self) -> usize {
        self.ports.len()
    }

    /// True when step `idx` expects exactly this port and payload length.
    pub fn step_matches(&self, idx: usize, port: u16, length: u32) -> bool {
        match (self.ports.get(idx), self.lengths.get(idx)) {
            (Some(p), Some(l)) => *p == port && u32::from(*l) == length,
            _ => false,
        }
    }
}

/// Holds the current window and the one it replaced.
///
/// The previous window stays around so a sequence begun just before the code
/// rotated can still be started from it until its own expiration.
pub struct RotatingWindow {
    source: Box<dyn CodeSource>,
    pin: String,
    count: usize,
    current: Option<Rc<SequenceWindow>>,
    previous: Option<Rc<SequenceWindow>>,
    code_epoch: i64,
}

impl RotatingWindow {
    pub fn new(source: Box<dyn CodeSource>, pin: impl Into<String>, count: usize) -> Self {
        Self {
            source,
            pin: pin.into(),
            count,
            current: None,
            previous: None,
            code_epoch: 0,
        }
    }

    /// Recomputes the code if a period boundary has passed since it was last
    /// taken, and rotates the windows when the value changed.
    pub fn refresh(&mut self, now: i64) {
        let seconds_into_period = now.rem_euclid(PERIOD);
        let held_for = now - self.code_epoch;
        if self.current.is_some() && held_for <= seconds_into_period {
            return;
        }

        let code = self.source.code_at(now);
        if self.current.as_ref().is_some_and(|w| w.code == code) {
            return;
        }

        let (ports, lengths) = sequence::derive(&code, &self.pin, self.count);
        let window = Rc::new(SequenceWindow {
            start_epoch: now - START_SLACK,
            expiration_epoch: now + WINDOW_LIFETIME,
            code,
            ports,
            lengths,
        });
        debug!(?window, "rotated knock sequence");
        self.code_epoch = now;
        self.previous = self.current.replace(window);
    }

    pub fn current(&self) -> Option<&Rc<SequenceWindow>> {
        self.current.as_ref()
    }

    pub fn previous(&self) -> Option<&Rc<SequenceWindow>> {
        self.previous.as_ref()
    }

    /// Windows a first knock at `epoch` may start from, newest first.
    pub fn candidates(&self, epoch: i64) -> impl Iterator<Item = &Rc<SequenceWindow>> {
        let previous = self
            .previous
            .as_ref()
            .filter(move |w| epoch <= w.expiration_epoch);
        self.current.iter().chain(previous)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    /// Code source returning a fixed code per 30s period, "000000" elsewhere.
    pub(crate) struct ScriptedCodes {
        pub codes: RefCell<BTreeMap<i64, String>>,
    }

    impl ScriptedCodes {
        pub(crate) fn new(entries: &[(i64, &str)]) -> Self {
            let codes = entries
                .iter()
                .map(|(period, code)| (*period, code.to_string()))
                .collect();
            Self {
                codes: RefCell::new(codes),
            }
        }
    }

    impl CodeSource for ScriptedCodes {
        fn code_at(&self, epoch: i64) -> String {
            self.codes
                .borrow()
                .get(&epoch.div_euclid(PERIOD))
                .cloned()
                .unwrap_or_else(|| "000000".into())
        }
    }

    fn window_with(entries: &[(i64, &str)]) -> RotatingWindow {
        RotatingWindow::new(Box::new(ScriptedCodes::new(entries)), "", 3)
    }

    #[test]
    fn first_refresh_builds_current() {
        let mut w = window_with(&[(100, "111111")]);
        w.refresh(3005);
        let cur = w.current().unwrap();
        assert_eq!(cur.code, "111111");
        assert_eq!(cur.start_epoch, 3004);
        assert_eq!(cur.expiration_epoch, 3040);
        assert_eq!(
            (cur.ports.clone(), cur.lengths.clone()),
            sequence::derive("111111", "", 3)
        );
        assert!(w.previous().is_none());
    }

    #[test]
    fn rotation_keeps_previous() {
        let mut w = window_with(&[(100, "111111"), (101, "222222")]);
        w.refresh(3005);
        w.refresh(3020);
        assert_eq!(w.current().unwrap().code, "111111");

        w.refresh(3031);
        assert_eq!(w.current().unwrap().code, "222222");
        assert_eq!(w.previous().unwrap().code, "111111");
    }

    #[test]
    fn same_window_is_shared_not_rebuilt() {
        let mut w = window_with(&[(100, "111111")]);
        w.refresh(3001);
        let first = Rc::clone(w.current().unwrap());
        w.refresh(3029);
        assert!(Rc::ptr_eq(&first, w.current().unwrap()));
    }

    #[test]
    fn previous_drops_out_of_candidates_after_expiry() {
        let mut w = window_with(&[(100, "111111"), (101, "222222")]);
        w.refresh(3000);
        w.refresh(3030);
        // previous expires at 3035
        assert_eq!(w.candidates(3035).count(), 2);
        assert_eq!(w.candidates(3036).count(), 1);
        assert!(w.previous().is_some());
    }

    #[test]
    fn step_matching() {
        let win = SequenceWindow {
            start_epoch: 0,
            expiration_epoch: 10,
            code: "x".into(),
            ports: vec![40000, 40001],
            lengths: vec![3, 7],
        };
        assert!(win.step_matches(0, 40000, 3));
        assert!(!win.step_matches(0, 40000, 7));
        assert!(!win.step_matches(1, 40000, 7));
        assert!(!win.step_matches(2, 40000, 3));
    }
}
