//! Knock events from `tcpdump`.
//!
//! tcpdump runs as a child process with its stdout redirected to a file; this
//! module follows that file, parses each line, and keeps the file from growing
//! without bound.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveTime, TimeZone};
use regex::Regex;
use tracing::{debug, info};

use crate::config::TcpdumpConfig;
use crate::error::CaptureError;
use crate::sequence::{PORT_END, PORT_START};
use crate::tail::TailSource;

/// Payload length ceiling passed to the capture filter (`less`).
const MAX_CAPTURE_LEN: u32 = 51;

/// One UDP packet that might be a knock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnockEvent {
    pub timestamp: i64,
    pub source: IpAddr,
    pub dest_port: u16,
    pub length: u32,
}

/// Anything the orchestrator can pull knock events from.
pub trait KnockSource {
    /// Waits a bounded time for the next event. `Ok(None)` means nothing
    /// arrived in time; errors are fatal.
    fn next_event(&mut self) -> Result<Option<KnockEvent>, CaptureError>;
}

/// tcpdump arguments: inbound UDP to the knock port range, no DNS, small payloads.
pub fn capture_args() -> Vec<String> {
    let filter = format!(
        "udp and dst portrange {}-{} and not port 53 and less {}",
        PORT_START, PORT_END, MAX_CAPTURE_LEN
    );
    ["-i", "any", "-l", "-n", "--direction=in", "-s", "63", "--no-promiscuous-mode"]
        .iter()
        .map(|s| s.to_string())
        .chain(filter.split(' ').map(str::to_string))
        .collect()
}

/// Parses tcpdump's one-line UDP summaries, e.g.
///
/// ```text
/// 00:24:19.604204 eth0  In  IP 108.185.236.147.48367 > 85.90.244.227.56965: UDP, length 16
/// ```
pub struct LineParser {
    re: Regex,
}

impl Default for LineParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LineParser {
    pub fn new() -> Self {
        // groups: timestamp, source ip, dest port, length
        let re = Regex::new(concat!(
            r"^([\d:.]+)\s.+\sIn\s+IP\s+(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\.\d{1,5}[\s>]+",
            r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\.(\d{1,5}):.+UDP.+length\s+(\d+)"
        ))
        .expect("static capture regex");
        Self { re }
    }

    pub fn parse(&self, line: &str) -> Option<KnockEvent> {
        self.parse_at(line, &Local::now())
    }

    /// Parses with `reference` supplying the date (and time zone) for the
    /// time-of-day stamp tcpdump prints.
    pub fn parse_at<Tz: TimeZone>(&self, line: &str, reference: &DateTime<Tz>) -> Option<KnockEvent> {
        let caps = self.re.captures(line)?;
        let time = NaiveTime::parse_from_str(&caps[1], "%H:%M:%S%.f").ok()?;
        let local = reference.date_naive().and_time(time);
        let mut timestamp = reference
            .timezone()
            .from_local_datetime(&local)
            .earliest()?
            .timestamp();
        // captured just before midnight, processed just after
        if timestamp > reference.timestamp() + 12 * 3600 {
            timestamp -= 24 * 3600;
        }
        Some(KnockEvent {
            timestamp,
            source: caps[2].parse().ok()?,
            dest_port: caps[3].parse().ok()?,
            length: caps[4].parse().ok()?,
        })
    }
}

/// Owns the tcpdump child and its output file.
pub struct CaptureMonitor {
    child: Child,
    cmd: String,
    path: PathBuf,
    outfile: File,
    tail: TailSource,
    parser: LineParser,
    truncate_at: u64,
    timeout: Duration,
    interval: Duration,
}

impl CaptureMonitor {
    /// Starts tcpdump with the knock filter.
    pub fn start(cfg: &TcpdumpConfig) -> Result<Self, CaptureError> {
        Self::spawn(&cfg.cmd, &capture_args(), cfg)
    }

    /// Starts `cmd args...` with stdout going to `cfg.log_file`.
    pub fn spawn(cmd: &str, args: &[String], cfg: &TcpdumpConfig) -> Result<Self, CaptureError> {
        let path = cfg.log_file.clone();
        let output_err = |source: std::io::Error| CaptureError::Output {
            path: path.clone(),
            source,
        };

        File::create(&path).map_err(output_err)?;
        // append mode: after an in-place truncation the child writes from offset 0
        let outfile = OpenOptions::new().append(true).open(&path).map_err(output_err)?;
        let child_out = outfile.try_clone().map_err(output_err)?;
        let tail = TailSource::open(&path).map_err(|source| CaptureError::Tail {
            path: path.clone(),
            source,
        })?;

        debug!(cmd, ?args, output = %path.display(), "starting capture");
        let child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(child_out))
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CaptureError::Spawn {
                cmd: cmd.to_string(),
                source,
            })?;
        info!(pid = child.id(), "capture started");

        Ok(Self {
            child,
            cmd: cmd.to_string(),
            path,
            outfile,
            tail,
            parser: LineParser::new(),
            truncate_at: cfg.truncate_size,
            timeout: Duration::from_millis(cfg.poll_timeout_ms),
            interval: Duration::from_millis(cfg.poll_interval_ms),
        })
    }

    /// Truncates the output file once enough lines have been read from it.
    pub fn check_truncate(&mut self) -> Result<(), CaptureError> {
        if self.tail.current_lines() < self.truncate_at {
            return Ok(());
        }
        debug!(path = %self.path.display(), "truncating capture output");
        let tail_err = |source: std::io::Error| CaptureError::Tail {
            path: self.path.clone(),
            source,
        };
        self.outfile.set_len(0).map_err(tail_err)?;
        self.tail.truncate().map_err(tail_err)
    }

    fn check_alive(&mut self) -> Result<(), CaptureError> {
        match self.child.try_wait().map_err(CaptureError::Wait)? {
            None => Ok(()),
            Some(status) => {
                let mut stderr = String::new();
                if let Some(mut pipe) = self.child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr);
                }
                Err(CaptureError::Exited {
                    status,
                    stderr: stderr.trim().to_string(),
                })
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines_read(&self) -> u64 {
        self.tail.total_lines()
    }
}

impl KnockSource for CaptureMonitor {
    fn next_event(&mut self) -> Result<Option<KnockEvent>, CaptureError> {
        let mut waited = Duration::ZERO;
        loop {
            let line = self.tail.poll().map_err(|source| CaptureError::Tail {
                path: self.path.clone(),
                source,
            })?;
            if let Some(line) = line {
                let event = self.parser.parse(&line);
                match &event {
                    Some(ev) => debug!(?ev, "knock event"),
                    None => debug!(line = %line, "ignoring capture line"),
                }
                return Ok(event);
            }

            self.check_truncate()?;
            self.check_alive()?;
            if waited >= self.timeout {
                return Ok(None);
            }
            thread::sleep(self.interval);
            waited += self.interval;
        }
    }
}

impl Drop for CaptureMonitor {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            debug!(cmd = %self.cmd, "stopping capture");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use std::fs;
    use tempfile::tempdir;

    const LINE: &str =
        "00:24:19.604204 eth0  In  IP 108.185.236.147.48367 > 85.90.244.227.56965: UDP, length 16";

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.from_utc_datetime(
            &NaiveDate::from_ymd_opt(y, m, d)
                .unwrap()
                .and_hms_opt(h, min, s)
                .unwrap(),
        )
    }

    #[test]
    fn parses_inbound_udp() {
        let reference = utc(2024, 3, 1, 0, 24, 20);
        let ev = LineParser::new().parse_at(LINE, &reference).unwrap();
        assert_eq!(
            ev,
            KnockEvent {
                timestamp: utc(2024, 3, 1, 0, 24, 19).timestamp(),
                source: "108.185.236.147".parse().unwrap(),
                dest_port: 56965,
                length: 16,
            }
        );
    }

    #[test]
    fn midnight_rollover_uses_previous_day() {
        let line = "23:59:59.900000 eth0  In  IP 10.0.0.1.5000 > 10.0.0.2.40000: UDP, length 3";
        let reference = utc(2024, 3, 2, 0, 0, 1);
        let ev = LineParser::new().parse_at(line, &reference).unwrap();
        assert_eq!(ev.timestamp, utc(2024, 3, 1, 23, 59, 59).timestamp());
    }

    #[test]
    fn rejects_other_traffic() {
        let parser = LineParser::new();
        let reference = utc(2024, 3, 1, 12, 0, 0);
        for line in [
            "00:24:19.604204 eth0  Out IP 10.0.0.1.5000 > 10.0.0.2.40000: UDP, length 3",
            "00:24:19.604204 eth0  In  IP 10.0.0.1.5000 > 10.0.0.2.40000: Flags [S], seq 1, length 0",
            "tcpdump: listening on any, link-type LINUX_SLL2",
            "",
            "00:24:19.604204 eth0  In  IP 10.0.0.1.5000 > 10.0.0.2.99999: UDP, length 3",
        ] {
            assert_eq!(parser.parse_at(line, &reference), None, "{}", line);
        }
    }

    #[test]
    fn filter_covers_knock_range() {
        let args = capture_args().join(" ");
        assert!(args.ends_with("udp and dst portrange 32768-49151 and not port 53 and less 51"));
        assert!(args.contains("--direction=in"));
    }

    fn test_cfg(dir: &Path) -> TcpdumpConfig {
        TcpdumpConfig {
            log_file: dir.join("capture.out"),
            cmd: "sh".into(),
            truncate_size: 3,
            poll_timeout_ms: 50,
            poll_interval_ms: 10,
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".into(), script.into()]
    }

    #[test]
    fn yields_events_written_by_child() {
        let dir = tempdir().unwrap();
        let mut cfg = test_cfg(dir.path());
        cfg.poll_timeout_ms = 5_000;
        let script = format!("echo '{}'; sleep 5", LINE);
        let mut mon = CaptureMonitor::spawn("sh", &sh(&script), &cfg).unwrap();

        let ev = mon.next_event().unwrap().unwrap();
        assert_eq!(ev.dest_port, 56965);
        assert_eq!(ev.length, 16);
    }

    #[test]
    fn undecodable_line_is_skipped() {
        let dir = tempdir().unwrap();
        let mut cfg = test_cfg(dir.path());
        cfg.poll_timeout_ms = 5_000;
        let script = format!("printf 'bad \\377\\376 line\\n'; echo '{}'; sleep 5", LINE);
        let mut mon = CaptureMonitor::spawn("sh", &sh(&script), &cfg).unwrap();

        let mut events = Vec::new();
        while mon.lines_read() < 2 {
            if let Some(ev) = mon.next_event().unwrap() {
                events.push(ev);
            }
        }
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].dest_port, 56965);
    }

    #[test]
    fn quiet_capture_returns_after_timeout() {
        let dir = tempdir().unwrap();
        let cfg = test_cfg(dir.path());
        let mut mon = CaptureMonitor::spawn("sh", &sh("sleep 5"), &cfg).unwrap();

        let started = std::time::Instant::now();
        assert_eq!(mon.next_event().unwrap(), None);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(cfg.poll_timeout_ms));
        assert!(waited < Duration::from_secs(2));
    }

    #[test]
    fn truncates_after_line_budget() {
        let dir = tempdir().unwrap();
        let cfg = test_cfg(dir.path());
        let mut mon =
            CaptureMonitor::spawn("sh", &sh("echo one; echo two; echo three; sleep 5"), &cfg).unwrap();

        for _ in 0..200 {
            mon.next_event().unwrap();
            if mon.lines_read() >= 3 && fs::metadata(mon.path()).unwrap().len() == 0 {
                break;
            }
        }
        assert_eq!(mon.lines_read(), 3);
        assert_eq!(fs::metadata(mon.path()).unwrap().len(), 0);
    }

    #[test]
    fn child_exit_is_fatal() {
        let dir = tempdir().unwrap();
        let mut cfg = test_cfg(dir.path());
        cfg.poll_timeout_ms = 5_000;
        let mut mon = CaptureMonitor::spawn("sh", &sh("echo boom >&2; exit 3"), &cfg).unwrap();

        match mon.next_event() {
            Err(CaptureError::Exited { status, stderr }) => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected exit error, got {:?}", other),
        }
    }

    #[test]
    fn missing_command_fails_to_spawn() {
        let dir = tempdir().unwrap();
        let cfg = test_cfg(dir.path());
        assert!(matches!(
            CaptureMonitor::spawn("/nonexistent/tcpdump", &[], &cfg),
            Err(CaptureError::Spawn { .. })
        ));
    }
}
