//! Temporary `ufw` rules: adding them, finding them again, expiring them.
//!
//! Rules carry their own bookkeeping in the ufw comment field, so the live
//! rule list is the only state; nothing is cached between checks.
//!
//! ```text
//! 22/tcp    ALLOW   203.0.113.7   # knock type:allow id:alice expire:1700000030
//! 22/tcp    ALLOW   Anywhere      # knock type:fail expire:1700000060
//! ```

use std::net::IpAddr;
use std::process::{Command, Output};

use regex::Regex;
use tracing::{debug, error, info};

use crate::audit::{AuditEvent, AuditLog};
use crate::config::{ListenerConfig, PortSpec, UfwConfig};

/// Longest the orchestrator waits between expiration checks.
pub const MAX_CHECK_INTERVAL: i64 = 6;

/// Runs the firewall tool. Swapped out in tests.
pub trait CommandRunner {
    fn run(&mut self, args: &[String]) -> std::io::Result<Output>;
}

/// Runs `[sudo] ufw <args>`.
pub struct UfwRunner {
    base: Vec<String>,
}

impl UfwRunner {
    pub fn new(cfg: &UfwConfig) -> Self {
        let mut base = Vec::new();
        if cfg.use_sudo {
            base.push("sudo".to_string());
        }
        base.push(cfg.ufw_cmd.clone());
        Self { base }
    }
}

impl CommandRunner for UfwRunner {
    fn run(&mut self, args: &[String]) -> std::io::Result<Output> {
        Command::new(&self.base[0])
            .args(&self.base[1..])
            .args(args)
            .output()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSource {
    Anywhere,
    Address(String),
}

impl RuleSource {
    fn parse(from: &str) -> Self {
        if from.eq_ignore_ascii_case("anywhere") {
            RuleSource::Anywhere
        } else {
            RuleSource::Address(from.to_string())
        }
    }
}

impl std::fmt::Display for RuleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleSource::Anywhere => f.write_str("anywhere"),
            RuleSource::Address(a) => f.write_str(a),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleKind {
    Allow { id: String },
    FailOpen,
}

/// One of our rules as reported by `ufw status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub port: PortSpec,
    pub action: String,
    pub source: RuleSource,
    pub kind: RuleKind,
    pub expire: i64,
}

/// Builds the ufw argument lists. Kept apart from the controller so the exact
/// command shapes are easy to test.
pub mod rules {
    use super::RuleSource;
    use crate::config::PortSpec;

    pub fn allow_comment(id: &str, expire: i64) -> String {
        format!("knock type:allow id:{} expire:{}", id, expire)
    }

    pub fn failopen_comment(expire: i64) -> String {
        format!("knock type:fail expire:{}", expire)
    }

    pub fn allow(source: &str, port: &PortSpec, comment: String) -> Vec<String> {
        let mut args = vec!["allow".to_string(), "from".into(), source.into()];
        if let Some(proto) = &port.protocol {
            args.extend(["proto".into(), proto.clone()]);
        }
        args.extend([
            "to".into(),
            "any".into(),
            "port".into(),
            port.port.to_string(),
            "comment".into(),
            comment,
        ]);
        args
    }

    pub fn failopen(port: &PortSpec, comment: String) -> Vec<String> {
        vec!["allow".into(), port.to_string(), "comment".into(), comment]
    }

    /// Mirrors whichever selector created the rule.
    pub fn delete(source: &RuleSource, port: &PortSpec) -> Vec<String> {
        match source {
            RuleSource::Anywhere => vec!["delete".into(), "allow".into(), port.to_string()],
            RuleSource::Address(addr) => {
                let mut args = vec![
                    "delete".to_string(),
                    "allow".into(),
                    "from".into(),
                    addr.clone(),
                ];
                if let Some(proto) = &port.protocol {
                    args.extend(["proto".into(), proto.clone()]);
                }
                args.extend(["to".into(), "any".into(), "port".into(), port.port.to_string()]);
                args
            }
        }
    }
}

/// Parses `ufw status` output into our rules.
pub struct RuleParser {
    rule: Regex,
    allow: Regex,
    failopen: Regex,
}

impl Default for RuleParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleParser {
    pub fn new() -> Self {
        let compile = |re: &str| Regex::new(re).expect("static firewall regex");
        Self {
            // port[/proto], action, from, comment
            rule: compile(r"^(\d+(?:/\w+)?)\s+(\S+)\s+(\S+)\s+#\s*knock\s+(.*)$"),
            // type, id, expire
            allow: compile(r"^\s*type:\s*(\w+)\s+id:\s*(\S+.*)\s+expire:\s*(\d+).*$"),
            // type, expire
            failopen: compile(r"^\s*type:\s*(\w+)\s+expire:\s*(\d+).*$"),
        }
    }

    pub fn parse(&self, output: &str) -> Vec<FirewallRule> {
        output.lines().filter_map(|l| self.parse_line(l)).collect()
    }

    fn parse_line(&self, line: &str) -> Option<FirewallRule> {
        let caps = self.rule.captures(line.trim_end())?;
        let port = match caps[1].parse::<PortSpec>() {
            Ok(p) => p,
            Err(e) => {
                error!(line, "unparseable port in firewall rule: {}", e);
                return None;
            }
        };
        let action = caps[2].to_ascii_lowercase();
        let source = RuleSource::parse(&caps[3]);
        let comment = &caps[4];

        let (kind, expire) = if let Some(c) = self.allow.captures(comment).filter(|c| &c[1] == "allow") {
            (RuleKind::Allow { id: c[2].to_string() }, c[3].parse().ok())
        } else if let Some(c) = self.failopen.captures(comment).filter(|c| &c[1] == "fail") {
            (RuleKind::FailOpen, c[2].parse().ok())
        } else {
            error!("error parsing firewall rule comment: '{}'", comment);
            return None;
        };

        let Some(expire) = expire else {
            error!("expire out of range in firewall rule comment: '{}'", comment);
            return None;
        };
        Some(FirewallRule {
            port,
            action,
            source,
            kind,
            expire,
        })
    }
}

/// Sole owner of this system's rules in the ufw rule table.
pub struct FirewallController {
    runner: Box<dyn CommandRunner>,
    parser: RuleParser,
    audit: AuditLog,
    failopen: bool,
    failopen_ports: Vec<PortSpec>,
    failopen_min_time: u64,
    /// Whether the last listing (or any add since) saw our rules.
    rules_present: bool,
}

impl FirewallController {
    pub fn new(listener: &ListenerConfig, runner: Box<dyn CommandRunner>, audit: AuditLog) -> Self {
        Self {
            runner,
            parser: RuleParser::new(),
            audit,
            failopen: listener.failopen,
            failopen_ports: listener.failopen_ports.clone(),
            failopen_min_time: listener.failopen_min_time,
            // leftovers from a previous run must be expired too
            rules_present: true,
        }
    }

    /// Runs a command; returns stdout on success, logs and audits on failure.
    fn run(&mut self, args: &[String], now: i64) -> Option<String> {
        let failure = match self.runner.run(args) {
            Ok(out) if out.status.success() => {
                return Some(String::from_utf8_lossy(&out.stdout).into_owned());
            }
            Ok(out) => String::from_utf8_lossy(&out.stderr).trim().to_string(),
            Err(e) => e.to_string(),
        };
        let command = args.join(" ");
        error!(command = %command, "firewall command failed: {}", failure);
        self.audit.record(
            now,
            AuditEvent::CommandFailed {
                command,
                stderr: failure,
            },
        );
        None
    }

    /// Opens `port` to `source` until `now + duration`, tagged with `id`.
    pub fn add_allow(&mut self, source: IpAddr, port: &PortSpec, id: &str, duration: u64, now: i64) {
        let expire = now + duration as i64;
        debug!(%source, %port, id, duration, "adding firewall rule");
        let args = rules::allow(&source.to_string(), port, rules::allow_comment(id, expire));
        self.rules_present = true;
        if self.run(&args, now).is_some() {
            self.audit.record(
                now,
                AuditEvent::RuleAdded {
                    client: id.to_string(),
                    source: source.to_string(),
                    port: port.to_string(),
                    expire,
                },
            );
        }
    }

    /// Opens `port` to everyone for `failopen_min_time` seconds.
    pub fn add_failopen(&mut self, port: &PortSpec, now: i64) {
        let expire = now + self.failopen_min_time as i64;
        let args = rules::failopen(port, rules::failopen_comment(expire));
        self.rules_present = true;
        if self.run(&args, now).is_some() {
            self.audit.record(
                now,
                AuditEvent::FailopenAdded {
                    port: port.to_string(),
                    expire,
                },
            );
        }
    }

    /// Adds a fail-open rule for every configured port, if fail-open is on.
    pub fn add_failopen_rules(&mut self, now: i64) {
        if !self.failopen {
            info!("failopen is disabled, skipping");
            return;
        }
        let ports = self.failopen_ports.clone();
        info!(
            "adding failopen rules for ports: {}",
            ports.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ")
        );
        for port in &ports {
            self.add_failopen(port, now);
        }
    }

    /// Our rules currently in the table, or `None` if the status query failed.
    pub fn list_active(&mut self, now: i64) -> Option<Vec<FirewallRule>> {
        let out = self.run(&["status".to_string()], now)?;
        let rules = self.parser.parse(&out);
        self.rules_present = !rules.is_empty();
        Some(rules)
    }

    /// Deletes every rule past its expiration and returns when to check again:
    /// the nearest pending expiration, but never more than
    /// [`MAX_CHECK_INTERVAL`] seconds away.
    pub fn remove_expired(&mut self, now: i64) -> i64 {
        let mut next_check = now + MAX_CHECK_INTERVAL;
        if !self.rules_present {
            return next_check;
        }
        debug!("checking for expired firewall rules");
        let Some(active) = self.list_active(now) else {
            return next_check;
        };

        for rule in active {
            if rule.expire >= now {
                next_check = next_check.min(rule.expire);
                continue;
            }
            let args = rules::delete(&rule.source, &rule.port);
            if self.run(&args, now).is_some() {
                info!(
                    "deleted firewall rule '{}', expiration: {}, current time: {}",
                    args.join(" "),
                    rule.expire,
                    now
                );
                self.audit.record(
                    now,
                    AuditEvent::RuleDeleted {
                        source: rule.source.to_string(),
                        port: rule.port.to_string(),
                        expired: rule.expire,
                    },
                );
            }
        }
        next_check
    }
}
