//! Listener configuration.
//!
//! One global TOML file plus a directory of per-client TOML files. Missing keys
//! take defaults; out-of-range values are clamped and reported through
//! [`Config::warnings`] so they can be logged once logging is up.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::sequence::{self, DEFAULT_KNOCKS};
use crate::totp::Totp;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/knockknock/knock.toml";

const DEFAULT_KNOCK_EXPIRATION: i64 = 10;
const MAX_KNOCK_EXPIRATION: i64 = 30;

/// A port with an optional protocol, written `22` or `22/tcp`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "PortEntry")]
pub struct PortSpec {
    pub port: u16,
    pub protocol: Option<String>,
}

impl PortSpec {
    pub fn new(port: u16, protocol: Option<&str>) -> Self {
        Self {
            port,
            protocol: protocol.map(str::to_ascii_lowercase),
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.protocol {
            Some(proto) => write!(f, "{}/{}", self.port, proto),
            None => write!(f, "{}", self.port),
        }
    }
}

impl FromStr for PortSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ConfigError::PortSpec(s.to_string());
        let (port, proto) = match s.trim().split_once('/') {
            Some((port, proto)) => (port, Some(proto)),
            None => (s.trim(), None),
        };
        let port: u16 = port.parse().map_err(|_| bad())?;
        if port == 0 {
            return Err(bad());
        }
        match proto {
            Some(p) if p.is_empty() || !p.chars().all(|c| c.is_ascii_alphanumeric()) => Err(bad()),
            _ => Ok(Self::new(port, proto)),
        }
    }
}

/// TOML allows both `22` and `"22/tcp"` in the same list.
#[derive(Deserialize)]
#[serde(untagged)]
enum PortEntry {
    Number(i64),
    Text(String),
}

impl TryFrom<PortEntry> for PortSpec {
    type Error = ConfigError;

    fn try_from(entry: PortEntry) -> Result<Self, Self::Error> {
        match entry {
            PortEntry::Number(n) => n.to_string().parse(),
            PortEntry::Text(s) => s.parse(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Seconds a started knock sequence has to complete.
    pub knock_expiration: i64,
    pub pidfile: PathBuf,
    /// Directory holding one `*.toml` file per client.
    pub client_cfg: PathBuf,
    pub failopen: bool,
    pub failopen_ports: Vec<PortSpec>,
    /// Seconds fail-open rules stay before the next listener run expires them.
    pub failopen_min_time: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            knock_expiration: DEFAULT_KNOCK_EXPIRATION,
            pidfile: PathBuf::from("/var/run/knock.pid"),
            client_cfg: PathBuf::from("/etc/knockknock/conf.d"),
            failopen: true,
            failopen_ports: vec![PortSpec::new(22, Some("tcp"))],
            failopen_min_time: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UfwConfig {
    pub ufw_cmd: String,
    pub use_sudo: bool,
}

impl Default for UfwConfig {
    fn default() -> Self {
        Self {
            ufw_cmd: "/usr/sbin/ufw".into(),
            use_sudo: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    /// Send audit records to syslog instead of stderr.
    pub syslog: bool,
    /// Append audit records as JSON lines to this file.
    pub audit_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            syslog: false,
            audit_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TcpdumpConfig {
    /// File tcpdump output is redirected to and followed from.
    pub log_file: PathBuf,
    pub cmd: String,
    /// Truncate the output file after this many lines.
    pub truncate_size: u64,
    /// Longest a single poll waits for a line.
    pub poll_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for TcpdumpConfig {
    fn default() -> Self {
        Self {
            log_file: PathBuf::from("/tmp/tcpdump-knock.out"),
            cmd: "/usr/bin/tcpdump".into(),
            truncate_size: 10_000,
            poll_timeout_ms: 2_000,
            poll_interval_ms: 330,
        }
    }
}

/// A registered client, validated. Read-only for the life of the process.
#[derive(Clone)]
pub struct ClientProfile {
    pub name: String,
    pub secret: String,
    pub pin: String,
    pub ports: Vec<PortSpec>,
    pub knock_cnt: usize,
    /// Seconds the opened ports stay open.
    pub open_duration: u64,
}

impl fmt::Debug for ClientProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientProfile")
            .field("name", &self.name)
            .field("secret", &"<redacted>")
            .field("pin", &if self.pin.is_empty() { "" } else { "<redacted>" })
            .field("ports", &self.ports)
            .field("knock_cnt", &self.knock_cnt)
            .field("open_duration", &self.open_duration)
            .finish()
    }
}

impl ClientProfile {
    pub fn totp(&self) -> Result<Totp, ConfigError> {
        Totp::from_base32(&self.secret)
    }
}

#[derive(Deserialize)]
struct ClientFile {
    name: Option<String>,
    secret: String,
    #[serde(default)]
    pin: String,
    #[serde(default = "default_client_ports")]
    ports: Vec<PortSpec>,
    #[serde(default = "default_knock_cnt")]
    knock_cnt: i64,
    #[serde(default = "default_open_duration")]
    open_duration: u64,
}

fn default_client_ports() -> Vec<PortSpec> {
    vec![PortSpec::new(22, Some("tcp"))]
}

fn default_knock_cnt() -> i64 {
    DEFAULT_KNOCKS as i64
}

fn default_open_duration() -> u64 {
    10
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listener: ListenerConfig,
    pub ufw: UfwConfig,
    pub logging: LoggingConfig,
    pub tcpdump: TcpdumpConfig,
    #[serde(skip)]
    pub clients: Vec<ClientProfile>,
    /// Problems that were corrected while loading.
    #[serde(skip)]
    pub warnings: Vec<String>,
}

impl Config {
    /// Loads the global file and every client file it points at.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = read(path)?;
        let mut cfg = Self::from_toml(&text, path)?;
        cfg.load_clients()?;
        Ok(cfg)
    }

    /// Parses and validates the global settings only.
    pub fn from_toml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut cfg: Config = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let exp = cfg.listener.knock_expiration;
        if !(1..=MAX_KNOCK_EXPIRATION).contains(&exp) {
            cfg.warnings.push(format!(
                "knock_expiration {} out of range [1, {}]; using {}",
                exp, MAX_KNOCK_EXPIRATION, DEFAULT_KNOCK_EXPIRATION
            ));
            cfg.listener.knock_expiration = DEFAULT_KNOCK_EXPIRATION;
        }
        if cfg.tcpdump.truncate_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "tcpdump.truncate_size".into(),
                message: "must be at least 1".into(),
            });
        }
        if cfg.tcpdump.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "tcpdump.poll_interval_ms".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(cfg)
    }

    /// Reads every `*.toml` in `listener.client_cfg`, in file name order.
    pub fn load_clients(&mut self) -> Result<(), ConfigError> {
        let dir = self.listener.client_cfg.clone();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.warnings
                    .push(format!("client directory {} does not exist", dir.display()));
                return Ok(());
            }
            Err(source) => return Err(ConfigError::Read { path: dir, source }),
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        files.sort();

        let mut names = HashSet::new();
        for file in files {
            let client = load_client(&file, &mut self.warnings)?;
            if !names.insert(client.name.clone()) {
                return Err(ConfigError::DuplicateClient(client.name));
            }
            self.clients.push(client);
        }
        if self.clients.is_empty() {
            self.warnings
                .push(format!("no client profiles found in {}", dir.display()));
        }
        Ok(())
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads one client profile. The name defaults to the file stem.
pub fn load_client(path: &Path, warnings: &mut Vec<String>) -> Result<ClientProfile, ConfigError> {
    let text = read(path)?;
    let raw: ClientFile = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let name = match raw.name.filter(|n| !n.trim().is_empty()) {
        Some(name) => name,
        None => path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };

    // decoded now so a bad secret fails startup rather than the first knock
    Totp::from_base32(&raw.secret).map_err(|e| ConfigError::InvalidValue {
        field: format!("{}.secret", name),
        message: e.to_string(),
    })?;

    let knock_cnt = sequence::clamp_count(raw.knock_cnt).unwrap_or_else(|e| {
        warnings.push(format!("client '{}': {}", name, e));
        DEFAULT_KNOCKS
    });

    if raw.ports.is_empty() {
        warnings.push(format!("client '{}' has no ports to open", name));
    }

    Ok(ClientProfile {
        name,
        secret: raw.secret,
        pin: raw.pin,
        ports: raw.ports,
        knock_cnt,
        open_duration: raw.open_duration,
    })
}
