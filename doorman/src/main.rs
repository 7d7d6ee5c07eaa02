#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use knock_doorman::audit::AuditLog;
use knock_doorman::capture::CaptureMonitor;
use knock_doorman::config::{Config, DEFAULT_CONFIG_PATH};
use knock_doorman::firewall::{FirewallController, UfwRunner};
use knock_doorman::orchestrator::{Orchestrator, ShutdownFlag};
use knock_doorman::tracker::KnockTracker;
use knock_doorman::{now_unix, DoormanError};

#[derive(Parser, Debug)]
#[command(name = "knock-doorman", version)]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the knock listener
    Run {
        /// Main configuration file (TOML)
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config_file: PathBuf,
    },

    /// Load and validate the configuration, then print a summary
    CheckConfig {
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config_file: PathBuf,
    },

    /// Print the knock sequence currently valid for one client
    Sequence {
        /// Client name as given in its profile
        #[arg(long)]
        client: String,
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config_file: PathBuf,
    },
}

/// Installs the stderr diagnostics subscriber.
///
/// `-v` wins over `RUST_LOG`, which wins over `[logging] log_level`.
fn init_tracing(verbose: u8, config_level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(config_level))
            .unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .map_err(|e| anyhow!("failed to initialize tracing subscriber: {}", e))?;

    Ok(())
}

fn load_config(path: &Path, verbose: u8) -> Result<Config> {
    let cfg = Config::load(path)?;
    init_tracing(verbose, &cfg.logging.log_level)?;
    for w in &cfg.warnings {
        warn!("{}", w);
    }
    Ok(cfg)
}

/// Exclusive PID file, removed again on drop.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn create(path: &Path) -> Result<Self> {
        let mut f = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(anyhow!(
                    "pid file {} already exists; is another listener running?",
                    path.display()
                ));
            }
            Err(e) => return Err(e).with_context(|| format!("create {}", path.display())),
        };
        writeln!(f, "{}", std::process::id())
            .with_context(|| format!("write {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            error!("failed to remove pid file {}: {}", self.path.display(), e);
        }
    }
}

fn register_shutdown_handler(shutdown: ShutdownFlag) -> Result<()> {
    ctrlc::set_handler(move || {
        shutdown.store(true, Ordering::SeqCst);
    })
    .context("register signal handler")
}

fn run_listener(cfg: Config) -> Result<()> {
    if cfg.clients.is_empty() {
        warn!(
            "no clients configured in {}; nothing can be opened",
            cfg.listener.client_cfg.display()
        );
    }
    let trackers = cfg
        .clients
        .iter()
        .map(|c| KnockTracker::new(c, cfg.listener.knock_expiration))
        .collect::<Result<Vec<_>, _>>()?;

    let _pid = PidFile::create(&cfg.listener.pidfile)?;

    let shutdown: ShutdownFlag = Arc::new(AtomicBool::new(false));
    register_shutdown_handler(Arc::clone(&shutdown))?;

    let audit = AuditLog::from_config(&cfg.logging).context("open audit log")?;
    let mut firewall = FirewallController::new(
        &cfg.listener,
        Box::new(UfwRunner::new(&cfg.ufw)),
        audit,
    );

    let capture = match CaptureMonitor::start(&cfg.tcpdump) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to start capture: {}", e);
            firewall.add_failopen_rules(now_unix());
            return Err(e.into());
        }
    };
    info!(
        clients = cfg.clients.len(),
        output = %capture.path().display(),
        "following capture output"
    );

    let mut orchestrator = Orchestrator::new(capture, trackers, firewall, shutdown);
    match orchestrator.run() {
        Ok(()) | Err(DoormanError::Shutdown) => {
            info!("listener stopped");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn check_config(cfg: &Config) {
    let l = &cfg.listener;
    println!("knock expiration: {}s", l.knock_expiration);
    println!("client profiles:  {}", l.client_cfg.display());
    println!("pid file:         {}", l.pidfile.display());
    if l.failopen {
        let ports: Vec<String> = l.failopen_ports.iter().map(|p| p.to_string()).collect();
        println!("failopen:         {} for {}s", ports.join(", "), l.failopen_min_time);
    } else {
        println!("failopen:         disabled");
    }
    println!("capture output:   {}", cfg.tcpdump.log_file.display());
    println!("clients:          {}", cfg.clients.len());
    for c in &cfg.clients {
        let ports: Vec<String> = c.ports.iter().map(|p| p.to_string()).collect();
        println!(
            "  {}: {} knocks, opens {} for {}s",
            c.name,
            c.knock_cnt,
            ports.join(", "),
            c.open_duration
        );
    }
}

fn print_sequence(cfg: &Config, name: &str) -> Result<()> {
    let client = cfg
        .clients
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| anyhow!("no client named '{}'", name))?;
    let mut tracker = KnockTracker::new(client, cfg.listener.knock_expiration)?;
    tracker.housekeeping(now_unix());
    let window = tracker
        .window()
        .current()
        .ok_or_else(|| anyhow!("no sequence window for '{}'", name))?;
    println!("valid until {}", window.expiration_epoch);
    for (port, len) in window.ports.iter().zip(&window.lengths) {
        println!("{} {}", port, len);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Command::Run { config_file } => {
            let cfg = load_config(&config_file, cli.verbose)?;
            run_listener(cfg)
        }
        Command::CheckConfig { config_file } => {
            let cfg = load_config(&config_file, cli.verbose)?;
            check_config(&cfg);
            println!("ok");
            Ok(())
        }
        Command::Sequence {
            client,
            config_file,
        } => {
            let cfg = load_config(&config_file, cli.verbose)?;
            print_sequence(&cfg, &client)
        }
    }
}
