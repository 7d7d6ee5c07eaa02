#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::thread;
use std::time::Duration;

use knock_doorman::sequence;
use knock_doorman::totp::Totp;

/// Pause between knocks so they arrive, and are captured, in order.
const KNOCK_DELAY: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "knock-knocker", version)]
struct Cli {
    /// Host running the knock listener
    #[arg(long)]
    host: String,
    /// PIN shared with the listener, if the client profile has one
    #[arg(long, default_value = "")]
    pin: String,
    /// Number of knocks in the sequence
    #[arg(long, default_value_t = 3)]
    cnt: i64,
    /// One-time code to use instead of computing it
    #[arg(long)]
    otp: Option<String>,
    /// Base32 TOTP secret
    #[arg(long, env = "KNOCK_SECRET", hide_env_values = true)]
    secret: Option<String>,
}

fn resolve(host: &str) -> Result<SocketAddr> {
    (host, 0)
        .to_socket_addrs()
        .with_context(|| format!("resolve {}", host))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| anyhow!("no IPv4 address for {}", host))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let code = match (cli.otp, cli.secret) {
        (Some(otp), _) => otp,
        (None, Some(secret)) => Totp::from_base32(&secret)?.now(),
        (None, None) => return Err(anyhow!("pass --otp or set KNOCK_SECRET")),
    };
    let count = sequence::clamp_count(cli.cnt).unwrap_or_else(|e| {
        eprintln!("warning: {}", e);
        sequence::DEFAULT_KNOCKS
    });
    let (ports, lengths) = sequence::derive(&code, &cli.pin, count);

    let mut target = resolve(&cli.host)?;
    let sock = UdpSocket::bind("0.0.0.0:0").context("bind UDP socket")?;

    for (i, (port, len)) in ports.iter().zip(&lengths).enumerate() {
        if i > 0 {
            thread::sleep(KNOCK_DELAY);
        }
        let mut payload = vec![0u8; usize::from(*len)];
        getrandom::getrandom(&mut payload).map_err(|e| anyhow!(e))?;
        target.set_port(*port);
        sock.send_to(&payload, target)
            .with_context(|| format!("send knock to {}", target))?;
        println!("knock {}: port {} length {}", i + 1, port, len);
    }
    println!("Sequence sent. If valid, ports should open shortly.");
    Ok(())
}
