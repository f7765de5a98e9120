use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use rand::prelude::IndexedRandom;
use rand::Rng;
use tokio::io::AsyncWriteExt;

/// Test-traffic generator: emits well-formed syslog into a receiver.
#[derive(Parser)]
#[command(name = "loggen", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send `count` syslog frames spread over `duration`.
    Generate {
        /// Receiver address, host:port.
        #[arg(long, default_value = "127.0.0.1:5514")]
        target: String,
        #[arg(long, value_enum, default_value_t = Transport::Udp)]
        transport: Transport,
        /// Number of events to emit.
        #[arg(long, default_value_t = 100)]
        count: u64,
        /// Wall-clock spread, e.g. 30s, 5m.
        #[arg(long, default_value = "10s")]
        duration: String,
        #[arg(long, value_enum, default_value_t = Scenario::Mixed)]
        scenario: Scenario,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Transport {
    Udp,
    Tcp,
}

#[derive(Clone, Copy, ValueEnum)]
enum Scenario {
    /// Web servers serving requests, mostly informational.
    Web,
    /// Auth daemons with failed logins.
    Auth,
    /// A blend of both plus JSON app logs.
    Mixed,
}

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("missing unit in duration '{s}'"))?;
    let (digits, unit) = s.split_at(split);
    let n: u64 = digits.parse().map_err(|_| format!("bad duration '{s}'"))?;
    let millis = match unit {
        "ms" => n,
        "s" => n * 1_000,
        "m" => n * 60_000,
        "h" => n * 3_600_000,
        _ => return Err(format!("unknown duration unit '{unit}'")),
    };
    Ok(Duration::from_millis(millis))
}

const WEB_HOSTS: &[&str] = &["web-01", "web-02", "lb-01"];
const AUTH_HOSTS: &[&str] = &["bastion", "vpn-gw", "db-01"];
const PATHS: &[&str] = &["/", "/index.html", "/api/v1/users", "/api/v1/orders", "/health"];
const USERS: &[&str] = &["alice", "bob", "carol", "root"];

fn web_frame(rng: &mut impl Rng) -> String {
    let host = WEB_HOSTS.choose(rng).unwrap();
    let path = PATHS.choose(rng).unwrap();
    let status = *[200, 200, 200, 301, 404, 500].choose(rng).unwrap();
    let severity = if status >= 500 { 3 } else { 6 };
    let pri = 16 * 8 + severity;
    let bytes = rng.random_range(200..20_000);
    let ms = rng.random_range(1..900);
    format!(
        "<{pri}>1 {} {host} nginx 0 - - GET {path} {status} {bytes}b in {ms} ms",
        Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
    )
}

fn auth_frame(rng: &mut impl Rng) -> String {
    let host = AUTH_HOSTS.choose(rng).unwrap();
    let user = USERS.choose(rng).unwrap();
    let failed = rng.random_bool(0.3);
    let (severity, verb) = if failed { (4, "Failed") } else { (6, "Accepted") };
    let pri = 4 * 8 + severity;
    let ip = format!(
        "{}.{}.{}.{}",
        rng.random_range(1..223),
        rng.random_range(0..255),
        rng.random_range(0..255),
        rng.random_range(1..255)
    );
    let now = Utc::now();
    format!(
        "<{pri}>{} {host} sshd[{}]: {verb} password for {user} from {ip} port {}",
        now.format("%b %e %H:%M:%S"),
        rng.random_range(100..60_000),
        rng.random_range(1024..65_000),
    )
}

fn json_frame(rng: &mut impl Rng) -> String {
    let user = USERS.choose(rng).unwrap();
    let order = rng.random_range(1000..99_999);
    serde_json::json!({
        "timestamp": Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        "host": "api-1",
        "service": "payments",
        "level": if rng.random_bool(0.1) { "error" } else { "info" },
        "message": format!("order {order} processed"),
        "user": user,
        "order_id": order,
    })
    .to_string()
}

fn frame_for(scenario: Scenario, rng: &mut impl Rng) -> String {
    match scenario {
        Scenario::Web => web_frame(rng),
        Scenario::Auth => auth_frame(rng),
        Scenario::Mixed => match rng.random_range(0..3) {
            0 => web_frame(rng),
            1 => auth_frame(rng),
            _ => json_frame(rng),
        },
    }
}

async fn send_all(
    target: &str,
    transport: Transport,
    count: u64,
    spread: Duration,
    scenario: Scenario,
) -> anyhow::Result<()> {
    let addr: SocketAddr = tokio::net::lookup_host(target)
        .await?
        .next()
        .ok_or_else(|| anyhow::anyhow!("cannot resolve {target}"))?;
    let gap = if count > 1 {
        spread / (count as u32)
    } else {
        Duration::ZERO
    };
    let mut rng = rand::rng();

    match transport {
        Transport::Udp => {
            let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
            for i in 0..count {
                let frame = frame_for(scenario, &mut rng);
                socket.send_to(frame.as_bytes(), addr).await?;
                if i + 1 < count {
                    tokio::time::sleep(gap).await;
                }
            }
        }
        Transport::Tcp => {
            let mut stream = tokio::net::TcpStream::connect(addr).await?;
            for i in 0..count {
                let frame = frame_for(scenario, &mut rng);
                stream.write_all(frame.as_bytes()).await?;
                stream.write_all(b"\n").await?;
                if i + 1 < count {
                    tokio::time::sleep(gap).await;
                }
            }
            stream.flush().await?;
        }
    }
    Ok(())
}

/// Exit codes: 0 success, 1 validation error, 2 I/O error.
#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate {
            target,
            transport,
            count,
            duration,
            scenario,
        } => {
            if count == 0 {
                eprintln!("count must be positive");
                std::process::exit(1);
            }
            let spread = match parse_duration_arg(&duration) {
                Ok(d) => d,
                Err(e) => {
                    eprintln!("{e}");
                    std::process::exit(1);
                }
            };
            match send_all(&target, transport, count, spread, scenario).await {
                Ok(()) => {
                    println!("sent {count} events to {target}");
                }
                Err(e) => {
                    eprintln!("send failed: {e}");
                    std::process::exit(2);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_arg_parsing() {
        assert_eq!(parse_duration_arg("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration_arg("5m").unwrap(), Duration::from_secs(300));
        assert!(parse_duration_arg("10").is_err());
        assert!(parse_duration_arg("xs").is_err());
    }

    #[test]
    fn frames_are_parseable_syslog() {
        let mut rng = rand::rng();
        let now = Utc::now();
        for _ in 0..20 {
            let (event, ty) = timberline::ingest::parse_payload(&web_frame(&mut rng), now);
            assert_eq!(ty, timberline::ingest::SourceType::Rfc5424);
            assert!(event.severity <= 7);

            let (_, ty) = timberline::ingest::parse_payload(&auth_frame(&mut rng), now);
            assert_eq!(ty, timberline::ingest::SourceType::Rfc3164);

            let (event, ty) = timberline::ingest::parse_payload(&json_frame(&mut rng), now);
            assert_eq!(ty, timberline::ingest::SourceType::Json);
            assert_eq!(event.app_name, "payments");
        }
    }
}
