// CLI entry point for the hubcast controller.
//
// Connects to a relay as an ordinary peer (arriving first puts it in slot 1,
// which makes it the controller), then sends a fixed payload at a fixed
// period until interrupted. The relay fans every byte out to all other
// connected peers.
//
// Usage:
//   controller <HOST> <PORT> [OPTIONS]
//     --period <SECS>      Seconds between payloads (default: 2)
//     --message <TEXT>     Payload to send (default: ping)

use std::io::Write;
use std::net::Shutdown;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use hubcast_relay::client::connect;

const DEFAULT_PERIOD_SECS: u64 = 2;
const DEFAULT_MESSAGE: &str = "ping";

struct ControllerArgs {
    host: String,
    port: String,
    period: Duration,
    message: String,
}

fn main() {
    init_tracing();
    let args = parse_args();

    let mut stream = match connect(&args.host, &args.port) {
        Ok(stream) => stream,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    info!("connected to relay at {}:{}", args.host, args.port);

    let running = Arc::new(AtomicBool::new(true));
    let running_handler = running.clone();
    // The handler owns its own clone of the stream; shutting that down
    // unblocks any in-flight send and the loop exits on the flag.
    let shutdown_stream = match stream.try_clone() {
        Ok(clone) => clone,
        Err(e) => {
            error!("cannot clone connection for the signal handler: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = ctrlc::set_handler(move || {
        running_handler.store(false, Ordering::SeqCst);
        let _ = shutdown_stream.shutdown(Shutdown::Both);
    }) {
        error!("cannot install signal handler: {e}");
        std::process::exit(1);
    }

    while running.load(Ordering::SeqCst) {
        match stream.write(args.message.as_bytes()) {
            Ok(count) => info!("sent {count} bytes"),
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    error!("send failed, relay gone: {e}");
                    std::process::exit(1);
                }
                break;
            }
        }
        sleep_interruptibly(&running, args.period);
    }

    info!("interrupt received, closing connection");
    let _ = stream.shutdown(Shutdown::Both);
}

/// Route `RUST_LOG`-filtered diagnostics to stderr, `info` by default.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Sleep for `period` in short steps so an interrupt is noticed promptly.
fn sleep_interruptibly(running: &AtomicBool, period: Duration) {
    let step = Duration::from_millis(100);
    let mut remaining = period;
    while running.load(Ordering::SeqCst) && !remaining.is_zero() {
        let slice = remaining.min(step);
        std::thread::sleep(slice);
        remaining -= slice;
    }
}

fn parse_args() -> ControllerArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut host = None;
    let mut port = None;
    let mut period = Duration::from_secs(DEFAULT_PERIOD_SECS);
    let mut message = DEFAULT_MESSAGE.to_string();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--period" => {
                i += 1;
                let secs: u64 = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--period requires a number of seconds");
                    std::process::exit(1);
                });
                period = Duration::from_secs(secs);
            }
            "--message" => {
                i += 1;
                message = args.get(i).cloned().unwrap_or_else(|| {
                    eprintln!("--message requires a value");
                    std::process::exit(1);
                });
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other if other.starts_with("--") => {
                eprintln!("Unknown option: {other}");
                print_usage();
                std::process::exit(1);
            }
            other if host.is_none() => host = Some(other.to_string()),
            other if port.is_none() => port = Some(other.to_string()),
            other => {
                eprintln!("Unexpected argument: {other}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    match (host, port) {
        (Some(host), Some(port)) => ControllerArgs {
            host,
            port,
            period,
            message,
        },
        _ => {
            eprintln!("host and port are required");
            print_usage();
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    println!("Usage: controller <HOST> <PORT> [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --period <SECS>      Seconds between payloads (default: 2)");
    println!("  --message <TEXT>     Payload to send (default: ping)");
    println!("  --help, -h           Show this help");
}
