// CLI entry point for the hubcast client.
//
// Connects to a relay and prints whatever the controller fans out, one line
// per received chunk. EOF from the relay ends the process cleanly; Ctrl+C
// shuts the connection down first and then does the same.
//
// Usage:
//   client <HOST> <PORT>

use std::io::Read;
use std::net::Shutdown;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use hubcast_relay::MESSAGE_BUFFER_SIZE;
use hubcast_relay::client::connect;

fn main() {
    init_tracing();
    let (host, port) = parse_args();

    let mut stream = match connect(&host, &port) {
        Ok(stream) => stream,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    info!("connected to relay at {host}:{port}");

    let running = Arc::new(AtomicBool::new(true));
    let running_handler = running.clone();
    // Shutting down the handler's clone makes the blocked read below return
    // zero bytes, which ends the loop.
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

    let mut buf = [0u8; MESSAGE_BUFFER_SIZE];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => {
                if running.load(Ordering::SeqCst) {
                    info!("relay closed the connection");
                } else {
                    info!("interrupt received");
                }
                break;
            }
            Ok(count) => {
                println!(
                    "received {count} bytes: {}",
                    String::from_utf8_lossy(&buf[..count])
                );
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    error!("read failed: {e}");
                    std::process::exit(1);
                }
                break;
            }
        }
    }

    info!("closing connection");
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

fn parse_args() -> (String, String) {
    let args: Vec<String> = std::env::args().collect();
    let mut host = None;
    let mut port = None;
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
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
        (Some(host), Some(port)) => (host, port),
        _ => {
            eprintln!("host and port are required");
            print_usage();
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    println!("Usage: client <HOST> <PORT>");
    println!();
    println!("Options:");
    println!("  --help, -h           Show this help");
}
