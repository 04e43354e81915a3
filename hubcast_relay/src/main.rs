// CLI entry point for the hubcast relay daemon.
//
// Starts the standalone relay that controller and client processes connect
// to. Slot assignment decides the roles: the first peer in becomes the
// controller and its payloads fan out to everyone else. See `server.rs` for
// the loop architecture.
//
// Usage:
//   relayd [OPTIONS]
//     --addr <ADDR>        Bind address (default: 0.0.0.0)
//     --port <PORT>        Listen port (default: 8888)
//     --max-peers <N>      Peer limit (default: platform descriptor limit)
//     --config <FILE>      JSON config file; later arguments win, so put
//                          --config first when combining it with flags

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use hubcast_relay::server::{RelayConfig, start_relay};

fn main() {
    init_tracing();
    let config = parse_args();

    let (handle, addr) = match start_relay(config) {
        Ok(result) => result,
        Err(e) => {
            error!("failed to start relay: {e}");
            std::process::exit(1);
        }
    };

    info!("relay ready on {addr}, press Ctrl+C to stop");

    let running = Arc::new(AtomicBool::new(true));
    let running_handler = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        running_handler.store(false, Ordering::SeqCst);
    }) {
        error!("cannot install signal handler: {e}");
        handle.stop();
        std::process::exit(1);
    }

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    info!("interrupt received, shutting down");
    handle.stop();
}

/// Route `RUST_LOG`-filtered diagnostics to stderr, `info` by default.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Parse command-line arguments into a `RelayConfig`. Plain
/// `std::env::args()` matching, no CLI framework.
fn parse_args() -> RelayConfig {
    let mut config = RelayConfig::default();
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let path = args.get(i).cloned().unwrap_or_else(|| {
                    eprintln!("--config requires a file path");
                    std::process::exit(1);
                });
                config = RelayConfig::from_json_file(Path::new(&path)).unwrap_or_else(|e| {
                    eprintln!("{e}");
                    std::process::exit(1);
                });
            }
            "--addr" => {
                i += 1;
                config.addr = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--addr requires an IP address");
                    std::process::exit(1);
                });
            }
            "--port" => {
                i += 1;
                config.port = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--port requires a valid port number");
                    std::process::exit(1);
                });
            }
            "--max-peers" => {
                i += 1;
                let peers: usize = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--max-peers requires a valid number");
                    std::process::exit(1);
                });
                config.max_peers = Some(peers);
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

fn print_usage() {
    println!("Usage: relayd [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --addr <ADDR>        Bind address (default: 0.0.0.0)");
    println!("  --port <PORT>        Listen port (default: 8888)");
    println!("  --max-peers <N>      Peer limit (default: platform descriptor limit)");
    println!("  --config <FILE>      JSON config file; later arguments win");
    println!("  --help, -h           Show this help");
}
