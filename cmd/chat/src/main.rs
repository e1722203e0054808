//! greenbridge-chat
//!
//! ```text
//! greenbridge-chat [--port N] [--bind ADDR] [--keepalive SECS]
//! ```
//!
//! Environment (`GB_PORT`, `GB_BIND`, ...) is read first; flags override it.
//! `GB_LOG` / `RUST_LOG` set the log filter.

use std::process::ExitCode;
use std::time::Duration;

use greenbridge::{logging, serve_chat, ChatConfig, RuntimeConfig};
use nix::sys::signal::{self, SigHandler, Signal};
use tracing::{error, info, warn};

fn usage() {
    eprintln!("usage: greenbridge-chat [--port N] [--bind ADDR] [--keepalive SECS]");
}

fn main() -> ExitCode {
    logging::init();

    // Phase 1: environment
    let mut chat = ChatConfig::from_env();
    let runtime = RuntimeConfig::from_env();

    // Phase 2: CLI flags override env vars
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                match args.get(i).and_then(|s| s.parse().ok()) {
                    Some(p) => chat.port = p,
                    None => warn!("--port expects a number"),
                }
            }
            "--bind" | "-b" => {
                i += 1;
                if let Some(b) = args.get(i) {
                    chat.bind = b.clone();
                }
            }
            "--keepalive" => {
                i += 1;
                if let Some(s) = args.get(i).and_then(|s| s.parse().ok()) {
                    chat.keepalive = Duration::from_secs(s);
                }
            }
            "--help" | "-h" => {
                usage();
                return ExitCode::SUCCESS;
            }
            other => {
                eprintln!("greenbridge-chat: unknown argument {}", other);
                usage();
                return ExitCode::FAILURE;
            }
        }
        i += 1;
    }

    // Writes to a peer that went away must fail with EPIPE, not kill us
    if let Err(err) = unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
        warn!(%err, "cannot ignore SIGPIPE");
    }

    info!(
        addr = %chat.addr(),
        channel = %chat.channel,
        keepalive = ?chat.keepalive,
        stack = runtime.stack_size,
        "starting"
    );

    match serve_chat(chat, runtime) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "server failed");
            ExitCode::FAILURE
        }
    }
}
