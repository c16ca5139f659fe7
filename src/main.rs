//! proxy-nlb
//!
//! Protocol-aware network load balancer. Inspects the first bytes of each
//! connection, routes it to the least-loaded healthy module for that
//! protocol, and exposes an admin/control-plane API.
//!
//! # Architecture Overview
//!
//! ```text
//!   first bytes ──▶ inspector ──▶ rate limiter ──▶ blue/green split ──▶ router ──▶ module
//!                                                                          ▲
//!   modules ──▶ admin /v1 ──▶ control plane ──▶ registry, client pool ─────┘
//!                                          └──▶ autoscaler (metric samples)
//!
//!   background: autoscaler loop, client health loop, rollout steppers,
//!               config watcher; all supervised and joined on shutdown
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

#[derive(Parser)]
#[command(name = "proxy-nlb", version, about = "Protocol-aware network load balancer")]
struct Args {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match proxy_nlb::lifecycle::run(args.config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Logging may not be installed yet.
            eprintln!("proxy-nlb: {e}");
            tracing::error!(error = %e, "Fatal startup error");
            ExitCode::FAILURE
        }
    }
}
