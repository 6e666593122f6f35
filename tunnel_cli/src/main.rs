//! Client CLI for the reverse tunneling service.
//!
//! Single-command surface: expose a local port on a public subdomain,
//! with explicit process exit codes for each failure mode.

mod cli;
mod control;
mod dispatcher;
mod wsproxy;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::Cli;

const EXIT_INVALID_ARGS: i32 = 1;
const EXIT_CONNECTION_FAILED: i32 = 2;
const EXIT_AUTH_FAILED: i32 = 3;
const EXIT_SIGINT: i32 = 130;

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    let cli = Cli::parse();

    if let Err(error) = cli.validate() {
        eprintln!("error: {error}");
        return EXIT_INVALID_ARGS;
    }

    init_tracing(&cli);

    tracing::info!(port = cli.port, server = %cli.server, "starting tunnel client");

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    // The only source of `ShuttingDown` is the Ctrl+C future above, so it
    // maps to the SIGINT exit code rather than a plain success code.
    match control::run(&cli, shutdown).await {
        control::ExitReason::ShuttingDown => EXIT_SIGINT,
        control::ExitReason::AuthFailed => {
            eprintln!("error: authentication rejected by tunnel server");
            EXIT_AUTH_FAILED
        }
        control::ExitReason::ConnectFailed => {
            eprintln!("error: could not connect to tunnel server");
            EXIT_CONNECTION_FAILED
        }
    }
}

fn init_tracing(cli: &Cli) {
    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{level},tunnel_cli=debug").into()),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .try_init();
}

