//! # Kestrun CLI Entry Point
//!
//! Main binary for the Kestrun script host.
//!
//! ## Usage
//!
//! ```bash
//! # Serve the routes described by a manifest
//! kestrun serve kestrun.json
//!
//! # Override the bind address and pool size
//! kestrun serve kestrun.json -b 0.0.0.0:8080 --max-runspaces 16
//!
//! # Compile every script without serving (CI friendly, exits 1 on errors)
//! kestrun check kestrun.json --json
//! ```
//!
//! Logs go to stderr. The level defaults to `info` and follows `RUST_LOG`.

use anyhow::Result;
use argh::FromArgs;
use kestrun_cli::Overrides;
use kestrun_server::HttpServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(FromArgs)]
/// Kestrun - embeddable HTTP script host
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Check(CheckArgs),
}

/// Arguments for serving a manifest.
///
/// # Example
///
/// ```bash
/// kestrun serve kestrun.json -b 127.0.0.1:5000 --min-runspaces 2
/// ```
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// serve the host described by a manifest
struct ServeArgs {
    /// path to the JSON manifest
    #[argh(positional)]
    manifest: PathBuf,

    /// address to bind, overrides host.bind
    #[argh(option, short = 'b')]
    bind: Option<SocketAddr>,

    /// runspaces created at startup, overrides host.min_runspaces
    #[argh(option, long = "min-runspaces")]
    min_runspaces: Option<usize>,

    /// upper bound on runspaces, overrides host.max_runspaces
    #[argh(option, long = "max-runspaces")]
    max_runspaces: Option<usize>,

    /// per-request script time limit in milliseconds
    #[argh(option, long = "max-execution-time-ms")]
    max_execution_time_ms: Option<u64>,

    /// how long a request waits for a runspace before failing with 503
    #[argh(option, long = "acquire-timeout-ms")]
    acquire_timeout_ms: Option<u64>,
}

impl ServeArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            bind: self.bind,
            min_runspaces: self.min_runspaces,
            max_runspaces: self.max_runspaces,
            execution_timeout_ms: self.max_execution_time_ms,
            acquire_timeout_ms: self.acquire_timeout_ms,
        }
    }
}

#[derive(FromArgs)]
#[argh(subcommand, name = "check")]
/// compile every script in a manifest and report diagnostics
struct CheckArgs {
    /// path to the JSON manifest
    #[argh(positional)]
    manifest: PathBuf,

    /// print the report as JSON on stdout
    #[argh(switch)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Check(args) => run_check(args),
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    tracing::info!("Loading manifest {}", args.manifest.display());
    let mut host = kestrun_cli::build_host(&args.manifest, &args.overrides())?;
    host.start().await?;

    let bind = host.config().bind;
    let host = Arc::new(host);
    let shutdown = CancellationToken::new();

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        tracing::info!("Shutdown requested");
        signal.cancel();
    });

    HttpServer::new(Arc::clone(&host)).run(bind, shutdown).await?;
    host.shutdown();
    Ok(())
}

fn run_check(args: CheckArgs) -> Result<()> {
    let report = kestrun_cli::check(&args.manifest)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report.to_json())?);
    } else if let Some(error) = &report.error {
        eprintln!("{}: {}", args.manifest.display(), error);
        for diagnostic in &report.diagnostics {
            eprintln!("  {}", diagnostic);
        }
    } else {
        println!("{}: {} route(s) OK", args.manifest.display(), report.routes);
    }

    if !report.is_ok() {
        std::process::exit(1);
    }
    Ok(())
}
