//! strand CLI entry point.
//!
//! Usage:
//!   strand <job> [args...]        # run a job on an embedded engine
//!   strand serve [--root=DIR]     # serve jobs on <root>/.engine.sock
//!   strand proxy [--root=DIR]     # front the local socket with a broker

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use strand_client::Client;
use strand_engine::{proxy, Connector, Engine, EngineError, PipeHub, SocketConnector, TcpConnector};

/// Environment variable naming the remote broker (host:port).
const BROKER_ADDR_VAR: &str = "STRAND_BROKER_ADDR";

fn main() -> ExitCode {
    // Initialize tracing (respects RUST_LOG env var)
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        None | Some("--help" | "-h") => {
            print_help();
            Ok(ExitCode::SUCCESS)
        }

        Some("--version" | "-V") => {
            println!("strand {}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }

        Some("serve") => run_serve(&args[2..]),

        Some("proxy") => run_proxy(&args[2..]),

        Some(name) if !name.starts_with('-') => run_job(name, &args[2..]),

        Some(unknown) => {
            eprintln!("Unknown option: {unknown}");
            eprintln!("Run 'strand --help' for usage.");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn print_help() {
    println!(
        r#"strand v{}

Usage:
  strand <job> [args...]        Run a job on an embedded engine
  strand serve [OPTIONS]        Serve jobs on <root>/.engine.sock
  strand proxy [OPTIONS]        Relay the local socket to ${BROKER_ADDR_VAR}

Options:
  --root=<dir>                  Engine root directory (default: ".")
  -h, --help                    Show this help
  -V, --version                 Show version

Examples:
  strand exec echo hello        # run `echo hello` through the engine
  strand serve --root=/var/lib/strand
  {BROKER_ADDR_VAR}=broker:6379 strand proxy
"#,
        env!("CARGO_PKG_VERSION")
    );
}

/// Parse `--root=DIR` out of subcommand options; defaults to ".".
fn parse_root(opts: &[String]) -> Result<PathBuf> {
    let mut root = PathBuf::from(".");
    for opt in opts {
        if let Some(dir) = opt.strip_prefix("--root=") {
            root = PathBuf::from(dir);
        } else {
            anyhow::bail!("unknown option: {opt}");
        }
    }
    Ok(root)
}

/// Cancel the returned token on SIGINT or SIGTERM. Must run inside the
/// runtime; the serving loops react to the token, not to signals.
fn install_signal_handlers() -> Result<CancellationToken> {
    use tokio::signal::unix::{signal, SignalKind};

    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("caught SIGTERM, closing listener"),
            _ = sigint.recv() => tracing::info!("caught SIGINT, closing listener"),
        }
        cancel.cancel();
    });
    Ok(token)
}

/// Run one job on an in-process engine over a pipe hub, with the job's
/// stdout/stderr streams drained to the terminal.
fn run_job(name: &str, args: &[String]) -> Result<ExitCode> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let engine = Arc::new(Engine::new("."));
        let hub = Arc::new(PipeHub::new());
        let shutdown = CancellationToken::new();

        let server = {
            let engine = engine.clone();
            let connector: Arc<dyn Connector> = hub.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.serve(connector, shutdown).await {
                    tracing::error!("engine stopped serving: {e}");
                }
            })
        };

        let client = Client::new(hub);
        let mut job = client.new_job(name, args.to_vec());
        job.streams()
            .write_to(tokio::io::stdout(), "stdout")
            .context("attaching stdout drain")?;
        job.streams()
            .write_to(tokio::io::stderr(), "stderr")
            .context("attaching stderr drain")?;

        job.start().await.context("starting job")?;
        let result = job.wait().await;
        job.streams()
            .shutdown()
            .await
            .context("shutting down job streams")?;

        shutdown.cancel();
        let _ = server.await;
        engine.cleanup();

        match result {
            Ok(()) => Ok(ExitCode::SUCCESS),
            Err(e) => {
                eprintln!("Error running job '{name}': {e}");
                Ok(ExitCode::FAILURE)
            }
        }
    })
}

/// Serve jobs on the engine socket until a signal arrives.
fn run_serve(opts: &[String]) -> Result<ExitCode> {
    let root = parse_root(opts)?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let engine = Arc::new(Engine::new(&root));
        let shutdown = install_signal_handlers()?;

        let result = engine.clone().listen_and_serve(shutdown).await;
        engine.cleanup();
        result.context("serving")?;
        Ok(ExitCode::SUCCESS)
    })
}

/// Front the local engine socket with the remote broker named by
/// `STRAND_BROKER_ADDR`, relaying raw bytes both ways.
fn run_proxy(opts: &[String]) -> Result<ExitCode> {
    let root = parse_root(opts)?;
    let addr = env::var(BROKER_ADDR_VAR)
        .ok()
        .filter(|addr| !addr.is_empty())
        .with_context(|| format!("broker address not set (export {BROKER_ADDR_VAR}=host:port)"))?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let shutdown = install_signal_handlers()?;
        let sock_path = root.join(".engine.sock");
        let frontend = Arc::new(SocketConnector::listen(&sock_path).await?);
        let backend = Arc::new(TcpConnector::dial(addr.clone()));
        tracing::info!(socket = %sock_path.display(), broker = %addr, "proxying");

        {
            let frontend = frontend.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                let _ = frontend.close().await;
            });
        }

        let result = proxy(frontend, backend).await;
        let _ = std::fs::remove_file(&sock_path);
        match result {
            // A deliberate close is a clean shutdown, not a failure.
            Err(EngineError::ConnectorClosed) | Ok(()) => Ok(ExitCode::SUCCESS),
            Err(e) => Err(e.into()),
        }
    })
}
