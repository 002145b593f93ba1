//! svcmsg daemon - hosts the reference services and offers a small client CLI.
//!
//! `svcmsg serve` publishes `echo` and `queue` in the namespace and prints
//! `SVCMSG_ADDR=<addr>` on stdout once it is listening. `svcmsg call` sends
//! one PUTGET and prints the reply; `svcmsg list` dumps the namespace.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use svcmsg_core::services::{EchoService, QueueService};
use svcmsg_core::{
    ConnectOptions, Connection, Namespace, NamespacePath, ReleasePolicy, Server, ServerConfig,
    ServiceConfig, ServiceFlags, TimeoutPolicy,
};
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "svcmsg")]
#[command(about = "Local IPC substrate: service host and client")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Namespace database (defaults to the per-user runtime directory)
    #[arg(long, global = true)]
    namespace: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host the echo and queue services until interrupted
    Serve(ServeArgs),
    /// Send one PUTGET to a service and print the reply
    Call(CallArgs),
    /// List published services
    List,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Dispatch worker count
    #[arg(short, long, default_value = "4")]
    workers: usize,

    /// Publish services under this domain prefix
    #[arg(long)]
    domain: Option<String>,

    /// Items the queue service holds before PUTs fail
    #[arg(long, default_value = "1024")]
    queue_capacity: usize,
}

#[derive(Args, Debug)]
struct CallArgs {
    /// Service name
    service: String,

    /// Payload sent as the PUTGET body
    payload: String,

    /// Service instance
    #[arg(short, long)]
    instance: Option<String>,

    /// Give up after this many milliseconds (0 = wait forever)
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    /// Largest reply accepted, in bytes
    #[arg(long, default_value = "65536")]
    capacity: usize,
}

fn namespace_path(namespace: Option<PathBuf>) -> NamespacePath {
    match namespace {
        Some(path) => NamespacePath::Absolute(path),
        None => NamespacePath::Default,
    }
}

fn init_logging(debug: bool) {
    let builder = FmtSubscriber::builder()
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact();

    // RUST_LOG wins over --debug when set.
    if std::env::var_os("RUST_LOG").is_some() {
        builder.with_env_filter(EnvFilter::from_default_env()).init();
    } else {
        let log_level = if debug { Level::DEBUG } else { Level::INFO };
        builder.with_max_level(log_level).init();
    }
}

async fn serve(args: ServeArgs, namespace: NamespacePath) -> Result<()> {
    let mut config = ServerConfig::default()
        .dispatch_threads(args.workers)
        .namespace(namespace);
    let mut flags = ServiceFlags::empty();
    if let Some(domain) = args.domain {
        config = config.domain(domain);
        flags |= ServiceFlags::RELATIVE_PATH;
    }

    let mut server = Server::new(config);
    server.register(
        ServiceConfig::new("echo")
            .capabilities("put get putget")
            .flags(flags),
        EchoService,
    )?;
    server.register(
        ServiceConfig::new("queue")
            .capabilities("put get putget notify")
            .min_len(1)
            .release(ReleasePolicy::Immediate)
            .flags(flags),
        QueueService::new(args.queue_capacity),
    )?;

    let mut handle = server.start().await.context("Failed to start server")?;

    // Print the address for supervisors to read (intentional stdout)
    println!("SVCMSG_ADDR={}", handle.addr());
    info!("svcmsg serving on {}", handle.addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    handle.shutdown();
    handle.wait().await;
    Ok(())
}

async fn call(args: CallArgs, namespace: NamespacePath) -> Result<()> {
    let timeout = match args.timeout_ms {
        0 => TimeoutPolicy::default(),
        ms => TimeoutPolicy::new(Duration::from_millis(ms)),
    };
    let options = ConnectOptions::default()
        .namespace(namespace)
        .timeout(timeout);

    let conn = Connection::open(&args.service, args.instance.as_deref(), options)
        .await
        .with_context(|| format!("Failed to open service '{}'", args.service))?;
    let result = conn
        .putget(Bytes::from(args.payload.into_bytes()), args.capacity)
        .await;
    if let Err(e) = conn.close().await {
        warn!("Close failed: {}", e);
    }

    let response = result?;
    if response.truncated {
        warn!("Reply truncated to {} bytes", args.capacity);
    }
    println!("{}", String::from_utf8_lossy(&response.payload));
    Ok(())
}

fn list(namespace: NamespacePath) -> Result<()> {
    let Some(ns) = Namespace::open_path(&namespace)? else {
        bail!("Namespace is disabled");
    };
    let pruned = ns.cleanup_stale()?;
    if pruned > 0 {
        info!("Pruned {} stale entries", pruned);
    }
    let entries = ns.list()?;
    if entries.is_empty() {
        info!("No services published in {}", ns.path().display());
        return Ok(());
    }
    for entry in entries {
        println!(
            "{}\t{}\t{}\tpid={}\t{}",
            entry.name, entry.instance, entry.addr, entry.pid, entry.capabilities
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let namespace = namespace_path(cli.namespace);
    match cli.command {
        Command::Serve(args) => serve(args, namespace).await,
        Command::Call(args) => call(args, namespace).await,
        Command::List => list(namespace),
    }
}
