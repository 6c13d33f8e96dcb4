mod api;
mod capture;
mod config;
mod proxy;
mod record;
mod retention;
mod router;
mod store;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{SharedConfig, default_config_path, load_config};
use crate::proxy::ProxyService;
use crate::record::now_millis;
use crate::store::{AsyncSink, BlobStore, DetachingSink, ListFilter, LogStore, RecordSink};

#[derive(Parser, Debug)]
#[command(name = "prismcat")]
#[command(about = "Logging reverse proxy for LLM HTTP APIs", long_about = None)]
struct Cli {
    /// Config file path; defaults to ~/.prismcat/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the proxy server (default when no subcommand is given)
    Serve {
        /// Override the configured listen port
        #[arg(long)]
        port: Option<u16>,
    },
    /// List recent request records from the log database
    Logs {
        #[arg(long, default_value_t = 50)]
        limit: u64,
        /// Only records routed to this upstream
        #[arg(long)]
        upstream: Option<String>,
        /// Only records that carry an error
        #[arg(long)]
        errors_only: bool,
    },
    /// Print aggregate request statistics
    Stats {
        /// Restrict to the last N hours
        #[arg(long)]
        since_hours: Option<u64>,
    },
    /// Delete records older than the given number of days
    Purge {
        #[arg(long)]
        older_than_days: u32,
    },
}

fn init_tracing() {
    // Default to info logs unless the user sets RUST_LOG.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => run_server(&config_path, port).await,
        Command::Logs {
            limit,
            upstream,
            errors_only,
        } => cmd_logs(&config_path, limit, upstream, errors_only).await,
        Command::Stats { since_hours } => cmd_stats(&config_path, since_hours).await,
        Command::Purge { older_than_days } => cmd_purge(&config_path, older_than_days).await,
    }
}

async fn run_server(config_path: &Path, port_override: Option<u16>) -> Result<()> {
    let mut cfg = load_config(config_path).await?;
    if let Some(port) = port_override {
        cfg.server.port = port;
    }
    if cfg.upstreams.is_empty() {
        warn!(
            "no upstreams configured; every proxy request will fail (config: {})",
            config_path.display()
        );
    }

    let db = Arc::new(LogStore::open(&cfg.storage.db_path)?);
    let blobs = Arc::new(BlobStore::new(&cfg.storage.blob_dir)?);
    let detaching = DetachingSink::new(
        db.clone(),
        blobs.clone(),
        cfg.logging.detach_threshold(),
        cfg.logging.body_preview_bytes,
    );
    let sink = Arc::new(AsyncSink::new(detaching, cfg.storage.queue_size));

    let addr = format!("{}:{}", cfg.server.listen, cfg.server.port);
    let shared = Arc::new(SharedConfig::new(cfg));

    let (stop_tx, stop_rx) = watch::channel(false);
    let retention = retention::spawn(
        db.clone(),
        blobs.clone(),
        shared.clone(),
        config_path.to_path_buf(),
        stop_rx,
    );

    let client = reqwest::Client::builder()
        .build()
        .context("failed to build outbound http client")?;
    let service = ProxyService::new(client, shared, sink.clone());
    let app = proxy::router(
        service,
        api::ConsoleState {
            db: db.clone(),
            blobs,
        },
    );

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("prismcat listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Teardown order matters: stop the retention loop, then drain the record
    // queue; the queue worker closes the detaching sink and the database.
    let _ = stop_tx.send(true);
    let _ = retention.await;
    let closer = sink.clone();
    tokio::task::spawn_blocking(move || closer.close())
        .await
        .context("store close task failed")??;
    info!(
        "shutdown complete ({} records dropped under back-pressure)",
        sink.dropped()
    );
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        warn!("failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received, draining");
}

async fn open_store(config_path: &Path) -> Result<LogStore> {
    let cfg = load_config(config_path).await?;
    Ok(LogStore::open(&cfg.storage.db_path)?)
}

async fn cmd_logs(
    config_path: &Path,
    limit: u64,
    upstream: Option<String>,
    errors_only: bool,
) -> Result<()> {
    let db = open_store(config_path).await?;
    let filter = ListFilter {
        limit,
        upstream,
        has_error: errors_only.then_some(true),
        ..Default::default()
    };
    let (rows, total) = db.list(&filter)?;
    println!("{total} matching records");
    for row in rows {
        let status = if row.status_code == 0 && !row.error.is_empty() {
            "ERR".to_string()
        } else {
            row.status_code.to_string()
        };
        println!(
            "{}  {:>4}  {:6} {:12} {}  {}ms{}",
            row.created_at,
            status,
            row.method,
            row.upstream,
            row.path,
            row.latency_ms,
            if row.error.is_empty() {
                String::new()
            } else {
                format!("  ({})", row.error)
            }
        );
    }
    Ok(())
}

async fn cmd_stats(config_path: &Path, since_hours: Option<u64>) -> Result<()> {
    let db = open_store(config_path).await?;
    let since = since_hours.map(|h| now_millis() - (h as i64) * 60 * 60 * 1000);
    let stats = db.stats(since)?;
    println!("total:      {}", stats.total);
    println!("success:    {}", stats.success);
    println!("errors:     {}", stats.errors);
    println!("streaming:  {}", stats.streaming);
    println!("avg latency: {:.1}ms", stats.avg_latency_ms);
    if !stats.by_upstream.is_empty() {
        println!("by upstream:");
        let mut upstreams: Vec<_> = stats.by_upstream.iter().collect();
        upstreams.sort_by(|a, b| b.1.cmp(a.1));
        for (name, count) in upstreams {
            let name = if name.is_empty() { "(unrouted)" } else { name };
            println!("  {name:20} {count}");
        }
    }
    if !stats.by_status.is_empty() {
        println!("by status:");
        let mut statuses: Vec<_> = stats.by_status.iter().collect();
        statuses.sort();
        for (status, count) in statuses {
            println!("  {status:>4} {count}");
        }
    }
    Ok(())
}

async fn cmd_purge(config_path: &Path, older_than_days: u32) -> Result<()> {
    let db = open_store(config_path).await?;
    let cutoff = now_millis() - i64::from(older_than_days) * 24 * 60 * 60 * 1000;
    let n = db.delete_before(cutoff)?;
    println!("deleted {n} records older than {older_than_days} day(s)");
    Ok(())
}
