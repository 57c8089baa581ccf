//! MountProxy - Main entry point
//!
//! A path-mounted HTTP reverse proxy with HTML link rewriting

use anyhow::Result;
use clap::Parser;
use mountproxy::{ProxyConfig, ProxyServer, RuleStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// MountProxy - A path-mounted HTTP reverse proxy
#[derive(Parser, Debug)]
#[command(name = "mountproxy")]
#[command(author = "MountProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "A path-mounted HTTP reverse proxy with HTML link rewriting")]
struct Args {
    /// HTTP port to listen on
    #[arg(long, env = "HTTP_PORT", default_value = "8080")]
    http_port: u16,

    /// Rule file path
    #[arg(long, env = "RULES_PATH", default_value = "./data/rules.json")]
    rules_path: PathBuf,

    /// Seconds to wait for upstream response headers (0 waits forever)
    #[arg(long, env = "UPSTREAM_TIMEOUT_SECS", default_value = "30")]
    upstream_timeout_secs: u64,

    /// Largest HTML body buffered for link rewriting
    #[arg(long, env = "MAX_REWRITE_BYTES", default_value = "10485760")]
    max_rewrite_bytes: usize,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting MountProxy v1.0.0");

    let rule_store = Arc::new(RuleStore::open(&args.rules_path)?);
    info!(
        "Loaded {} rule(s) from {}",
        rule_store.list_rules().len(),
        args.rules_path.display()
    );

    let config = ProxyConfig {
        http_port: args.http_port,
        upstream_timeout: (args.upstream_timeout_secs > 0)
            .then(|| Duration::from_secs(args.upstream_timeout_secs)),
        max_rewrite_bytes: args.max_rewrite_bytes,
    };

    let server = Arc::new(ProxyServer::new(config, rule_store));

    match server.config().upstream_timeout {
        Some(limit) => info!("Upstream timeout: {:?}", limit),
        None => info!("Upstream timeout disabled"),
    }
    info!("Service address: http://localhost:{}", args.http_port);

    server.run().await?;

    Ok(())
}
