use anyhow::Result;
use clap::Parser;
use relaydns_cache::DnsCache;
use relaydns_core::config::Config;
use relaydns_core::types::{AcceptAll, CounterStatistics, Statistics};
use relaydns_forwarder::Forwarder;
use relaydns_upstream::TcpUpstream;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "relaydns", about = "RelayDNS - a caching DNS forwarder with TCP/SOCKS5 upstreams")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/relaydns/relaydns.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)?;

    init_logging(&config.logging);

    info!(listen = %config.server.listen, "starting relaydns");

    let cache = DnsCache::open(&config.cache)?.map(Arc::new);
    match &cache {
        Some(c) => info!(entries = c.len(), "cache ready"),
        None => info!("cache disabled"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let stats: Arc<dyn Statistics> = Arc::new(CounterStatistics::new());

    let upstream = Arc::new(TcpUpstream::spawn(
        &config.upstream,
        cache.clone(),
        Arc::new(AcceptAll),
        stats.clone(),
        shutdown_rx.clone(),
    )?);

    let forwarder = Forwarder::new(&config.server, cache, upstream, stats)?;
    let rx = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = forwarder.run(rx).await {
            error!("dns forwarder error: {e}");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping services...");
    let _ = shutdown_tx.send(true);
    let _ = server.await;

    info!("relaydns stopped");
    Ok(())
}

fn init_logging(config: &relaydns_core::config::LoggingConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .init();
        }
    }
}
