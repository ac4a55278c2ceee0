//! The UDP frontend: answers from the cache when it can, forwards to
//! the TCP upstream manager otherwise, and drives the cache's expiry
//! sweep on its timer.

use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use relaydns_cache::{DnsCache, SWEEP_INTERVAL};
use relaydns_core::config::ServerConfig;
use relaydns_core::types::{StatKind, Statistics};
use relaydns_core::{Error, Result};
use relaydns_upstream::TcpUpstream;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

pub struct Forwarder {
    listen: SocketAddr,
    query_limit: usize,
    cache: Option<Arc<DnsCache>>,
    upstream: Arc<TcpUpstream>,
    stats: Arc<dyn Statistics>,
}

impl Forwarder {
    pub fn new(
        cfg: &ServerConfig,
        cache: Option<Arc<DnsCache>>,
        upstream: Arc<TcpUpstream>,
        stats: Arc<dyn Statistics>,
    ) -> Result<Self> {
        let listen = cfg
            .listen
            .parse()
            .map_err(|_| Error::Config(format!("invalid listen address: {}", cfg.listen)))?;
        Ok(Self {
            listen,
            query_limit: cfg.query_limit,
            cache,
            upstream,
            stats,
        })
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let socket = Arc::new(UdpSocket::bind(self.listen).await?);
        info!("dns forwarder listening on {} (udp)", self.listen);

        if let Some(cache) = &self.cache {
            if !cache.ignore_ttl() {
                let cache = cache.clone();
                let mut rx = shutdown.clone();
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
                    loop {
                        tokio::select! {
                            _ = interval.tick() => cache.sweep(),
                            changed = rx.changed() => {
                                if changed.is_err() || *rx.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.query_limit));
        let mut buf = vec![0u8; 4096];
        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    let (len, src) = result?;
                    let data = buf[..len].to_vec();
                    let permit = match semaphore.clone().try_acquire_owned() {
                        Ok(p) => p,
                        Err(_) => {
                            warn!("query limit reached, dropping query from {src}");
                            continue;
                        }
                    };
                    let socket = socket.clone();
                    let cache = self.cache.clone();
                    let upstream = self.upstream.clone();
                    let stats = self.stats.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_query(&data, src, &socket, cache.as_deref(), &upstream, &*stats)
                                .await
                        {
                            debug!("query from {src} failed: {e}");
                        }
                        drop(permit);
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("dns forwarder shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

async fn handle_query(
    data: &[u8],
    src: SocketAddr,
    socket: &UdpSocket,
    cache: Option<&DnsCache>,
    upstream: &TcpUpstream,
    stats: &dyn Statistics,
) -> anyhow::Result<()> {
    let request = Message::from_bytes(data)?;
    let domain = request
        .queries()
        .first()
        .map(|q| q.name().to_ascii().trim_end_matches('.').to_lowercase())
        .unwrap_or_default();

    if let Some(cache) = cache {
        match cache.fetch(&request) {
            Ok(Some(response)) => {
                socket.send_to(&response, src).await?;
                info!(domain = %domain, marker = "C", "answered from cache");
                stats.record(StatKind::Cache, &domain);
                return Ok(());
            }
            Ok(None) => {}
            Err(e) => debug!(domain = %domain, "cache fetch failed: {e}"),
        }
    }

    match upstream.query(data.to_vec(), domain.clone()).await {
        Some(response) => {
            socket.send_to(&response, src).await?;
        }
        // The upstream sweep already reported the refusal; the client
        // is left to retry.
        None => debug!(domain = %domain, "no upstream answer"),
    }
    Ok(())
}
