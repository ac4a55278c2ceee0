//! The TCP upstream manager: one worker task multiplexing keep-alive
//! connections to every configured upstream, optionally through SOCKS5
//! proxies. Queries arrive over an mpsc intake, each in-flight
//! exchange runs as its own task in a `JoinSet`, and a five-second
//! sweep expires pending queries that no upstream answered.

use crate::socks;
use bytes::{BufMut, BytesMut};
use relaydns_cache::DnsCache;
use relaydns_core::config::UpstreamConfig;
use relaydns_core::hash::hash_key;
use relaydns_core::types::{ResponseFilter, StatKind, Statistics, Verdict};
use relaydns_core::{Error, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// No upstream answered within this window: the query is refused.
const TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SEND_TIMEOUT: Duration = Duration::from_secs(2);
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Replies longer than this are discarded along with their socket.
const MAX_REPLY: usize = 16_384;

const INTAKE_DEPTH: usize = 1024;

/// One query handed to the upstream manager. The reply channel gets
/// the first upstream answer; it is dropped on refusal.
pub struct QueryJob {
    pub message: Vec<u8>,
    pub domain: String,
    pub reply: oneshot::Sender<Vec<u8>>,
}

/// Pending queries are correlated by query id plus domain hash.
type PendingKey = (u16, u32);

struct Pending {
    message: Vec<u8>,
    domain: String,
    reply: Option<oneshot::Sender<Vec<u8>>>,
    added: Instant,
}

/// Per-connection bookkeeping; `queried` counts the queries this
/// socket has carried, which is what tells a fresh socket from a
/// reused keep-alive when a read fails.
#[derive(Clone, Copy)]
struct TcpContext {
    server_index: usize,
    last_activity: Instant,
    queried: u32,
}

struct ParkedConn {
    stream: TcpStream,
    ctx: TcpContext,
}

#[derive(Debug)]
enum ExchangeError {
    Connect,
    Proxy,
    Send,
    RecvLen,
    RecvBody,
    TooLarge,
}

struct Outcome {
    key: PendingKey,
    server_index: usize,
    domain: String,
    ctx: TcpContext,
    conn: Option<TcpStream>,
    result: std::result::Result<Vec<u8>, ExchangeError>,
}

/// Handle to a running upstream manager.
pub struct TcpUpstream {
    tx: mpsc::Sender<QueryJob>,
}

impl TcpUpstream {
    /// Resolves the configured addresses and spawns the worker task.
    pub fn spawn(
        cfg: &UpstreamConfig,
        cache: Option<Arc<DnsCache>>,
        filter: Arc<dyn ResponseFilter>,
        stats: Arc<dyn Statistics>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let servers = resolve_addrs(&cfg.servers, 53)?;
        if servers.is_empty() {
            return Err(Error::Config("no upstream servers configured".into()));
        }
        let proxies = resolve_addrs(&cfg.socks_proxies, 1080)?;

        let (tx, rx) = mpsc::channel(INTAKE_DEPTH);
        let agents = servers.iter().map(|_| Vec::new()).collect();
        let worker = Worker {
            servers,
            proxies,
            parallel: cfg.parallel,
            keep_alive: Duration::from_secs(cfg.keep_alive_secs),
            agents,
            pending: HashMap::new(),
            rr: 0,
            proxy_rr: 0,
            in_flight: JoinSet::new(),
            cache,
            filter,
            stats,
        };
        tokio::spawn(worker.run(rx, shutdown));
        Ok(Self { tx })
    }

    /// Sends a query upstream and waits for the first answer; `None`
    /// when every upstream failed or timed out.
    pub async fn query(&self, message: Vec<u8>, domain: String) -> Option<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(QueryJob {
                message,
                domain,
                reply,
            })
            .await
            .ok()?;
        rx.await.ok()
    }
}

/// `host` or `host:port` strings to socket addresses.
fn resolve_addrs(list: &[String], default_port: u16) -> Result<Vec<SocketAddr>> {
    let mut out = Vec::new();
    for s in list {
        let trimmed = s.trim();
        let addr = trimmed
            .parse::<SocketAddr>()
            .or_else(|_| format!("{trimmed}:{default_port}").parse())
            .map_err(|_| Error::Config(format!("invalid upstream address: {s}")))?;
        out.push(addr);
    }
    Ok(out)
}

struct Worker {
    servers: Vec<SocketAddr>,
    proxies: Vec<SocketAddr>,
    parallel: bool,
    keep_alive: Duration,
    /// Parked keep-alive sockets, one pool per upstream.
    agents: Vec<Vec<ParkedConn>>,
    pending: HashMap<PendingKey, Pending>,
    rr: usize,
    proxy_rr: usize,
    in_flight: JoinSet<Outcome>,
    cache: Option<Arc<DnsCache>>,
    filter: Arc<dyn ResponseFilter>,
    stats: Arc<dyn Statistics>,
}

impl Worker {
    async fn run(mut self, mut intake: mpsc::Receiver<QueryJob>, mut shutdown: watch::Receiver<bool>) {
        let mut sweep = tokio::time::interval(TIMEOUT);
        loop {
            tokio::select! {
                job = intake.recv() => match job {
                    Some(job) => self.accept(job),
                    None => break,
                },
                Some(res) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    if let Ok(outcome) = res {
                        self.handle(outcome);
                    }
                }
                _ = sweep.tick() => self.sweep(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("tcp upstream worker stopped");
    }

    fn accept(&mut self, job: QueryJob) {
        if job.message.len() < 12 {
            return;
        }
        let qid = u16::from_be_bytes([job.message[0], job.message[1]]);
        let key = (qid, hash_key(job.domain.as_bytes()));
        self.pending.insert(
            key,
            Pending {
                message: job.message,
                domain: job.domain,
                reply: Some(job.reply),
                added: Instant::now(),
            },
        );
        self.dispatch(key, None);
    }

    /// Starts one exchange per target upstream: every upstream when
    /// fanning out, otherwise the rotation's current pick or the
    /// retry's explicit index.
    fn dispatch(&mut self, key: PendingKey, single: Option<usize>) {
        let Some(p) = self.pending.get(&key) else {
            return;
        };
        let message = p.message.clone();
        let domain = p.domain.clone();

        let targets: Vec<usize> = match single {
            Some(i) => vec![i],
            None if self.parallel => (0..self.servers.len()).collect(),
            None => vec![self.rr % self.servers.len()],
        };

        for idx in targets {
            let parked = self.take_parked(idx);
            let proxy = if self.proxies.is_empty() {
                None
            } else {
                Some(self.proxies[self.proxy_rr % self.proxies.len()])
            };
            self.in_flight.spawn(exchange(
                idx,
                self.servers[idx],
                proxy,
                parked,
                message.clone(),
                key,
                domain.clone(),
            ));
        }
    }

    /// Pops the freshest parked socket for an upstream, discarding any
    /// that idled past the keep-alive ceiling.
    fn take_parked(&mut self, idx: usize) -> Option<(TcpStream, TcpContext)> {
        while let Some(p) = self.agents[idx].pop() {
            if p.ctx.last_activity.elapsed() > self.keep_alive {
                info!("existing tcp connection expired, discard");
                continue;
            }
            return Some((p.stream, p.ctx));
        }
        None
    }

    fn handle(&mut self, o: Outcome) {
        match o.result {
            Ok(body) => {
                // Park before anything can discard the reply.
                if let Some(stream) = o.conn {
                    let mut ctx = o.ctx;
                    ctx.last_activity = Instant::now();
                    self.agents[o.server_index].push(ParkedConn { stream, ctx });
                }

                match self.filter.classify(&body) {
                    Verdict::Pass => {}
                    Verdict::Filtered => {
                        info!(domain = %o.domain, "bad package, discarded");
                        self.stats.record(StatKind::Blocked, &o.domain);
                        return;
                    }
                    Verdict::Negative => {
                        info!(domain = %o.domain, "negative result, discarded");
                        self.stats.record(StatKind::Blocked, &o.domain);
                        return;
                    }
                }

                let first = match self.pending.remove(&o.key) {
                    Some(p) => {
                        if let Some(tx) = p.reply {
                            let _ = tx.send(body.clone());
                        }
                        true
                    }
                    None => false,
                };
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.add_items(&body, first) {
                        debug!(domain = %o.domain, "reply not cached: {e}");
                    }
                }
                if first {
                    info!(domain = %o.domain, marker = "T", "answered by tcp upstream");
                    self.stats.record(StatKind::Tcp, &o.domain);
                }
            }
            // A server may force-close a keep-alive socket between our
            // send and its reply; retry the same upstream once on a
            // reused socket while the query is still wanted.
            Err(ExchangeError::RecvLen)
                if o.ctx.queried > 1 && self.pending.contains_key(&o.key) =>
            {
                info!(domain = %o.domain, "tcp retrying");
                self.dispatch(o.key, Some(o.server_index));
            }
            Err(e) => {
                debug!(domain = %o.domain, "upstream exchange failed: {e:?}");
                if matches!(e, ExchangeError::Proxy | ExchangeError::Send)
                    && !self.proxies.is_empty()
                {
                    self.rr = self.rr.wrapping_add(1);
                    self.proxy_rr = self.proxy_rr.wrapping_add(1);
                }
            }
        }
    }

    /// Expires pending queries nothing answered. Repeated timeouts
    /// advance the rotation so a cold upstream stops being first pick.
    fn sweep(&mut self) {
        let now = Instant::now();
        let stats = &self.stats;
        let mut timed_out = false;
        self.pending.retain(|_, p| {
            if now.duration_since(p.added) >= TIMEOUT {
                warn!(domain = %p.domain, marker = "T", "query timed out, refused");
                stats.record(StatKind::Refused, &p.domain);
                timed_out = true;
                false
            } else {
                true
            }
        });
        if timed_out && self.proxies.is_empty() {
            self.rr = self.rr.wrapping_add(1);
        }
    }
}

/// One complete send/receive against a single upstream, run as its own
/// task. Errors report which stage failed so the worker can decide on
/// retry or rotation; the stream only comes back for parking after a
/// clean reply.
async fn exchange(
    server_index: usize,
    server: SocketAddr,
    proxy: Option<SocketAddr>,
    parked: Option<(TcpStream, TcpContext)>,
    message: Vec<u8>,
    key: PendingKey,
    domain: String,
) -> Outcome {
    let mut ctx = TcpContext {
        server_index,
        last_activity: Instant::now(),
        queried: 0,
    };

    let mut stream = match parked {
        Some((stream, parked_ctx)) => {
            ctx = parked_ctx;
            stream
        }
        None => {
            let target = proxy.unwrap_or(server);
            match timeout(CONNECT_TIMEOUT, TcpStream::connect(target)).await {
                Ok(Ok(s)) => s,
                _ => {
                    return Outcome {
                        key,
                        server_index,
                        domain,
                        ctx,
                        conn: None,
                        result: Err(ExchangeError::Connect),
                    }
                }
            }
        }
    };

    let result = run_io(&mut stream, &mut ctx, proxy.is_some(), server, &message).await;
    let conn = if result.is_ok() { Some(stream) } else { None };
    Outcome {
        key,
        server_index,
        domain,
        ctx,
        conn,
        result,
    }
}

async fn run_io(
    stream: &mut TcpStream,
    ctx: &mut TcpContext,
    proxied: bool,
    server: SocketAddr,
    message: &[u8],
) -> std::result::Result<Vec<u8>, ExchangeError> {
    if proxied && ctx.queried == 0 {
        if let Err(e) = socks::negotiate(stream, &server).await {
            warn!("cannot negotiate with tcp proxy: {e}");
            return Err(ExchangeError::Proxy);
        }
    }

    // RFC 1035 4.2.2: two-byte big-endian length prefix.
    let mut wire = BytesMut::with_capacity(message.len() + 2);
    wire.put_u16(message.len() as u16);
    wire.put_slice(message);
    match timeout(SEND_TIMEOUT, stream.write_all(&wire)).await {
        Ok(Ok(())) => {}
        _ => return Err(ExchangeError::Send),
    }
    ctx.queried += 1;
    ctx.last_activity = Instant::now();

    let mut len_buf = [0u8; 2];
    match timeout(RECV_TIMEOUT, stream.read_exact(&mut len_buf)).await {
        Ok(Ok(_)) => {}
        _ => return Err(ExchangeError::RecvLen),
    }
    let len = u16::from_be_bytes(len_buf) as usize;
    if len > MAX_REPLY {
        warn!("tcp reply of {len} bytes is too large, discarded");
        return Err(ExchangeError::TooLarge);
    }

    let mut body = vec![0u8; len];
    let mut done = 0;
    while done < len {
        match timeout(RECV_TIMEOUT, stream.read(&mut body[done..])).await {
            Ok(Ok(0)) => return Err(ExchangeError::RecvBody),
            Ok(Ok(n)) => done += n,
            _ => return Err(ExchangeError::RecvBody),
        }
    }
    ctx.last_activity = Instant::now();
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Message, MessageType, Query};
    use hickory_proto::rr::{rdata, Name, RData, Record, RecordType};
    use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
    use relaydns_core::config::CacheConfig;
    use relaydns_core::types::{AcceptAll, CounterStatistics};
    use std::str::FromStr;
    use tokio::net::TcpListener;

    fn test_config(servers: Vec<String>) -> UpstreamConfig {
        UpstreamConfig {
            servers,
            parallel: false,
            socks_proxies: Vec::new(),
            keep_alive_secs: 30,
        }
    }

    fn query_bytes(qname: &str) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(0x0703);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_str(qname).unwrap(), RecordType::A));
        msg.to_bytes().unwrap()
    }

    fn answer_for(request: &[u8], addr: [u8; 4], ttl: u32) -> Vec<u8> {
        let req = Message::from_bytes(request).unwrap();
        let mut msg = Message::new();
        msg.set_id(req.id());
        msg.set_message_type(MessageType::Response);
        let query = req.queries()[0].clone();
        let owner = query.name().clone();
        msg.add_query(query);
        msg.add_answer(Record::from_rdata(
            owner,
            ttl,
            RData::A(rdata::A::from(std::net::Ipv4Addr::from(addr))),
        ));
        msg.to_bytes().unwrap()
    }

    async fn read_request(conn: &mut TcpStream) -> Option<Vec<u8>> {
        let mut len_buf = [0u8; 2];
        conn.read_exact(&mut len_buf).await.ok()?;
        let mut body = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        conn.read_exact(&mut body).await.ok()?;
        Some(body)
    }

    async fn write_reply(conn: &mut TcpStream, reply: &[u8]) {
        let mut wire = BytesMut::with_capacity(reply.len() + 2);
        wire.put_u16(reply.len() as u16);
        wire.put_slice(reply);
        conn.write_all(&wire).await.unwrap();
    }

    fn memory_cache() -> Arc<DnsCache> {
        let cfg = CacheConfig {
            memory_only: true,
            size: 102_400,
            ..Default::default()
        };
        Arc::new(DnsCache::open(&cfg).unwrap().unwrap())
    }

    fn spawn_upstream(
        servers: Vec<String>,
        parallel: bool,
        cache: Option<Arc<DnsCache>>,
        stats: Arc<CounterStatistics>,
    ) -> (TcpUpstream, watch::Sender<bool>) {
        let mut cfg = test_config(servers);
        cfg.parallel = parallel;
        let (tx, rx) = watch::channel(false);
        let upstream =
            TcpUpstream::spawn(&cfg, cache, Arc::new(AcceptAll), stats, rx).unwrap();
        (upstream, tx)
    }

    #[tokio::test]
    async fn test_length_prefix_round_trip_into_cache() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let request = read_request(&mut conn).await.unwrap();
            let reply = answer_for(&request, [9, 8, 7, 6], 120);
            write_reply(&mut conn, &reply).await;
        });

        let cache = memory_cache();
        let stats = Arc::new(CounterStatistics::new());
        let (upstream, _shutdown) = spawn_upstream(
            vec![addr.to_string()],
            false,
            Some(cache.clone()),
            stats.clone(),
        );

        let response = upstream
            .query(query_bytes("roundtrip.test"), "roundtrip.test".into())
            .await
            .unwrap();
        let msg = Message::from_bytes(&response).unwrap();
        assert_eq!(msg.answers().len(), 1);
        assert_eq!(
            msg.answers()[0].data(),
            Some(&RData::A(rdata::A::from(std::net::Ipv4Addr::new(9, 8, 7, 6))))
        );
        assert_eq!(cache.len(), 1);
        assert_eq!(stats.count(StatKind::Tcp), 1);
    }

    #[tokio::test]
    async fn test_retries_same_upstream_once_on_closed_keepalive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let accepted_srv = accepted.clone();

        tokio::spawn(async move {
            // First connection answers one query, then force-closes on
            // the next request without replying.
            let (mut conn, _) = listener.accept().await.unwrap();
            accepted_srv.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let request = read_request(&mut conn).await.unwrap();
            let reply = answer_for(&request, [1, 1, 1, 1], 60);
            write_reply(&mut conn, &reply).await;
            let _ = read_request(&mut conn).await;
            drop(conn);

            // The retry arrives on a fresh connection and succeeds.
            let (mut conn, _) = listener.accept().await.unwrap();
            accepted_srv.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let request = read_request(&mut conn).await.unwrap();
            let reply = answer_for(&request, [2, 2, 2, 2], 60);
            write_reply(&mut conn, &reply).await;
        });

        let stats = Arc::new(CounterStatistics::new());
        let (upstream, _shutdown) =
            spawn_upstream(vec![addr.to_string()], false, None, stats);

        let first = upstream
            .query(query_bytes("first.retry.test"), "first.retry.test".into())
            .await
            .unwrap();
        assert!(Message::from_bytes(&first).is_ok());

        // The parked keep-alive socket is reused (queried becomes 2),
        // the server closes it, and the worker retries exactly once.
        let second = upstream
            .query(query_bytes("second.retry.test"), "second.retry.test".into())
            .await
            .unwrap();
        let msg = Message::from_bytes(&second).unwrap();
        assert_eq!(
            msg.answers()[0].data(),
            Some(&RData::A(rdata::A::from(std::net::Ipv4Addr::new(2, 2, 2, 2))))
        );
        assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_query_is_refused_by_the_sweep() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and go silent.
            let (mut conn, _) = listener.accept().await.unwrap();
            let _ = read_request(&mut conn).await;
            std::future::pending::<()>().await;
        });

        let stats = Arc::new(CounterStatistics::new());
        let (upstream, _shutdown) =
            spawn_upstream(vec![addr.to_string()], false, None, stats.clone());

        let response = upstream
            .query(query_bytes("silent.test"), "silent.test".into())
            .await;
        assert!(response.is_none());
        assert_eq!(stats.count(StatKind::Refused), 1);
    }

    #[tokio::test]
    async fn test_parallel_fanout_reaches_every_upstream() {
        async fn one_shot_server(addr_tx: tokio::sync::oneshot::Sender<SocketAddr>, ip: [u8; 4], ttl: u32) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            addr_tx.send(listener.local_addr().unwrap()).unwrap();
            let (mut conn, _) = listener.accept().await.unwrap();
            let request = read_request(&mut conn).await.unwrap();
            let reply = answer_for(&request, ip, ttl);
            write_reply(&mut conn, &reply).await;
        }

        let (tx_a, rx_a) = tokio::sync::oneshot::channel();
        let (tx_b, rx_b) = tokio::sync::oneshot::channel();
        tokio::spawn(one_shot_server(tx_a, [10, 0, 0, 1], 600));
        tokio::spawn(one_shot_server(tx_b, [10, 0, 0, 2], 300));
        let addr_a = rx_a.await.unwrap();
        let addr_b = rx_b.await.unwrap();

        let cfg = CacheConfig {
            memory_only: true,
            size: 102_400,
            parallel: true,
            ..Default::default()
        };
        let cache = Arc::new(DnsCache::open(&cfg).unwrap().unwrap());
        let stats = Arc::new(CounterStatistics::new());
        let (upstream, _shutdown) = spawn_upstream(
            vec![addr_a.to_string(), addr_b.to_string()],
            true,
            Some(cache.clone()),
            stats,
        );

        let response = upstream
            .query(query_bytes("fan.test"), "fan.test".into())
            .await;
        assert!(response.is_some());

        // Both replies land in the cache with parallel caching on.
        for _ in 0..100 {
            if cache.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_resolve_addrs_defaults_port() {
        let addrs = resolve_addrs(&["1.1.1.1".to_string(), "8.8.8.8:5353".to_string()], 53)
            .unwrap();
        assert_eq!(addrs[0].port(), 53);
        assert_eq!(addrs[1].port(), 5353);
        assert!(resolve_addrs(&["not an address".to_string()], 53).is_err());
    }

    #[test]
    fn test_spawn_requires_servers() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let (_, rx) = watch::channel(false);
        let cfg = test_config(Vec::new());
        assert!(TcpUpstream::spawn(
            &cfg,
            None,
            Arc::new(AcceptAll),
            Arc::new(relaydns_core::types::NoopStatistics),
            rx
        )
        .is_err());
    }
}
