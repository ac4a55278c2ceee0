//! The DNS answer cache: insertion with TTL policy, lookup with CNAME
//! chasing, parallel-TTL reconciliation and the periodic expiry sweep,
//! all over the self-describing backing region.

use crate::encode::{
    build_entry, cache_form_to_rdata, canonical_name, key_bytes, name_from_str, CACHE_INVALID,
    CACHE_PAD,
};
use crate::ht::{CacheHt, Node};
use crate::region::{Header, Region, CACHE_VERSION, HEADER_SIZE, MIN_CACHE_SIZE};
use crate::ttl::{TtlPolicy, TtlRule};
use hickory_proto::op::{Edns, Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::{rdata, DNSClass, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use parking_lot::RwLock;
use relaydns_core::config::{CacheConfig, Infection};
use relaydns_core::{Error, Result};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Cadence of the TTL countdown sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(59);

/// Hop ceiling when chasing CNAMEs out of the cache.
const CNAME_CHAIN_LIMIT: usize = 8;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn cached_type(rtype: RecordType) -> bool {
    matches!(
        rtype,
        RecordType::A | RecordType::AAAA | RecordType::HTTPS | RecordType::CNAME
    )
}

pub struct DnsCache {
    inner: RwLock<CacheHt>,
    policy: TtlPolicy,
    parallel: bool,
    ignore_ttl: bool,
}

impl DnsCache {
    /// Builds the cache from config; `None` when caching is disabled.
    pub fn open(cfg: &CacheConfig) -> Result<Option<DnsCache>> {
        if !cfg.enabled {
            return Ok(None);
        }

        let policy = TtlPolicy::from_config(cfg)?;
        let size = (cfg.size + 7) / 8 * 8;
        if size < MIN_CACHE_SIZE {
            return Err(Error::CacheInit(
                "cache size must not be less than 102400 bytes".into(),
            ));
        }

        let ht = if cfg.memory_only {
            Self::create_new(Region::anonymous(size as usize)?, size)
        } else {
            let path = cfg.file.as_deref().ok_or_else(|| {
                Error::Config("cache.file is required unless cache.memory_only".into())
            })?;
            info!(path = %path.display(), "cache file");
            let (region, existed) = Region::open_file(path, size as usize)?;
            if existed && cfg.reload {
                match Self::reload(region, size) {
                    Ok(ht) => ht,
                    Err((region, reason)) if cfg.overwrite => {
                        info!("existing cache overwritten: {reason}");
                        Self::create_new(region, size)
                    }
                    Err((_, reason)) => return Err(Error::CacheHeader(reason)),
                }
            } else {
                Self::create_new(region, size)
            }
        };

        Ok(Some(Self {
            inner: RwLock::new(ht),
            policy,
            parallel: cfg.parallel,
            ignore_ttl: cfg.ignore_ttl,
        }))
    }

    pub fn ignore_ttl(&self) -> bool {
        self.ignore_ttl
    }

    /// Live entry count.
    pub fn len(&self) -> usize {
        self.inner.read().cache_count().max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn create_new(mut region: Region, size: i32) -> CacheHt {
        region.zero();
        region.set_header(Header::fresh(size));
        CacheHt::init(region)
    }

    fn reload(region: Region, size: i32) -> std::result::Result<CacheHt, (Region, String)> {
        let h = region.header();
        if h.ver != CACHE_VERSION {
            let reason = format!(
                "cache version {} is not compatible with this program's {CACHE_VERSION}",
                h.ver
            );
            return Err((region, reason));
        }
        if h.cache_size != size {
            let reason = format!(
                "cache size {} does not match the configured {size}",
                h.cache_size
            );
            return Err((region, reason));
        }
        let ht = CacheHt::rebind(region)?;
        info!(
            entries = ht.node_used(),
            items = ht.cache_count(),
            "cache reloaded"
        );
        Ok(ht)
    }

    /// Feeds an upstream reply into the cache. Replies after the first
    /// of a fan-out only land when parallel caching is on.
    pub fn add_items(&self, response: &[u8], is_first: bool) -> Result<()> {
        self.add_items_at(response, is_first, unix_now())
    }

    fn add_items_at(&self, response: &[u8], is_first: bool, now: u64) -> Result<()> {
        if !is_first && !self.parallel {
            return Ok(());
        }
        let msg = Message::from_bytes(response)?;
        let question_domain = msg.queries().first().map(|q| canonical_name(q.name()));
        let question_rule = question_domain
            .as_deref()
            .and_then(|d| self.policy.lookup(d));

        let mut ht = self.inner.write();
        for record in msg
            .answers()
            .iter()
            .chain(msg.name_servers())
            .chain(msg.additionals())
        {
            if !cached_type(record.record_type()) || record.dns_class() != DNSClass::IN {
                continue;
            }
            if let Err(e) = self.add_one(&mut ht, record, question_rule, now) {
                debug!(name = %record.name(), "record not cached: {e}");
            }
        }
        Ok(())
    }

    fn add_one(
        &self,
        ht: &mut CacheHt,
        record: &Record,
        question_rule: Option<&TtlRule>,
        now: u64,
    ) -> Result<()> {
        let data = record
            .data()
            .ok_or_else(|| Error::Other("record carries no data".into()))?;
        let name = canonical_name(record.name());
        let entry = build_entry(
            &name,
            record.record_type().into(),
            record.dns_class().into(),
            &crate::encode::rdata_to_cache_form(data)?,
        )?;

        let rule = match question_rule {
            Some(q) => match q.infection {
                Infection::Aggressive => Some(q),
                Infection::Passive => self.policy.lookup(&name).or(Some(q)),
                Infection::None => self.policy.lookup(&name),
            },
            None => self.policy.lookup(&name),
        };
        let record_ttl = TtlPolicy::apply(rule, record.ttl());
        if record_ttl == 0 {
            return Ok(());
        }

        if self.find_from(ht, entry.item(), None, now).is_some() {
            // Byte-identical entry already stored; with parallel
            // caching its TTL still joins the reconciliation.
            if self.parallel {
                self.reconcile_min_ttl(ht, entry.key_with_nul(), record_ttl, now);
            }
            return Ok(());
        }

        let total = entry.as_bytes().len();
        let rounded = (total + 3) / 4 * 4;
        let end = ht.end();
        let (idx, created) = ht
            .find_unused_node(rounded as u32, end as usize + rounded, now)
            .ok_or(Error::CacheFull)?;
        let mut node = ht.node(idx);
        if created {
            node.offset = end;
            ht.set_end(end + rounded as i32);
        }

        let payload = ht.payload_mut(node.offset, rounded);
        if payload.len() != rounded {
            return Err(Error::Other("payload offset out of range".into()));
        }
        payload[..total].copy_from_slice(entry.as_bytes());
        payload[total..].fill(CACHE_PAD);
        node.used_length = total as u32;

        let mut ttl = record_ttl;
        if self.parallel {
            ttl = self.reconcile_min_ttl(ht, entry.key_with_nul(), ttl, now);
        }
        node.ttl = ttl;
        node.time_added = now;
        ht.insert_to_slot(entry.item(), idx, &mut node, None);
        ht.bump_count(1);
        Ok(())
    }

    /// Walks `content`'s slot chain for the next live entry whose
    /// payload starts with those bytes. `content` runs from the key
    /// (exclusive of the start marker); a full item matches one exact
    /// record, a key-with-NUL prefix matches every copy of a set.
    fn find_from(
        &self,
        ht: &CacheHt,
        content: &[u8],
        start: Option<(i32, Node)>,
        now: u64,
    ) -> Option<(i32, Node)> {
        let mut cur = match &start {
            None => ht.get(content, None, None),
            Some((_, n)) => ht.get(content, Some(n), None),
        };
        while let Some((i, n)) = cur {
            let live = self.ignore_ttl || now.saturating_sub(n.time_added) < n.ttl as u64;
            if live
                && 1 + content.len() <= n.used_length as usize
                && ht.payload(n.offset + 1, content.len()) == content
            {
                return Some((i, n));
            }
            cur = ht.get(content, Some(&n), None);
        }
        None
    }

    /// Parallel reconciliation: the minimum remaining TTL across every
    /// stored copy of the key and the incoming TTL, stamped back onto
    /// all of them with a shared `time_added`.
    fn reconcile_min_ttl(&self, ht: &mut CacheHt, key: &[u8], new_ttl: u32, now: u64) -> u32 {
        let mut min = new_ttl;
        let mut cur = self.find_from(ht, key, None, now);
        while let Some((i, n)) = cur {
            let elapsed = now.saturating_sub(n.time_added) as u32;
            min = min.min(n.ttl.saturating_sub(elapsed));
            cur = self.find_from(ht, key, Some((i, n)), now);
        }

        let mut cur = self.find_from(ht, key, None, now);
        while let Some((i, mut n)) = cur {
            n.ttl = min;
            n.time_added = now;
            ht.set_node(i, n);
            cur = self.find_from(ht, key, Some((i, n)), now);
        }
        min
    }

    fn remaining_ttl(&self, node: &Node, now: u64) -> u32 {
        if self.ignore_ttl {
            node.ttl
        } else {
            node.ttl
                .saturating_sub(now.saturating_sub(node.time_added) as u32)
        }
    }

    /// Answers a question from the cache, or `None` on a miss. The
    /// response is fully generated: flags rewritten, answers carry the
    /// remaining TTL, names compressed by the encoder.
    pub fn fetch(&self, request: &Message) -> Result<Option<Vec<u8>>> {
        self.fetch_at(request, unix_now())
    }

    fn fetch_at(&self, request: &Message, now: u64) -> Result<Option<Vec<u8>>> {
        let query = match request.queries().first() {
            Some(q) => q.clone(),
            None => return Ok(None),
        };
        let qtype = query.query_type();
        if query.query_class() != DNSClass::IN || !cached_type(qtype) {
            return Ok(None);
        }

        let mut name = canonical_name(query.name());
        let ht = self.inner.read();
        let mut answers: Vec<Record> = Vec::new();

        if qtype != RecordType::CNAME {
            for _ in 0..CNAME_CHAIN_LIMIT {
                let key = key_bytes(&name, RecordType::CNAME.into(), DNSClass::IN.into());
                let Some((_, node)) = self.find_from(&ht, &key, None, now) else {
                    break;
                };
                let Some(target) = read_payload_name(&ht, &node, key.len()) else {
                    break;
                };
                answers.push(Record::from_rdata(
                    name_from_str(&name)?,
                    self.remaining_ttl(&node, now),
                    RData::CNAME(rdata::CNAME(name_from_str(&target)?)),
                ));
                name = target;
            }
        }

        let key = key_bytes(&name, qtype.into(), DNSClass::IN.into());
        let owner = name_from_str(&name)?;
        let mut matched = false;
        let mut cur = self.find_from(&ht, &key, None, now);
        while let Some((i, node)) = cur {
            matched = true;
            if node.ttl != 0 {
                if let Some(data_len) = (node.used_length as usize).checked_sub(1 + key.len()) {
                    let data = ht.payload(node.offset + 1 + key.len() as i32, data_len);
                    match cache_form_to_rdata(qtype, data) {
                        Ok(rd) => answers.push(Record::from_rdata(
                            owner.clone(),
                            self.remaining_ttl(&node, now),
                            rd,
                        )),
                        Err(e) => debug!("cached data for {name} not decodable: {e}"),
                    }
                }
            }
            cur = self.find_from(&ht, &key, Some((i, node)), now);
        }
        drop(ht);

        if !matched {
            return Ok(None);
        }

        let mut resp = Message::new();
        resp.set_id(request.id());
        resp.set_message_type(MessageType::Response);
        resp.set_op_code(OpCode::Query);
        resp.set_authoritative(false);
        resp.set_recursion_desired(request.recursion_desired());
        resp.set_recursion_available(true);
        resp.set_response_code(ResponseCode::NoError);
        resp.add_query(query);
        for a in answers {
            resp.add_answer(a);
        }
        if request.edns().is_some() {
            let mut edns = Edns::new();
            edns.set_max_payload(1280);
            resp.set_edns(edns);
        }
        Ok(Some(resp.to_bytes()?))
    }

    /// TTL countdown: tombstone and unlink every expired entry, then
    /// collapse the end pointer behind the surviving tail. Scanning
    /// tail first lets the chunk shrink as far as possible in one
    /// pass. The write lock is only taken when something expired.
    pub fn sweep(&self) {
        self.sweep_at(unix_now());
    }

    fn sweep_at(&self, now: u64) {
        if self.ignore_ttl {
            return;
        }

        let expired = |n: &Node| n.ttl > 0 && now.saturating_sub(n.time_added) >= n.ttl as u64;

        {
            let ht = self.inner.read();
            if !(0..ht.node_used()).rev().any(|i| expired(&ht.node(i))) {
                return;
            }
        }

        let mut ht = self.inner.write();
        for i in (0..ht.node_used()).rev() {
            let mut n = ht.node(i);
            if expired(&n) {
                n.ttl = 0;
                if let Some(b) = ht.payload_mut(n.offset, 1).first_mut() {
                    *b = CACHE_INVALID;
                }
                ht.remove_from_slot(i, &mut n, now);
                ht.bump_count(-1);
            }
        }

        let used = ht.node_used();
        if used == 0 {
            ht.set_end(HEADER_SIZE as i32);
        } else {
            let last = ht.node(used - 1);
            ht.set_end(last.offset + last.length as i32);
        }
    }
}

fn read_payload_name(ht: &CacheHt, node: &Node, key_len: usize) -> Option<String> {
    let len = (node.used_length as usize).checked_sub(1 + key_len)?;
    let data = ht.payload(node.offset + 1 + key_len as i32, len);
    let nul = data.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&data[..nul]).ok().map(str::to_string)
}
