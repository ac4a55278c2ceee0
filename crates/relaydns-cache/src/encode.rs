//! Cache entry encoding.
//!
//! An entry payload is `0xFF`, the NUL-terminated ASCII key
//! `name\x01HEX(type)\x01HEX(class)`, then the record data in cache
//! form. Domain names inside the data are stored as dotted ASCII with
//! a terminating NUL so a CNAME target can feed the next key lookup
//! directly.

use hickory_proto::rr::rdata;
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecoder, BinEncodable, Restrict};
use relaydns_core::{Error, Result};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// First payload byte of a valid entry.
pub const CACHE_START: u8 = 0xFF;
/// First payload byte of a tombstoned entry; scans must skip it.
pub const CACHE_INVALID: u8 = 0xFD;
/// Filler between `used_length` and the rounded `length`.
pub const CACHE_PAD: u8 = 0xFE;

pub const ENTRY_BUF_SIZE: usize = 512;

/// Fixed-capacity builder for one entry. Every append is checked; a
/// record that does not fit is rejected whole rather than truncated.
pub struct EntryBuf {
    buf: [u8; ENTRY_BUF_SIZE],
    len: usize,
    key_len: usize,
}

impl EntryBuf {
    fn new() -> Self {
        let mut buf = [0u8; ENTRY_BUF_SIZE];
        buf[0] = CACHE_START;
        Self {
            buf,
            len: 1,
            key_len: 0,
        }
    }

    fn push(&mut self, bytes: &[u8]) -> Result<()> {
        if self.len + bytes.len() > ENTRY_BUF_SIZE {
            return Err(Error::EntryOverflow);
        }
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    /// The whole payload, start marker included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Key plus data, as compared against stored payloads.
    pub fn item(&self) -> &[u8] {
        &self.buf[1..self.len]
    }

    /// `name\1type\1class\0`, the prefix shared by every copy of one
    /// record set.
    pub fn key_with_nul(&self) -> &[u8] {
        &self.buf[1..1 + self.key_len]
    }
}

/// Lowercased dotted name without the trailing root dot, the form keys
/// are built from.
pub fn canonical_name(name: &Name) -> String {
    let s = name.to_ascii().to_lowercase();
    s.trim_end_matches('.').to_string()
}

/// `name\1HEX(type)\1HEX(class)\0` as a lookup key.
pub fn key_bytes(name: &str, rtype: u16, class: u16) -> Vec<u8> {
    let mut v = Vec::with_capacity(name.len() + 12);
    v.extend_from_slice(name.as_bytes());
    v.push(1);
    v.extend_from_slice(format!("{rtype:X}").as_bytes());
    v.push(1);
    v.extend_from_slice(format!("{class:X}").as_bytes());
    v.push(0);
    v
}

pub fn build_entry(name: &str, rtype: u16, class: u16, data: &[u8]) -> Result<EntryBuf> {
    let mut e = EntryBuf::new();
    e.push(name.as_bytes())?;
    e.push(&[1])?;
    e.push(format!("{rtype:X}").as_bytes())?;
    e.push(&[1])?;
    e.push(format!("{class:X}").as_bytes())?;
    e.push(&[0])?;
    e.key_len = e.len - 1;
    e.push(data)?;
    Ok(e)
}

fn push_name(out: &mut Vec<u8>, name: &Name) {
    out.extend_from_slice(canonical_name(name).as_bytes());
    out.push(0);
}

/// Record data to cache form. Addresses keep network order, names
/// become dotted ASCII; anything without a bespoke form keeps its raw
/// wire RDATA.
pub fn rdata_to_cache_form(data: &RData) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match data {
        RData::A(a) => out.extend_from_slice(&a.0.octets()),
        RData::AAAA(a) => out.extend_from_slice(&a.0.octets()),
        RData::CNAME(c) => push_name(&mut out, &c.0),
        RData::PTR(p) => push_name(&mut out, &p.0),
        RData::NS(n) => push_name(&mut out, &n.0),
        RData::MX(mx) => {
            out.extend_from_slice(&mx.preference().to_be_bytes());
            push_name(&mut out, mx.exchange());
        }
        RData::SOA(soa) => {
            push_name(&mut out, soa.mname());
            push_name(&mut out, soa.rname());
            out.extend_from_slice(&soa.serial().to_be_bytes());
            out.extend_from_slice(&(soa.refresh() as u32).to_be_bytes());
            out.extend_from_slice(&(soa.retry() as u32).to_be_bytes());
            out.extend_from_slice(&(soa.expire() as u32).to_be_bytes());
            out.extend_from_slice(&soa.minimum().to_be_bytes());
        }
        other => out = other.to_bytes()?,
    }
    Ok(out)
}

fn read_name(data: &[u8]) -> Result<(Name, &[u8])> {
    let nul = data
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Other("unterminated name in cache data".into()))?;
    let s = std::str::from_utf8(&data[..nul])
        .map_err(|_| Error::Other("non-ascii name in cache data".into()))?;
    let mut name = Name::from_ascii(s)?;
    name.set_fqdn(true);
    Ok((name, &data[nul + 1..]))
}

fn read_u32(data: &[u8], at: usize) -> Result<u32> {
    let bytes: [u8; 4] = data
        .get(at..at + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| Error::Other("short cache data".into()))?;
    Ok(u32::from_be_bytes(bytes))
}

/// Cache form back to typed record data.
pub fn cache_form_to_rdata(rtype: RecordType, data: &[u8]) -> Result<RData> {
    match rtype {
        RecordType::A => {
            let octets: [u8; 4] = data
                .get(..4)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| Error::Other("short A data".into()))?;
            Ok(RData::A(rdata::A::from(Ipv4Addr::from(octets))))
        }
        RecordType::AAAA => {
            let octets: [u8; 16] = data
                .get(..16)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| Error::Other("short AAAA data".into()))?;
            Ok(RData::AAAA(rdata::AAAA::from(Ipv6Addr::from(octets))))
        }
        RecordType::CNAME => {
            let (name, _) = read_name(data)?;
            Ok(RData::CNAME(rdata::CNAME(name)))
        }
        RecordType::PTR => {
            let (name, _) = read_name(data)?;
            Ok(RData::PTR(rdata::PTR(name)))
        }
        RecordType::NS => {
            let (name, _) = read_name(data)?;
            Ok(RData::NS(rdata::NS(name)))
        }
        RecordType::MX => {
            let pref: [u8; 2] = data
                .get(..2)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| Error::Other("short MX data".into()))?;
            let (name, _) = read_name(&data[2..])?;
            Ok(RData::MX(rdata::MX::new(u16::from_be_bytes(pref), name)))
        }
        RecordType::SOA => {
            let (mname, rest) = read_name(data)?;
            let (rname, rest) = read_name(rest)?;
            Ok(RData::SOA(rdata::SOA::new(
                mname,
                rname,
                read_u32(rest, 0)?,
                read_u32(rest, 4)? as i32,
                read_u32(rest, 8)? as i32,
                read_u32(rest, 12)? as i32,
                read_u32(rest, 16)?,
            )))
        }
        _ => {
            let mut decoder = BinDecoder::new(data);
            Ok(RData::read(
                &mut decoder,
                rtype,
                Restrict::new(data.len() as u16),
            )?)
        }
    }
}

/// Dotted-ASCII string to an absolute hickory name.
pub fn name_from_str(s: &str) -> Result<Name> {
    let mut name = Name::from_str(s).or_else(|_| Name::from_ascii(s))?;
    name.set_fqdn(true);
    Ok(name)
}
