//! Binary encoding of peer metadata
//!
//! Format (big-endian):
//! ```text
//! +---------+-----------+------------+-----------+-----------+-------------+----------------------------+
//! | Ver(1)  | Family(1) | Addr(4|16) | KeyLen(2) | Key(utf8) | Routes(1)   | {Family Addr PrefixLen}*   |
//! +---------+-----------+------------+-----------+-----------+-------------+----------------------------+
//! ```
//!
//! The blob carries no integrity check; the membership transport is gated
//! by the cluster secret.

use crate::error::{OverlayError, Result};
use crate::peer::PeerMeta;
use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Metadata format version
pub const METADATA_VERSION: u8 = 1;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// Encode metadata, failing if the result exceeds `limit` bytes
pub fn encode(meta: &PeerMeta, limit: usize) -> Result<Vec<u8>> {
    let key = meta.public_key.as_bytes();
    let size = 1
        + addr_len(&meta.overlay_addr)
        + 2
        + key.len()
        + 1
        + meta
            .routes
            .iter()
            .map(|r| addr_len(&r.addr()) + 1)
            .sum::<usize>();

    if size > limit {
        return Err(OverlayError::MetadataOversize { size, limit });
    }
    let key_len = u16::try_from(key.len())
        .map_err(|_| OverlayError::MalformedMetadata("public key too long".to_string()))?;
    let route_count = u8::try_from(meta.routes.len())
        .map_err(|_| OverlayError::MalformedMetadata("too many routes".to_string()))?;

    let mut buf = Vec::with_capacity(size);
    buf.push(METADATA_VERSION);
    put_addr(&mut buf, &meta.overlay_addr);
    buf.extend_from_slice(&key_len.to_be_bytes());
    buf.extend_from_slice(key);
    buf.push(route_count);
    for route in &meta.routes {
        put_addr(&mut buf, &route.addr());
        buf.push(route.prefix_len());
    }
    Ok(buf)
}

/// Decode metadata produced by [`encode`]
pub fn decode(bytes: &[u8]) -> Result<PeerMeta> {
    let mut r = Reader::new(bytes);

    let version = r.u8()?;
    if version != METADATA_VERSION {
        return Err(malformed(format!("unsupported version {version}")));
    }
    let overlay_addr = r.addr()?;
    let key_len = usize::from(r.u16()?);
    let public_key = r.string(key_len)?;
    let route_count = r.u8()?;
    let mut routes = Vec::with_capacity(usize::from(route_count));
    for _ in 0..route_count {
        let addr = r.addr()?;
        let prefix_len = r.u8()?;
        let net = IpNet::new(addr, prefix_len)
            .map_err(|_| malformed(format!("prefix length {prefix_len} out of range for {addr}")))?;
        routes.push(net);
    }
    r.finish()?;

    Ok(PeerMeta {
        overlay_addr,
        public_key,
        routes,
    })
}

fn malformed(msg: impl Into<String>) -> OverlayError {
    OverlayError::MalformedMetadata(msg.into())
}

fn addr_len(addr: &IpAddr) -> usize {
    match addr {
        IpAddr::V4(_) => 1 + 4,
        IpAddr::V6(_) => 1 + 16,
    }
}

pub(crate) fn put_addr(buf: &mut Vec<u8>, addr: &IpAddr) {
    match addr {
        IpAddr::V4(v4) => {
            buf.push(FAMILY_V4);
            buf.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.push(FAMILY_V6);
            buf.extend_from_slice(&v6.octets());
        }
    }
}

/// Bounds-checked big-endian cursor
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                malformed(format!(
                    "truncated: need {n} bytes at offset {}, have {}",
                    self.pos,
                    self.buf.len() - self.pos
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    pub(crate) fn string(&mut self, len: usize) -> Result<String> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| malformed("invalid utf-8"))
    }

    pub(crate) fn addr(&mut self) -> Result<IpAddr> {
        match self.u8()? {
            FAMILY_V4 => {
                let b = self.take(4)?;
                Ok(IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3])))
            }
            FAMILY_V6 => {
                let mut raw = [0u8; 16];
                raw.copy_from_slice(self.take(16)?);
                Ok(IpAddr::V6(Ipv6Addr::from(raw)))
            }
            other => Err(malformed(format!("unknown address family {other}"))),
        }
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    pub(crate) fn finish(&self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(malformed(format!(
                "{} trailing bytes",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}
