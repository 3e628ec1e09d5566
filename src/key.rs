use std::fmt;

use hickory_proto::op::Message;
use hickory_proto::rr::{DNSClass, Name, RecordType};
use sha2::{Digest, Sha512_256};

use crate::proto_utils::write_normalized_qname;
use crate::state::RequestState;

/// 32-byte question fingerprint: SHA-512/256 over
/// `qtype ∥ qclass ∥ dnssec-bit ∥ normalized-qname` with the 16-bit
/// fields little-endian. Collisions are treated as impossible.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey(")?;
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "…)")
    }
}

/// Fingerprint for the first question of `msg`. When the pre-parsed
/// request state is absent (snapshot load), the DNSSEC bit comes from
/// the message's own OPT record. Returns `None` for question-less
/// messages, which the cache never stores.
pub fn compute_cache_key(state: Option<&RequestState>, msg: &Message) -> Option<CacheKey> {
    let query = msg.queries().first()?;
    let dnssec = match state {
        Some(state) => state.dnssec,
        None => msg.edns().map(|edns| edns.dnssec_ok()).unwrap_or(false),
    };
    cache_key_for(query.name(), query.query_type(), query.query_class(), dnssec)
}

pub fn cache_key_for(
    name: &Name,
    qtype: RecordType,
    qclass: DNSClass,
    dnssec: bool,
) -> Option<CacheKey> {
    let mut name_buf = [0u8; 256];
    let name_len = write_normalized_qname(name, &mut name_buf)?;

    let mut prefix = [0u8; 5];
    prefix[0..2].copy_from_slice(&u16::from(qtype).to_le_bytes());
    prefix[2..4].copy_from_slice(&u16::from(qclass).to_le_bytes());
    prefix[4] = u8::from(dnssec);

    let mut hasher = Sha512_256::new();
    hasher.update(prefix);
    hasher.update(&name_buf[..name_len]);
    Some(CacheKey(hasher.finalize().into()))
}
