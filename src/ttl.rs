use std::time::{Duration, SystemTime};

use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::rdata::SOA;
use hickory_proto::rr::{RData, Record};

/// Admission clamp bounds, positive and negative answers separately.
#[derive(Debug, Clone, Copy)]
pub struct TtlBounds {
    pub min_ttl: u32,
    pub max_ttl: u32,
    pub neg_min_ttl: u32,
    pub neg_max_ttl: u32,
}

/// Rewrites every resource record TTL in the message to the seconds
/// left until `expiration`, rounded up to the next whole second and
/// zero once expired, across Answer, Authority and Additional
/// sections. SOA MINIMUM fields are rewritten identically so negative
/// TTLs decay with the entry. Idempotent for a fixed `expiration` and
/// `now`.
pub fn update_ttl(msg: &mut Message, expiration: SystemTime, now: SystemTime) {
    let remaining = expiration
        .duration_since(now)
        .map(|left| {
            let mut secs = left.as_secs();
            // a record with any lifetime left is never delivered as 0
            if left.subsec_nanos() > 0 {
                secs += 1;
            }
            secs.min(u32::MAX as u64) as u32
        })
        .unwrap_or(0);

    for record in msg.answers_mut() {
        rewrite_record(record, remaining);
    }
    for record in msg.name_servers_mut() {
        rewrite_record(record, remaining);
    }
    for record in msg.additionals_mut() {
        rewrite_record(record, remaining);
    }
}

fn rewrite_record(record: &mut Record, remaining: u32) {
    record.set_ttl(remaining);
    // SOA carries its own negative TTL; hickory has no field setter, so
    // the rdata is rebuilt.
    if let Some(RData::SOA(soa)) = record.data() {
        let rewritten = SOA::new(
            soa.mname().clone(),
            soa.rname().clone(),
            soa.serial(),
            soa.refresh(),
            soa.retry(),
            soa.expire(),
            remaining,
        );
        record.set_data(Some(RData::SOA(rewritten)));
    }
}

/// Admission TTL for an upstream response.
///
/// NOERROR with at least one answer takes the minimum answer TTL
/// clamped to `[min_ttl, max_ttl]`; everything else (NXDOMAIN, empty
/// NOERROR) takes the SOA MINIMUM when an SOA is present, else zero,
/// clamped to `[neg_min_ttl, neg_max_ttl]`.
pub fn effective_ttl(msg: &Message, bounds: &TtlBounds) -> Duration {
    let positive = msg.response_code() == ResponseCode::NoError && !msg.answers().is_empty();

    let secs = if positive {
        let base = msg
            .answers()
            .iter()
            .map(|record| record.ttl())
            .min()
            .unwrap_or(0);
        clamp(base, bounds.min_ttl, bounds.max_ttl)
    } else {
        let base = soa_minimum(msg).unwrap_or(0);
        clamp(base, bounds.neg_min_ttl, bounds.neg_max_ttl)
    };

    Duration::from_secs(u64::from(secs))
}

fn clamp(base: u32, lo: u32, hi: u32) -> u32 {
    base.max(lo).min(hi)
}

fn soa_minimum(msg: &Message) -> Option<u32> {
    msg.name_servers()
        .iter()
        .chain(msg.answers().iter())
        .find_map(|record| match record.data() {
            Some(RData::SOA(soa)) => Some(soa.minimum()),
            _ => None,
        })
}
