use std::time::SystemTime;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use tracing::warn;

use crate::key::{cache_key_for, compute_cache_key};
use crate::proto_utils::{first_label_starts_with, strip_flush_prefix, ESNI_PREFIX, FLUSH_PREFIX};
use crate::state::{Action, RequestState, SESSION_STALE};
use crate::store::{ArcCache, CachedResponse, SharedCache};
use crate::ttl::{effective_ttl, update_ttl};

/// Cache reader, run for every inbound query before upstream dispatch.
///
/// On a fresh hit it installs a synthetic response and short-circuits
/// the pipeline. On a stale hit the synthetic response is stashed for
/// the query log and the query proceeds upstream, unless forced-stale
/// policy admits it: forced serving is allowed once per request path,
/// within the configured post-expiration window, and never for `_esni`
/// owner names.
pub fn eval_query(cache: &SharedCache, state: &mut RequestState, msg: &Message) {
    let Some(query) = msg.queries().first() else {
        return;
    };

    // flush 哨兵由响应路径处理，读侧完全让路 / the flush sentinel is handled on the response path, the reader stays out of the way
    if state.flush_enabled && first_label_starts_with(query.name(), FLUSH_PREFIX) {
        return;
    }

    let Some(key) = compute_cache_key(Some(state), msg) else {
        return;
    };

    let slot = cache.slot();
    let Some(store) = slot.store.as_ref() else {
        return;
    };
    let Some(cached) = store.get(&key) else {
        return;
    };

    // The stored entry is never mutated; deliveries work on a clone
    // with the requester's id and question. Name compression happens at
    // emission.
    let mut synth = cached.msg.clone();
    synth.set_id(msg.id());
    synth.set_message_type(MessageType::Response);
    synth.take_queries();
    synth.add_queries(msg.queries().iter().cloned());

    let now = SystemTime::now();
    if now >= cached.expiration {
        if !state.cache_forced
            || state.force_request
            || first_label_starts_with(query.name(), ESNI_PREFIX)
        {
            state.session_data.insert(SESSION_STALE, synth);
            return;
        }
        let overdue = now.duration_since(cached.expiration).unwrap_or_default();
        if !state.cache_forced_max_ttl.is_zero() && overdue > state.cache_forced_max_ttl {
            state.session_data.insert(SESSION_STALE, synth);
            return;
        }
        state.force_request = true;
    }

    update_ttl(&mut synth, cached.expiration, now);

    state.cached_ttl = signed_secs(cached.expiration, now);
    state.synth_response = Some(synth);
    state.action = Action::Synth;
    state.cache_hit = true;
}

/// Cache writer, run for every upstream response.
///
/// Admits NOERROR/NXDOMAIN/NOTAUTH answers with the truncation bit
/// clear, clamped to the configured TTL bounds; handles the flush
/// sentinel by evicting the entry for the stripped qname instead of
/// inserting.
pub fn eval_response(cache: &SharedCache, state: &mut RequestState, msg: &mut Message) {
    if msg.truncated() {
        return;
    }
    if !admissible_rcode(msg.response_code()) {
        return;
    }
    let Some(query) = msg.queries().first() else {
        return;
    };

    if state.flush_enabled && first_label_starts_with(query.name(), FLUSH_PREFIX) {
        if let Some(target) = strip_flush_prefix(query.name()) {
            if let Some(key) =
                cache_key_for(&target, query.query_type(), query.query_class(), state.dnssec)
            {
                let slot = cache.slot_mut();
                if let Some(store) = slot.store.as_ref() {
                    store.remove(&key);
                }
            }
            state.action = Action::Flush;
        }
        return;
    }

    let Some(key) = compute_cache_key(Some(state), msg) else {
        return;
    };

    let bounds = state.ttl_bounds();
    let ttl = effective_ttl(msg, &bounds);
    state.cached_ttl = ttl.as_secs() as i64;

    let now = SystemTime::now();
    let expiration = now + ttl;

    // The snapshot loader recomputes keys from packed messages, so the
    // stored copy's DO bit must match the key's DNSSEC dimension.
    let mut stored = msg.clone();
    let stored_do = stored.edns().map(|edns| edns.dnssec_ok()).unwrap_or(false);
    if stored_do != state.dnssec {
        stored.edns_mut().set_dnssec_ok(state.dnssec);
    }

    {
        let mut slot = cache.slot_mut();
        if slot.store.is_none() {
            match ArcCache::new(state.cache_size) {
                Ok(store) => slot.store = Some(store),
                Err(err) => {
                    warn!(error = %err, "cache store unavailable, response not cached");
                    return;
                }
            }
        }
        if let Some(store) = slot.store.as_ref() {
            store.add(
                key,
                CachedResponse {
                    expiration,
                    msg: stored,
                },
            );
        }
    }

    // a successful refresh cancels the stale-served marker
    state.force_request = false;

    // the client sees TTLs consistent with the cached expiration
    update_ttl(msg, expiration, now);
}

fn admissible_rcode(rcode: ResponseCode) -> bool {
    matches!(
        rcode,
        ResponseCode::NoError | ResponseCode::NXDomain | ResponseCode::NotAuth
    )
}

fn signed_secs(expiration: SystemTime, now: SystemTime) -> i64 {
    match expiration.duration_since(now) {
        Ok(left) => left.as_secs() as i64,
        Err(overdue) => -(overdue.duration().as_secs() as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::time::Duration;

    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::{A, SOA};
    use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
    use serde_json::json;

    use crate::config::ProxyConfig;
    use crate::key::CacheKey;

    fn test_config(forced: bool) -> ProxyConfig {
        serde_json::from_value(json!({
            "cache": {
                "size": 16,
                "min_ttl": 60,
                "max_ttl": 86400,
                "neg_min_ttl": 60,
                "neg_max_ttl": 600,
                "forced": forced,
                "forced_max_ttl": 86400,
                "flush_enabled": true
            }
        }))
        .expect("config")
    }

    fn state(forced: bool) -> RequestState {
        RequestState::new(&test_config(forced), false)
    }

    fn query_msg(name: &str, qtype: RecordType) -> Message {
        let mut msg = Message::new();
        msg.set_id(0x2b1d);
        let mut query = Query::new();
        query.set_name(Name::from_str(name).expect("name"));
        query.set_query_type(qtype);
        query.set_query_class(DNSClass::IN);
        msg.add_query(query);
        msg
    }

    fn answer_msg(name: &str, ttl: u32) -> Message {
        let mut msg = query_msg(name, RecordType::A);
        msg.set_message_type(MessageType::Response);
        msg.add_answer(Record::from_rdata(
            Name::from_str(name).expect("name"),
            ttl,
            RData::A(A(std::net::Ipv4Addr::new(192, 0, 2, 53))),
        ));
        msg
    }

    fn nxdomain_msg(name: &str, soa_minimum: u32) -> Message {
        let mut msg = query_msg(name, RecordType::A);
        msg.set_message_type(MessageType::Response);
        msg.set_response_code(ResponseCode::NXDomain);
        let origin = Name::from_str("example.").expect("name");
        let soa = SOA::new(
            origin.clone(),
            Name::from_str("hostmaster.example.").expect("name"),
            2024010100,
            7200,
            3600,
            1209600,
            soa_minimum,
        );
        msg.add_name_server(Record::from_rdata(origin, 600, RData::SOA(soa)));
        msg
    }

    fn key_of(msg: &Message) -> CacheKey {
        compute_cache_key(None, msg).expect("key")
    }

    fn seed(cache: &SharedCache, key: CacheKey, msg: Message, expiration: SystemTime) {
        let mut slot = cache.slot_mut();
        if slot.store.is_none() {
            slot.store = Some(ArcCache::new(16).expect("store"));
        }
        slot.store
            .as_ref()
            .expect("store")
            .add(key, CachedResponse { expiration, msg });
    }

    #[test]
    fn fresh_hit_delivers_synth_with_decayed_ttl() {
        let cache = SharedCache::new();
        let cached = answer_msg("example.com.", 300);
        seed(
            &cache,
            key_of(&cached),
            cached,
            SystemTime::now() + Duration::from_secs(200),
        );

        let req = query_msg("EXAMPLE.com.", RecordType::A);
        let mut st = state(false);
        eval_query(&cache, &mut st, &req);

        assert_eq!(st.action, Action::Synth);
        assert!(st.cache_hit);
        assert!((199..=200).contains(&st.cached_ttl));

        let synth = st.synth_response.expect("synth");
        assert_eq!(synth.id(), req.id());
        assert_eq!(synth.message_type(), MessageType::Response);
        // the requester's question is substituted, case preserved
        assert_eq!(synth.queries(), req.queries());
        let ttl = synth.answers()[0].ttl();
        assert!((199..=200).contains(&i64::from(ttl)));
    }

    #[test]
    fn miss_leaves_state_untouched() {
        let cache = SharedCache::new();
        let req = query_msg("example.com.", RecordType::A);
        let mut st = state(false);
        eval_query(&cache, &mut st, &req);
        assert_eq!(st.action, Action::None);
        assert!(!st.cache_hit);
        assert!(st.synth_response.is_none());
    }

    #[test]
    fn stale_without_forced_policy_is_stashed_only() {
        let cache = SharedCache::new();
        let cached = answer_msg("example.com.", 300);
        seed(
            &cache,
            key_of(&cached),
            cached,
            SystemTime::now() - Duration::from_secs(30),
        );

        let req = query_msg("example.com.", RecordType::A);
        let mut st = state(false);
        eval_query(&cache, &mut st, &req);

        assert_eq!(st.action, Action::None);
        assert!(!st.cache_hit);
        assert!(st.session_data.contains_key(SESSION_STALE));
    }

    #[test]
    fn forced_stale_is_delivered_with_zero_ttl() {
        let cache = SharedCache::new();
        let cached = answer_msg("example.com.", 300);
        seed(
            &cache,
            key_of(&cached),
            cached,
            SystemTime::now() - Duration::from_secs(30),
        );

        let req = query_msg("example.com.", RecordType::A);
        let mut st = state(true);
        eval_query(&cache, &mut st, &req);

        assert_eq!(st.action, Action::Synth);
        assert!(st.cache_hit);
        assert!(st.force_request);
        assert!(st.cached_ttl <= 0);
        let synth = st.synth_response.expect("synth");
        assert_eq!(synth.answers()[0].ttl(), 0);
    }

    #[test]
    fn forced_stale_respects_the_age_window() {
        let cache = SharedCache::new();
        let cached = answer_msg("example.com.", 300);
        seed(
            &cache,
            key_of(&cached),
            cached,
            SystemTime::now() - Duration::from_secs(100),
        );

        let req = query_msg("example.com.", RecordType::A);
        let mut st = state(true);
        st.cache_forced_max_ttl = Duration::from_secs(50);
        eval_query(&cache, &mut st, &req);

        assert_eq!(st.action, Action::None);
        assert!(!st.force_request);
        assert!(st.session_data.contains_key(SESSION_STALE));
    }

    #[test]
    fn forced_stale_served_at_most_once_per_request() {
        let cache = SharedCache::new();
        let cached = answer_msg("example.com.", 300);
        seed(
            &cache,
            key_of(&cached),
            cached,
            SystemTime::now() - Duration::from_secs(30),
        );

        let req = query_msg("example.com.", RecordType::A);
        let mut st = state(true);
        st.force_request = true;
        eval_query(&cache, &mut st, &req);

        assert_eq!(st.action, Action::None);
        assert!(st.session_data.contains_key(SESSION_STALE));
    }

    #[test]
    fn esni_names_are_never_served_forced_stale() {
        let cache = SharedCache::new();
        let mut cached = query_msg("_esni.example.com.", RecordType::TXT);
        cached.set_message_type(MessageType::Response);
        seed(
            &cache,
            key_of(&cached),
            cached,
            SystemTime::now() - Duration::from_secs(60),
        );

        let req = query_msg("_esni.example.com.", RecordType::TXT);
        let mut st = state(true);
        eval_query(&cache, &mut st, &req);

        assert_eq!(st.action, Action::None);
        assert!(!st.force_request);
        assert!(st.session_data.contains_key(SESSION_STALE));
    }

    #[test]
    fn reader_steps_aside_for_flush_sentinel() {
        let cache = SharedCache::new();
        let name = Name::from_labels(vec![&b"flush@example"[..], &b"com"[..]]).expect("name");
        let mut req = Message::new();
        let mut query = Query::new();
        query.set_name(name);
        query.set_query_type(RecordType::A);
        query.set_query_class(DNSClass::IN);
        req.add_query(query);

        let mut st = state(false);
        eval_query(&cache, &mut st, &req);
        assert_eq!(st.action, Action::None);
        assert!(st.session_data.is_empty());
    }

    #[test]
    fn writer_admits_and_clamps_outbound_ttls() {
        let cache = SharedCache::new();
        let mut resp = answer_msg("example.com.", 300);
        let key = key_of(&resp);
        let mut st = state(false);

        eval_response(&cache, &mut st, &mut resp);

        assert_eq!(st.cached_ttl, 300);
        let slot = cache.slot();
        let store = slot.store.as_ref().expect("store created lazily");
        let entry = store.peek(&key).expect("admitted");
        let left = entry
            .expiration
            .duration_since(SystemTime::now())
            .unwrap_or_default()
            .as_secs();
        assert!((299..=300).contains(&left));
        // outbound TTLs were rewritten against the same expiration
        assert!((299..=300).contains(&u64::from(resp.answers()[0].ttl())));
    }

    #[test]
    fn writer_clamps_negative_answers_up_to_the_floor() {
        let cache = SharedCache::new();
        let mut resp = nxdomain_msg("no.example.", 30);
        let key = key_of(&resp);
        let mut st = state(false);

        eval_response(&cache, &mut st, &mut resp);

        assert_eq!(st.cached_ttl, 60);
        let slot = cache.slot();
        let entry = slot
            .store
            .as_ref()
            .expect("store")
            .peek(&key)
            .expect("admitted");
        let left = entry
            .expiration
            .duration_since(SystemTime::now())
            .unwrap_or_default()
            .as_secs();
        assert!((59..=60).contains(&left));
    }

    #[test]
    fn writer_skips_truncated_responses() {
        let cache = SharedCache::new();
        let mut resp = answer_msg("example.com.", 300);
        resp.set_truncated(true);
        let mut st = state(false);

        eval_response(&cache, &mut st, &mut resp);
        assert!(cache.slot().store.is_none());
    }

    #[test]
    fn writer_skips_inadmissible_rcodes() {
        let cache = SharedCache::new();
        let mut resp = answer_msg("example.com.", 300);
        resp.set_response_code(ResponseCode::ServFail);
        let mut st = state(false);

        eval_response(&cache, &mut st, &mut resp);
        assert!(cache.slot().store.is_none());
    }

    #[test]
    fn writer_flush_evicts_the_stripped_name() {
        let cache = SharedCache::new();
        let cached = answer_msg("example.com.", 300);
        let key = key_of(&cached);
        seed(
            &cache,
            key,
            cached,
            SystemTime::now() + Duration::from_secs(300),
        );

        let sentinel =
            Name::from_labels(vec![&b"flush@example"[..], &b"com"[..]]).expect("name");
        let mut resp = Message::new();
        resp.set_message_type(MessageType::Response);
        let mut query = Query::new();
        query.set_name(sentinel.clone());
        query.set_query_type(RecordType::A);
        query.set_query_class(DNSClass::IN);
        resp.add_query(query);

        let mut st = state(false);
        eval_response(&cache, &mut st, &mut resp);

        assert_eq!(st.action, Action::Flush);
        let slot = cache.slot();
        assert!(!slot.store.as_ref().expect("store").contains(&key));
        // the sentinel qname itself is left untouched on the message
        assert_eq!(resp.queries()[0].name(), &sentinel);
    }

    #[test]
    fn writer_clears_the_stale_served_marker() {
        let cache = SharedCache::new();
        let mut resp = answer_msg("example.com.", 300);
        let mut st = state(true);
        st.force_request = true;

        eval_response(&cache, &mut st, &mut resp);
        assert!(!st.force_request);
    }

    #[test]
    fn writer_aligns_stored_do_bit_with_request() {
        let cache = SharedCache::new();
        let mut resp = answer_msg("example.com.", 300);
        let mut st = state(false);
        st.dnssec = true;

        eval_response(&cache, &mut st, &mut resp);

        let name = Name::from_str("example.com.").expect("name");
        let key = cache_key_for(&name, RecordType::A, DNSClass::IN, true).expect("key");
        let slot = cache.slot();
        let entry = slot
            .store
            .as_ref()
            .expect("store")
            .peek(&key)
            .expect("admitted under the dnssec key");
        // the packed message reconstructs the same key on load
        assert_eq!(compute_cache_key(None, &entry.msg), Some(key));
    }

    #[test]
    fn flushed_entry_misses_afterwards() {
        let cache = SharedCache::new();
        let cached = answer_msg("example.com.", 300);
        let key = key_of(&cached);
        seed(
            &cache,
            key,
            cached,
            SystemTime::now() + Duration::from_secs(300),
        );

        let sentinel =
            Name::from_labels(vec![&b"flush@example"[..], &b"com"[..]]).expect("name");
        let mut resp = Message::new();
        resp.set_message_type(MessageType::Response);
        let mut query = Query::new();
        query.set_name(sentinel);
        query.set_query_type(RecordType::A);
        query.set_query_class(DNSClass::IN);
        resp.add_query(query);
        let mut st = state(false);
        eval_response(&cache, &mut st, &mut resp);

        let req = query_msg("example.com.", RecordType::A);
        let mut st2 = state(false);
        eval_query(&cache, &mut st2, &req);
        assert_eq!(st2.action, Action::None);
        assert!(!st2.cache_hit);
    }
}
