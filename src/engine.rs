use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use arc_swap::ArcSwap;
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cache;
use crate::config::ProxyConfig;
use crate::key::{compute_cache_key, CacheKey};
use crate::state::{Action, RequestState, SESSION_STALE};
use crate::store::SharedCache;

/// The query pipeline: parse → cache reader → upstream → cache writer.
/// Clones are cheap; workers and connection handlers each hold one.
#[derive(Clone)]
pub struct Engine {
    config: Arc<ArcSwap<ProxyConfig>>,
    cache: Arc<SharedCache>,
}

/// Keeps the fingerprint in the fetch-dedup set while the upstream
/// resolve is in flight, whatever path the request takes out.
struct FetchGuard {
    cache: Arc<SharedCache>,
    key: CacheKey,
}

impl FetchGuard {
    fn new(cache: Arc<SharedCache>, key: CacheKey) -> Self {
        cache.begin_fetch(key);
        Self { cache, key }
    }
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        self.cache.end_fetch(&self.key);
    }
}

impl Engine {
    pub fn new(config: Arc<ArcSwap<ProxyConfig>>, cache: Arc<SharedCache>) -> Self {
        Self { config, cache }
    }

    pub async fn handle_packet(&self, packet: &[u8], peer: SocketAddr) -> anyhow::Result<Bytes> {
        let start = std::time::Instant::now();
        let cfg = self.config.load();

        let req = Message::from_bytes(packet).context("parse request")?;
        let Some(query) = req.queries().first() else {
            return build_response(&req, ResponseCode::FormErr);
        };
        let qname = query.name().to_string();
        let qtype = query.query_type();

        let dnssec = req.edns().map(|edns| edns.dnssec_ok()).unwrap_or(false);
        let mut state = RequestState::new(&cfg, dnssec);

        cache::eval_query(&self.cache, &mut state, &req);
        if state.action == Action::Synth {
            if let Some(synth) = state.synth_response.take() {
                let bytes = synth.to_bytes().context("emit synthetic response")?;
                let latency = start.elapsed();
                info!(
                    event = "dns_response",
                    upstream = "-",
                    qname = %qname,
                    qtype = ?qtype,
                    rcode = ?synth.response_code(),
                    latency_ms = latency.as_millis() as u64,
                    client_ip = %peer.ip(),
                    cache = true,
                    forced = state.force_request,
                    cached_ttl = state.cached_ttl,
                    "cache hit"
                );
                return Ok(Bytes::from(bytes));
            }
        }

        // 上游解析期间登记去重指纹 / register the fingerprint while the upstream resolve is in flight
        let _fetch_guard = compute_cache_key(Some(&state), &req)
            .map(|key| FetchGuard::new(Arc::clone(&self.cache), key));

        let upstream = cfg.settings.default_upstream.clone();
        let upstream_timeout = cfg.upstream_timeout();
        let raw = match self
            .forward_upstream(packet, &upstream, upstream_timeout)
            .await
        {
            Ok(raw) => raw,
            Err(err) => {
                warn!(
                    event = "dns_response",
                    upstream = %upstream,
                    qname = %qname,
                    qtype = ?qtype,
                    rcode = ?ResponseCode::ServFail,
                    client_ip = %peer.ip(),
                    error = %err,
                    "upstream failed"
                );
                return build_response(&req, ResponseCode::ServFail);
            }
        };

        let mut resp = match Message::from_bytes(&raw) {
            Ok(resp) => resp,
            Err(err) => {
                warn!(
                    event = "dns_response",
                    upstream = %upstream,
                    qname = %qname,
                    qtype = ?qtype,
                    error = %err,
                    "unparsable upstream response"
                );
                return build_response(&req, ResponseCode::ServFail);
            }
        };

        cache::eval_response(&self.cache, &mut state, &mut resp);

        let bytes = resp.to_bytes().context("emit response")?;
        let latency = start.elapsed();
        info!(
            event = "dns_response",
            upstream = %upstream,
            qname = %qname,
            qtype = ?qtype,
            rcode = ?resp.response_code(),
            latency_ms = latency.as_millis() as u64,
            client_ip = %peer.ip(),
            cache = false,
            flush = state.action == Action::Flush,
            stale = state.session_data.contains_key(SESSION_STALE),
            cached_ttl = state.cached_ttl,
            "forwarded"
        );
        Ok(Bytes::from(bytes))
    }

    /// UDP with a hedged retry, then a TCP fallback for tail latency.
    async fn forward_upstream(
        &self,
        packet: &[u8],
        upstream: &str,
        timeout_dur: Duration,
    ) -> anyhow::Result<Bytes> {
        let hedge_timeout = timeout_dur
            .checked_div(2)
            .unwrap_or_else(|| Duration::from_millis(50).max(timeout_dur));
        let attempts = [hedge_timeout, timeout_dur];

        for (idx, dur) in attempts.iter().enumerate() {
            match forward_udp(packet, upstream, *dur).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) => {
                    debug!(
                        event = "udp_forward_retry",
                        upstream = %upstream,
                        attempt = idx + 1,
                        timeout_ms = dur.as_millis() as u64,
                        error = %err,
                        "udp forward attempt failed",
                    );
                    if idx + 1 == attempts.len() {
                        debug!(event = "udp_forward_fallback_tcp", upstream = %upstream, "falling back to tcp");
                        return forward_tcp(packet, upstream, timeout_dur).await;
                    }
                }
            }
        }

        anyhow::bail!("udp forward failed")
    }
}

async fn forward_udp(packet: &[u8], upstream: &str, timeout_dur: Duration) -> anyhow::Result<Bytes> {
    // A fresh socket per attempt: the kernel demultiplexes for us and a
    // stray late answer cannot land on a reused port.
    let sock = UdpSocket::bind("0.0.0.0:0").await.context("bind")?;
    let addr: SocketAddr = upstream.parse().context("invalid upstream address")?;
    sock.connect(addr).await?;
    sock.send(packet).await?;

    let mut buf = [0u8; 4096];
    let recv_res = timeout(timeout_dur, async {
        loop {
            let size = sock.recv(&mut buf).await?;
            if size >= 2 && packet.len() >= 2 && (buf[0] != packet[0] || buf[1] != packet[1]) {
                // not our transaction, keep waiting
                continue;
            }
            return Ok::<_, anyhow::Error>(Bytes::copy_from_slice(&buf[..size]));
        }
    })
    .await;

    match recv_res {
        Ok(Ok(bytes)) => Ok(bytes),
        Ok(Err(err)) => Err(err),
        Err(_) => anyhow::bail!("udp timeout"),
    }
}

async fn forward_tcp(packet: &[u8], upstream: &str, timeout_dur: Duration) -> anyhow::Result<Bytes> {
    if packet.len() > u16::MAX as usize {
        anyhow::bail!("dns packet too large for tcp");
    }

    let exchange = async {
        let mut stream = TcpStream::connect(upstream).await.context("tcp connect")?;

        let mut framed = Vec::with_capacity(2 + packet.len());
        framed.extend_from_slice(&(packet.len() as u16).to_be_bytes());
        framed.extend_from_slice(packet);
        stream.write_all(&framed).await.context("tcp write")?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await.context("tcp read len")?;
        let resp_len = u16::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; resp_len];
        stream.read_exact(&mut buf).await.context("tcp read body")?;
        Ok::<_, anyhow::Error>(Bytes::from(buf))
    };

    match timeout(timeout_dur, exchange).await {
        Ok(res) => res,
        Err(_) => anyhow::bail!("tcp timeout"),
    }
}

fn build_response(req: &Message, rcode: ResponseCode) -> anyhow::Result<Bytes> {
    let mut msg = Message::new();
    msg.set_id(req.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(req.recursion_desired());
    msg.set_recursion_available(true);
    msg.set_authoritative(false);
    msg.set_response_code(rcode);
    msg.add_queries(req.queries().iter().cloned());

    let bytes = msg.to_bytes().context("emit response")?;
    Ok(Bytes::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::time::SystemTime;

    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
    use serde_json::json;

    use crate::key::cache_key_for;
    use crate::store::{ArcCache, CachedResponse};

    fn engine_with(upstream: &str, timeout_ms: u64) -> Engine {
        let cfg: ProxyConfig = serde_json::from_value(json!({
            "settings": {
                "default_upstream": upstream,
                "upstream_timeout_ms": timeout_ms
            },
            "cache": { "size": 16 }
        }))
        .expect("config");
        Engine::new(
            Arc::new(ArcSwap::from_pointee(cfg)),
            Arc::new(SharedCache::new()),
        )
    }

    fn query_packet(name: &str) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(0x4242);
        msg.set_recursion_desired(true);
        let mut query = Query::new();
        query.set_name(Name::from_str(name).expect("name"));
        query.set_query_type(RecordType::A);
        query.set_query_class(DNSClass::IN);
        msg.add_query(query);
        msg.to_bytes().expect("emit")
    }

    fn seed_fresh(engine: &Engine, name: &str) {
        let owner = Name::from_str(name).expect("name");
        let mut cached = Message::new();
        cached.set_message_type(MessageType::Response);
        let mut query = Query::new();
        query.set_name(owner.clone());
        query.set_query_type(RecordType::A);
        query.set_query_class(DNSClass::IN);
        cached.add_query(query);
        cached.add_answer(Record::from_rdata(
            owner.clone(),
            300,
            RData::A(A(std::net::Ipv4Addr::new(192, 0, 2, 9))),
        ));

        let key = cache_key_for(&owner, RecordType::A, DNSClass::IN, false).expect("key");
        let mut slot = engine.cache.slot_mut();
        slot.store = Some(ArcCache::new(16).expect("store"));
        slot.store.as_ref().expect("store").add(
            key,
            CachedResponse {
                expiration: SystemTime::now() + Duration::from_secs(300),
                msg: cached,
            },
        );
    }

    #[tokio::test]
    async fn fresh_hit_short_circuits_without_touching_upstream() {
        // the upstream address is unroutable on purpose
        let engine = engine_with("127.0.0.1:1", 100);
        seed_fresh(&engine, "hit.example.com.");

        let packet = query_packet("hit.example.com.");
        let peer: SocketAddr = "127.0.0.1:53000".parse().expect("peer");
        let raw = engine.handle_packet(&packet, peer).await.expect("response");

        let resp = Message::from_bytes(&raw).expect("parse");
        assert_eq!(resp.id(), 0x4242);
        assert_eq!(resp.message_type(), MessageType::Response);
        assert_eq!(resp.answers().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_upstream_yields_servfail() {
        let engine = engine_with("127.0.0.1:1", 100);

        let packet = query_packet("miss.example.com.");
        let peer: SocketAddr = "127.0.0.1:53000".parse().expect("peer");
        let raw = engine.handle_packet(&packet, peer).await.expect("response");

        let resp = Message::from_bytes(&raw).expect("parse");
        assert_eq!(resp.id(), 0x4242);
        assert_eq!(resp.response_code(), ResponseCode::ServFail);
    }

    #[tokio::test]
    async fn question_less_requests_get_formerr() {
        let engine = engine_with("127.0.0.1:1", 100);
        let packet = Message::new().to_bytes().expect("emit");
        let peer: SocketAddr = "127.0.0.1:53000".parse().expect("peer");
        let raw = engine.handle_packet(&packet, peer).await.expect("response");

        let resp = Message::from_bytes(&raw).expect("parse");
        assert_eq!(resp.response_code(), ResponseCode::FormErr);
    }

    #[tokio::test]
    async fn fetch_guard_tracks_inflight_membership() {
        let cache = Arc::new(SharedCache::new());
        let name = Name::from_str("guard.example.com.").expect("name");
        let key = cache_key_for(&name, RecordType::A, DNSClass::IN, false).expect("key");

        {
            let _guard = FetchGuard::new(Arc::clone(&cache), key);
            assert!(cache.slot().fetching.contains(&key));
        }
        assert!(!cache.slot().fetching.contains(&key));
    }
}
