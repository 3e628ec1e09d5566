use std::collections::HashMap;
use std::time::Duration;

use hickory_proto::op::Message;

use crate::config::ProxyConfig;
use crate::ttl::TtlBounds;

/// Session key under which the reader stashes an expired synthetic
/// response for the query-log layer.
pub const SESSION_STALE: &str = "stale";

/// What the cache decided for this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    #[default]
    None,
    /// A synthetic response was installed; the pipeline short-circuits.
    Synth,
    /// A flush sentinel evicted an entry on the response path.
    Flush,
}

/// Per-request state threaded through the query pipeline. The cache
/// reads the policy fields and writes back its verdict; nothing here is
/// ever shared across requests.
#[derive(Debug)]
pub struct RequestState {
    /// DO bit of the request, parsed once up front.
    pub dnssec: bool,
    pub cache_forced: bool,
    /// Zero means the forced-stale window is unbounded.
    pub cache_forced_max_ttl: Duration,
    /// Set when a stale entry has already been served forced on this
    /// request path; a successful refresh clears it.
    pub force_request: bool,
    pub flush_enabled: bool,
    pub cache_min_ttl: u32,
    pub cache_max_ttl: u32,
    pub cache_neg_min_ttl: u32,
    pub cache_neg_max_ttl: u32,
    pub cache_size: usize,
    pub cache_persistent: bool,
    pub cache_filename: String,

    pub action: Action,
    pub cache_hit: bool,
    /// Seconds until the cached entry expires, negative when a stale
    /// entry was delivered forced.
    pub cached_ttl: i64,
    pub synth_response: Option<Message>,
    pub session_data: HashMap<&'static str, Message>,
}

impl RequestState {
    pub fn new(cfg: &ProxyConfig, dnssec: bool) -> Self {
        Self {
            dnssec,
            cache_forced: cfg.cache.forced,
            cache_forced_max_ttl: Duration::from_secs(cfg.cache.forced_max_ttl),
            force_request: false,
            flush_enabled: cfg.cache.flush_enabled,
            cache_min_ttl: cfg.cache.min_ttl,
            cache_max_ttl: cfg.cache.max_ttl,
            cache_neg_min_ttl: cfg.cache.neg_min_ttl,
            cache_neg_max_ttl: cfg.cache.neg_max_ttl,
            cache_size: cfg.cache.size,
            cache_persistent: cfg.cache.persistent,
            cache_filename: cfg.cache.file.clone(),
            action: Action::None,
            cache_hit: false,
            cached_ttl: 0,
            synth_response: None,
            session_data: HashMap::new(),
        }
    }

    pub fn ttl_bounds(&self) -> TtlBounds {
        TtlBounds {
            min_ttl: self.cache_min_ttl,
            max_ttl: self.cache_max_ttl,
            neg_min_ttl: self.cache_neg_min_ttl,
            neg_max_ttl: self.cache_neg_max_ttl,
        }
    }
}
