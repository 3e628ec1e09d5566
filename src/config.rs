use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

use crate::error::CacheError;

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub settings: GlobalSettings,
    #[serde(default)]
    pub cache: CacheSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalSettings {
    /// UDP监听地址，缺省0.0.0.0:5353，避免1024以下端口权限问题。
    #[serde(default = "default_bind_udp")]
    pub bind_udp: String,
    /// TCP监听地址，缺省0.0.0.0:5353。
    #[serde(default = "default_bind_tcp")]
    pub bind_tcp: String,
    /// 默认上游DNS。
    #[serde(default = "default_upstream")]
    pub default_upstream: String,
    /// 上游超时（毫秒）。
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// Maximum live entries; fixed for the process lifetime.
    #[serde(default = "default_cache_size")]
    pub size: usize,
    /// Clamp bounds for positive answers (seconds).
    #[serde(default = "default_min_ttl")]
    pub min_ttl: u32,
    #[serde(default = "default_max_ttl")]
    pub max_ttl: u32,
    /// Clamp bounds for negative answers (seconds).
    #[serde(default = "default_neg_min_ttl")]
    pub neg_min_ttl: u32,
    #[serde(default = "default_neg_max_ttl")]
    pub neg_max_ttl: u32,
    /// Serve expired entries instead of refreshing, once per request
    /// path, within the window below.
    #[serde(default)]
    pub forced: bool,
    /// 强制陈旧响应的最大超龄秒数，0为不限制 / max post-expiration age for forced serving (seconds), 0 = unbounded
    #[serde(default)]
    pub forced_max_ttl: u64,
    /// Honor the flush\@ sentinel qname prefix.
    #[serde(default)]
    pub flush_enabled: bool,
    /// Load the snapshot on start and save it on shutdown.
    #[serde(default)]
    pub persistent: bool,
    #[serde(default = "default_cache_file")]
    pub file: String,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            bind_udp: default_bind_udp(),
            bind_tcp: default_bind_tcp(),
            default_upstream: default_upstream(),
            upstream_timeout_ms: default_upstream_timeout_ms(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            size: default_cache_size(),
            min_ttl: default_min_ttl(),
            max_ttl: default_max_ttl(),
            neg_min_ttl: default_neg_min_ttl(),
            neg_max_ttl: default_neg_max_ttl(),
            forced: false,
            forced_max_ttl: 0,
            flush_enabled: false,
            persistent: false,
            file: default_cache_file(),
        }
    }
}

impl ProxyConfig {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.upstream_timeout_ms)
    }
}

pub fn load_config(path: &Path) -> Result<ProxyConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: ProxyConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }

    // 轻量校验：缓存参数提前检查，避免运行期才失败。
    if cfg.cache.size == 0 {
        return Err(CacheError::InvalidCapacity.into());
    }
    if cfg.cache.min_ttl > cfg.cache.max_ttl {
        anyhow::bail!(
            "cache.min_ttl ({}) exceeds cache.max_ttl ({})",
            cfg.cache.min_ttl,
            cfg.cache.max_ttl
        );
    }
    if cfg.cache.neg_min_ttl > cfg.cache.neg_max_ttl {
        anyhow::bail!(
            "cache.neg_min_ttl ({}) exceeds cache.neg_max_ttl ({})",
            cfg.cache.neg_min_ttl,
            cfg.cache.neg_max_ttl
        );
    }

    Ok(cfg)
}

fn default_bind_udp() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_bind_tcp() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_upstream() -> String {
    "1.1.1.1:53".to_string()
}

fn default_upstream_timeout_ms() -> u64 {
    2000
}

fn default_cache_size() -> usize {
    4096
}

fn default_min_ttl() -> u32 {
    60
}

fn default_max_ttl() -> u32 {
    86400
}

fn default_neg_min_ttl() -> u32 {
    60
}

fn default_neg_max_ttl() -> u32 {
    600
}

fn default_cache_file() -> String {
    "vexdns.cache".to_string()
}
