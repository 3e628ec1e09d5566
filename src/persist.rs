use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::time::{Instant, SystemTime};

use chrono::{DateTime, Utc};
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::error::CacheError;
use crate::key::compute_cache_key;
use crate::store::{ArcCache, CachedResponse, SharedCache};

pub const PROTO_VERSION: u32 = 1;

const DESCRIPTION: &str =
    "vexdns cache snapshot. All data after the first line is binary (MessagePack records)";
const LINKS: &[&str] = &["https://github.com/vexdns/vexdns"];

/// Snapshot header: a single line of JSON terminated by `\n`, followed
/// by the binary payload until EOF.
#[derive(Debug, Serialize, Deserialize)]
pub struct CacheFileHeader {
    pub description: String,
    pub app_name: String,
    pub app_version: String,
    pub proto_version: u32,
    pub time_saved: DateTime<Utc>,
    pub items_count: usize,
    pub original_location: String,
    pub compressed: bool,
    pub links: Vec<String>,
}

/// One cache entry in the payload. Encoded field-tagged (MessagePack
/// named mode) so records stay self-describing and future fields do not
/// break old readers. No key is written: loaders recompute it from the
/// packet, which is what binds the snapshot to the key function.
#[derive(Debug, Serialize, Deserialize)]
pub struct SavedResponse {
    pub expiration: SystemTime,
    pub frequent: bool,
    pub packet: Vec<u8>,
}

/// Writes the snapshot for shutdown. The payload is serialized to
/// memory under the shared lock so `items_count` matches exactly what
/// follows the header; the file write happens after the lock is
/// released. Entries that fail to re-pack are skipped and logged.
pub fn save_cache(cache: &SharedCache, cfg: &ProxyConfig) -> Result<usize, CacheError> {
    let started = Instant::now();
    let path = Path::new(&cfg.cache.file);

    let (header_line, payload, items) = {
        let slot = cache.slot();
        let Some(store) = slot.store.as_ref() else {
            debug!("no cache to save");
            return Ok(0);
        };
        if store.is_empty() {
            debug!("no cache to save");
            return Ok(0);
        }

        info!(entries = store.len(), "preparing to save cached responses");

        let mut payload = Vec::new();
        let mut items = 0usize;
        for key in store.keys() {
            let Some(entry) = store.peek(&key) else {
                continue;
            };
            let packet = match entry.msg.to_bytes() {
                Ok(packet) => packet,
                Err(err) => {
                    warn!(error = %CacheError::Pack(err), "skipping unpackable cache entry");
                    continue;
                }
            };
            let saved = SavedResponse {
                expiration: entry.expiration,
                frequent: slot.fetching.contains(&key),
                packet,
            };
            rmp_serde::encode::write_named(&mut payload, &saved)
                .map_err(|err| CacheError::CorruptSnapshot(err.to_string()))?;
            items += 1;
        }

        let header = CacheFileHeader {
            description: DESCRIPTION.to_string(),
            app_name: env!("CARGO_PKG_NAME").to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            proto_version: PROTO_VERSION,
            time_saved: Utc::now(),
            items_count: items,
            original_location: path.display().to_string(),
            compressed: false,
            links: LINKS.iter().map(|link| link.to_string()).collect(),
        };
        let mut header_line = serde_json::to_vec(&header)
            .map_err(|err| CacheError::CorruptSnapshot(err.to_string()))?;
        header_line.push(b'\n');

        (header_line, payload, items)
    };

    let mut file = File::create(path)?;
    file.write_all(&header_line)?;
    file.write_all(&payload)?;

    info!(
        items,
        elapsed_ms = started.elapsed().as_millis() as u64,
        path = %path.display(),
        "cache snapshot saved"
    );
    Ok(items)
}

/// Restores the snapshot at startup, before the query path is live.
///
/// Entries are admitted when still unexpired at load time, or under
/// forced-stale policy when within the configured post-expiration
/// window. Keys are recomputed from the packed messages; a `frequent`
/// entry gets an extra probe so it lands in the ARC frequency list. On
/// a corrupt payload the entries admitted so far are kept.
pub fn load_cache(cache: &SharedCache, cfg: &ProxyConfig) -> Result<usize, CacheError> {
    let started = Instant::now();
    let load_start = SystemTime::now();
    let path = Path::new(&cfg.cache.file);

    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut header_line = Vec::new();
    reader.read_until(b'\n', &mut header_line)?;
    let header: CacheFileHeader = serde_json::from_slice(&header_line)
        .map_err(|err| CacheError::CorruptSnapshot(format!("bad header: {}", err)))?;

    if header.proto_version != PROTO_VERSION {
        return Err(CacheError::UnsupportedVersion(header.proto_version));
    }
    if header.items_count == 0 {
        return Ok(0);
    }

    info!(
        items = header.items_count,
        path = %path.display(),
        "loading cached responses"
    );

    {
        let mut slot = cache.slot_mut();
        if slot.store.is_none() {
            slot.store = Some(ArcCache::new(cfg.cache.size)?);
        }
    }

    let forced = cfg.cache.forced;
    let forced_max = std::time::Duration::from_secs(cfg.cache.forced_max_ttl);

    let mut loaded = 0usize;
    loop {
        let saved: SavedResponse = match rmp_serde::from_read(&mut reader) {
            Ok(saved) => saved,
            Err(err) if is_eof(&err) => break,
            Err(err) => {
                warn!(
                    loaded,
                    error = %err,
                    "cache snapshot corrupt mid-payload, keeping entries loaded so far"
                );
                return Err(CacheError::CorruptSnapshot(err.to_string()));
            }
        };

        let msg = match Message::from_bytes(&saved.packet) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(
                    loaded,
                    error = %err,
                    "cache snapshot holds an unparsable packet, keeping entries loaded so far"
                );
                return Err(CacheError::CorruptSnapshot(err.to_string()));
            }
        };

        if !(saved.expiration > load_start || forced) {
            continue;
        }
        if !forced_max.is_zero() && saved.expiration + forced_max < load_start {
            continue;
        }

        // the snapshot carries no key; the packet is authoritative
        let Some(key) = compute_cache_key(None, &msg) else {
            debug!("skipping snapshot entry without a question");
            continue;
        };

        let slot = cache.slot_mut();
        if let Some(store) = slot.store.as_ref() {
            if !store.contains(&key) {
                store.add(
                    key,
                    CachedResponse {
                        expiration: saved.expiration,
                        msg,
                    },
                );
                if saved.frequent {
                    // promote from the recency list, as the prefetcher
                    // would have
                    store.get(&key);
                }
                loaded += 1;
            }
        }
    }

    info!(
        loaded,
        total = header.items_count,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "loaded cached responses"
    );
    Ok(loaded)
}

/// A clean EOF at a record boundary ends the payload; anything else is
/// corruption.
fn is_eof(err: &rmp_serde::decode::Error) -> bool {
    matches!(
        err,
        rmp_serde::decode::Error::InvalidMarkerRead(io_err)
            if io_err.kind() == std::io::ErrorKind::UnexpectedEof
    )
}
