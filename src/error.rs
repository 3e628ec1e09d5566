use std::io;

use thiserror::Error;

/// Errors surfaced by the cache subsystem. The query path never
/// propagates these to a client; on any internal failure the cache
/// behaves as if the entry were absent.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Invalid configuration, fatal at init.
    #[error("cache size must be positive")]
    InvalidCapacity,

    /// Snapshot header carries a protocol version we do not speak.
    #[error("unknown cache file protocol version [{0}]")]
    UnsupportedVersion(u32),

    /// Malformed header, truncated record or unpack failure mid-payload.
    /// Entries admitted before the failure stay in the store.
    #[error("corrupt cache snapshot: {0}")]
    CorruptSnapshot(String),

    /// DNS wire re-serialization failed for a single entry during save.
    #[error("failed to pack dns message: {0}")]
    Pack(#[source] hickory_proto::error::ProtoError),

    /// Filesystem failure during load or save.
    #[error(transparent)]
    Io(#[from] io::Error),
}
