//! Postcard-based snapshot encoding with a versioned envelope.
//!
//! Cache snapshots let a process restart without re-paying for answers it
//! already holds. Every snapshot has this layout:
//!
//! ```text
//! ┌─────────────────┬─────────────────┬──────────────────────────┐
//! │  MAGIC (4 bytes)│VERSION (varint) │POSTCARD PAYLOAD (N bytes)│
//! └─────────────────┴─────────────────┴──────────────────────────┘
//!   "LCKS"              u32                postcard::to_allocvec(T)
//! ```
//!
//! A bad magic or a different schema version rejects the whole snapshot;
//! entries are never migrated in place.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Magic header for snapshots: b"LCKS"
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"LCKS";

/// Current snapshot schema version.
///
/// Increment when `CacheEntry`, `CanonicalRequest`, or `ModelResponse`
/// change shape.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Versioned envelope around a snapshot payload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SnapshotEnvelope<T> {
    pub magic: [u8; 4],
    pub version: u32,
    pub payload: T,
}

impl<T> SnapshotEnvelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            magic: SNAPSHOT_MAGIC,
            version: SNAPSHOT_SCHEMA_VERSION,
            payload,
        }
    }
}

/// Encode a value inside the snapshot envelope.
///
/// # Errors
///
/// Returns `Error::SerializationError` if Postcard serialization fails.
pub fn encode_snapshot<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(&SnapshotEnvelope::new(value)).map_err(|e| {
        error!("Snapshot serialization failed: {}", e);
        Error::SerializationError(e.to_string())
    })
}

/// Decode a value from a snapshot, validating magic and version.
///
/// # Errors
///
/// - `Error::InvalidCacheEntry`: Invalid magic header
/// - `Error::VersionMismatch`: Schema version mismatch
/// - `Error::DeserializationError`: Corrupted Postcard payload
pub fn decode_snapshot<'de, T: Deserialize<'de>>(bytes: &'de [u8]) -> Result<T> {
    let envelope: SnapshotEnvelope<T> = postcard::from_bytes(bytes).map_err(|e| {
        error!("Snapshot deserialization failed: {}", e);
        Error::DeserializationError(e.to_string())
    })?;

    if envelope.magic != SNAPSHOT_MAGIC {
        warn!(
            "Invalid snapshot: expected magic {:?}, got {:?}",
            SNAPSHOT_MAGIC, envelope.magic
        );
        return Err(Error::InvalidCacheEntry(format!(
            "Invalid magic: expected {:?}, got {:?}",
            SNAPSHOT_MAGIC, envelope.magic
        )));
    }

    if envelope.version != SNAPSHOT_SCHEMA_VERSION {
        warn!(
            "Snapshot version mismatch: expected {}, got {}",
            SNAPSHOT_SCHEMA_VERSION, envelope.version
        );
        return Err(Error::VersionMismatch {
            expected: SNAPSHOT_SCHEMA_VERSION,
            found: envelope.version,
        });
    }

    Ok(envelope.payload)
}
