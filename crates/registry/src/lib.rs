//! Per-file session registry for the storage node.
//!
//! Tracks, per file id, the highest contiguous byte offset durably
//! persisted. The persisted offset is monotonic: it never decreases, is
//! never rolled back, and sessions disappear only on acknowledged
//! completion, explicit cancellation, or inactivity expiry.
//!
//! The registry is pure in-memory state; the storage node re-derives lost
//! entries from the blob store, so expiry never loses durable bytes.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// How an incoming chunk relates to a session's persisted offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkDisposition {
    /// `offset < persisted`: already received in a prior attempt. Ignore:
    /// do not re-persist, do not error the stream.
    Duplicate,
    /// `offset == persisted` and the chunk fits within the file size: the
    /// next expected chunk.
    InSequence,
    /// `offset > persisted`: a hole in the byte sequence. Protocol
    /// violation; the stream must be aborted.
    Gap,
    /// The chunk would extend past the declared file size.
    Overrun,
}

/// Errors produced by the registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown file: {0}")]
    UnknownFile(String),

    #[error("declared size {given} does not match session size {known} for {file_id}")]
    SizeMismatch {
        file_id: String,
        known: i64,
        given: i64,
    },

    #[error("offset regression for {file_id}: {persisted} -> {requested}")]
    OffsetRegression {
        file_id: String,
        persisted: i64,
        requested: i64,
    },

    #[error("offset {requested} exceeds size {size} for {file_id}")]
    OffsetBeyondSize {
        file_id: String,
        requested: i64,
        size: i64,
    },

    #[error("upload incomplete for {file_id}: {persisted} of {size} bytes persisted")]
    Incomplete {
        file_id: String,
        persisted: i64,
        size: i64,
    },
}

struct Session {
    size_bytes: i64,
    persisted_offset: i64,
    updated_at: Instant,
}

/// Registry of active upload sessions, keyed by file id.
///
/// Safe for concurrent use: uploads of different files never interfere, and
/// for a single file the protocol guarantees at most one active writer (a
/// superseding connection cancels its predecessor before streaming).
pub struct SessionRegistry {
    inner: RwLock<HashMap<String, Session>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Opens (or re-opens) a session and returns its persisted offset.
    ///
    /// `recovered_offset` is the offset re-derived from durable storage; it
    /// seeds a session the registry has never seen (or has expired). An
    /// existing entry wins; its offset is already authoritative.
    pub fn open(
        &self,
        file_id: &str,
        size_bytes: i64,
        recovered_offset: i64,
    ) -> Result<i64, RegistryError> {
        let mut map = self.inner.write().unwrap();
        if let Some(session) = map.get_mut(file_id) {
            if session.size_bytes != size_bytes {
                return Err(RegistryError::SizeMismatch {
                    file_id: file_id.to_string(),
                    known: session.size_bytes,
                    given: size_bytes,
                });
            }
            session.updated_at = Instant::now();
            return Ok(session.persisted_offset);
        }

        let persisted = recovered_offset.clamp(0, size_bytes);
        map.insert(
            file_id.to_string(),
            Session {
                size_bytes,
                persisted_offset: persisted,
                updated_at: Instant::now(),
            },
        );
        tracing::debug!(file_id, persisted, size_bytes, "session opened");
        Ok(persisted)
    }

    /// Classifies an incoming chunk against the session's persisted offset.
    pub fn classify(
        &self,
        file_id: &str,
        offset: i64,
        len: usize,
    ) -> Result<ChunkDisposition, RegistryError> {
        let map = self.inner.read().unwrap();
        let session = map
            .get(file_id)
            .ok_or_else(|| RegistryError::UnknownFile(file_id.to_string()))?;

        Ok(if offset < session.persisted_offset {
            ChunkDisposition::Duplicate
        } else if offset > session.persisted_offset {
            ChunkDisposition::Gap
        } else if offset + len as i64 > session.size_bytes {
            ChunkDisposition::Overrun
        } else {
            ChunkDisposition::InSequence
        })
    }

    /// Advances the persisted offset after a durable write.
    ///
    /// The offset is monotonic: regressions are rejected, as is any advance
    /// past the declared size.
    pub fn advance(&self, file_id: &str, new_offset: i64) -> Result<(), RegistryError> {
        let mut map = self.inner.write().unwrap();
        let session = map
            .get_mut(file_id)
            .ok_or_else(|| RegistryError::UnknownFile(file_id.to_string()))?;

        if new_offset < session.persisted_offset {
            return Err(RegistryError::OffsetRegression {
                file_id: file_id.to_string(),
                persisted: session.persisted_offset,
                requested: new_offset,
            });
        }
        if new_offset > session.size_bytes {
            return Err(RegistryError::OffsetBeyondSize {
                file_id: file_id.to_string(),
                requested: new_offset,
                size: session.size_bytes,
            });
        }
        session.persisted_offset = new_offset;
        session.updated_at = Instant::now();
        Ok(())
    }

    /// Returns the persisted offset for a file, if a session exists.
    pub fn offset(&self, file_id: &str) -> Option<i64> {
        let map = self.inner.read().unwrap();
        map.get(file_id).map(|s| s.persisted_offset)
    }

    /// Completes an upload: succeeds only when every byte is persisted, and
    /// removes the session entry. Returns the final offset.
    pub fn complete(&self, file_id: &str) -> Result<i64, RegistryError> {
        let mut map = self.inner.write().unwrap();
        let session = map
            .get(file_id)
            .ok_or_else(|| RegistryError::UnknownFile(file_id.to_string()))?;

        if session.persisted_offset != session.size_bytes {
            return Err(RegistryError::Incomplete {
                file_id: file_id.to_string(),
                persisted: session.persisted_offset,
                size: session.size_bytes,
            });
        }
        let final_offset = session.persisted_offset;
        map.remove(file_id);
        tracing::info!(file_id, bytes = final_offset, "upload complete");
        Ok(final_offset)
    }

    /// Drops a session without completing it (explicit cancellation).
    pub fn remove(&self, file_id: &str) {
        let mut map = self.inner.write().unwrap();
        if map.remove(file_id).is_some() {
            tracing::debug!(file_id, "session removed");
        }
    }

    /// Removes sessions idle for longer than `ttl`. Returns how many were
    /// evicted.
    pub fn purge_expired(&self, ttl: Duration) -> usize {
        let mut map = self.inner.write().unwrap();
        let before = map.len();
        map.retain(|file_id, session| {
            let keep = session.updated_at.elapsed() < ttl;
            if !keep {
                tracing::info!(
                    file_id = %file_id,
                    persisted = session.persisted_offset,
                    "session expired"
                );
            }
            keep
        });
        before - map.len()
    }

    /// Number of active sessions.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_new_session_starts_at_recovered_offset() {
        let registry = SessionRegistry::new();
        let offset = registry.open("f-1", 1000, 0).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(registry.offset("f-1"), Some(0));
    }

    #[test]
    fn open_recovers_offset_from_store() {
        let registry = SessionRegistry::new();
        let offset = registry.open("f-1", 1000, 600).unwrap();
        assert_eq!(offset, 600);
    }

    #[test]
    fn open_clamps_recovered_offset_to_size() {
        let registry = SessionRegistry::new();
        // A blob longer than the declared size cannot yield a resume point
        // past the end of the file.
        let offset = registry.open("f-1", 1000, 4096).unwrap();
        assert_eq!(offset, 1000);
    }

    #[test]
    fn reopen_keeps_existing_offset() {
        let registry = SessionRegistry::new();
        registry.open("f-1", 1000, 0).unwrap();
        registry.advance("f-1", 500).unwrap();

        // A reconnect passes a stale recovered offset; the live entry wins.
        let offset = registry.open("f-1", 1000, 0).unwrap();
        assert_eq!(offset, 500);
    }

    #[test]
    fn reopen_with_different_size_rejected() {
        let registry = SessionRegistry::new();
        registry.open("f-1", 1000, 0).unwrap();
        let result = registry.open("f-1", 2000, 0);
        assert!(matches!(result, Err(RegistryError::SizeMismatch { .. })));
    }

    #[test]
    fn classify_in_sequence() {
        let registry = SessionRegistry::new();
        registry.open("f-1", 1000, 0).unwrap();
        assert_eq!(
            registry.classify("f-1", 0, 100).unwrap(),
            ChunkDisposition::InSequence
        );
    }

    #[test]
    fn classify_duplicate_below_persisted() {
        let registry = SessionRegistry::new();
        registry.open("f-1", 1000, 0).unwrap();
        registry.advance("f-1", 300).unwrap();
        assert_eq!(
            registry.classify("f-1", 200, 100).unwrap(),
            ChunkDisposition::Duplicate
        );
        assert_eq!(
            registry.classify("f-1", 0, 100).unwrap(),
            ChunkDisposition::Duplicate
        );
    }

    #[test]
    fn classify_gap_above_persisted() {
        let registry = SessionRegistry::new();
        registry.open("f-1", 1000, 0).unwrap();
        assert_eq!(
            registry.classify("f-1", 100, 100).unwrap(),
            ChunkDisposition::Gap
        );
    }

    #[test]
    fn classify_overrun_past_size() {
        let registry = SessionRegistry::new();
        registry.open("f-1", 150, 0).unwrap();
        assert_eq!(
            registry.classify("f-1", 0, 200).unwrap(),
            ChunkDisposition::Overrun
        );
    }

    #[test]
    fn classify_unknown_file() {
        let registry = SessionRegistry::new();
        assert!(matches!(
            registry.classify("nope", 0, 10),
            Err(RegistryError::UnknownFile(_))
        ));
    }

    #[test]
    fn advance_is_monotonic() {
        let registry = SessionRegistry::new();
        registry.open("f-1", 1000, 0).unwrap();
        registry.advance("f-1", 100).unwrap();
        registry.advance("f-1", 100).unwrap(); // equal is allowed
        registry.advance("f-1", 400).unwrap();

        let result = registry.advance("f-1", 200);
        assert!(matches!(
            result,
            Err(RegistryError::OffsetRegression {
                persisted: 400,
                requested: 200,
                ..
            })
        ));
        assert_eq!(registry.offset("f-1"), Some(400));
    }

    #[test]
    fn advance_past_size_rejected() {
        let registry = SessionRegistry::new();
        registry.open("f-1", 100, 0).unwrap();
        let result = registry.advance("f-1", 150);
        assert!(matches!(
            result,
            Err(RegistryError::OffsetBeyondSize { .. })
        ));
    }

    #[test]
    fn complete_requires_all_bytes() {
        let registry = SessionRegistry::new();
        registry.open("f-1", 100, 0).unwrap();
        registry.advance("f-1", 50).unwrap();

        let result = registry.complete("f-1");
        assert!(matches!(
            result,
            Err(RegistryError::Incomplete {
                persisted: 50,
                size: 100,
                ..
            })
        ));

        registry.advance("f-1", 100).unwrap();
        assert_eq!(registry.complete("f-1").unwrap(), 100);
        // Entry is gone after completion.
        assert_eq!(registry.offset("f-1"), None);
    }

    #[test]
    fn complete_zero_byte_file() {
        let registry = SessionRegistry::new();
        registry.open("f-1", 0, 0).unwrap();
        assert_eq!(registry.complete("f-1").unwrap(), 0);
    }

    #[test]
    fn remove_drops_session() {
        let registry = SessionRegistry::new();
        registry.open("f-1", 100, 0).unwrap();
        registry.remove("f-1");
        assert_eq!(registry.offset("f-1"), None);
        // Removing again is a no-op.
        registry.remove("f-1");
    }

    #[test]
    fn purge_expired_evicts_idle_sessions() {
        let registry = SessionRegistry::new();
        registry.open("f-1", 100, 0).unwrap();
        registry.open("f-2", 100, 0).unwrap();

        // Nothing is older than an hour.
        assert_eq!(registry.purge_expired(Duration::from_secs(3600)), 0);
        assert_eq!(registry.len(), 2);

        // Everything is older than zero.
        assert_eq!(registry.purge_expired(Duration::ZERO), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn purge_spares_recently_touched_sessions() {
        let registry = SessionRegistry::new();
        registry.open("f-1", 100, 0).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        registry.open("f-2", 100, 0).unwrap();

        let evicted = registry.purge_expired(Duration::from_millis(20));
        assert_eq!(evicted, 1);
        assert_eq!(registry.offset("f-1"), None);
        assert_eq!(registry.offset("f-2"), Some(0));
    }

    #[test]
    fn concurrent_files_do_not_interfere() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(SessionRegistry::new());
        let mut handles = vec![];

        for i in 0..8 {
            let r = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                let file_id = format!("f-{i}");
                r.open(&file_id, 10_000, 0).unwrap();
                for step in 1..=100 {
                    r.advance(&file_id, step * 100).unwrap();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        for i in 0..8 {
            assert_eq!(registry.offset(&format!("f-{i}")), Some(10_000));
        }
    }
}
