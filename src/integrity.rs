//! Context-log integrity hashing
//!
//! Every appended entry carries a hash over its immutable fields so that
//! tests and auditors can detect any later mutation of the log.

use crate::models::{ContextEntry, EntryStatus, StageName};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::Write;

#[derive(Serialize)]
struct HashedFields<'a> {
    stage: StageName,
    attempt: u32,
    status: EntryStatus,
    payload: &'a serde_json::Value,
}

/// Compute the SHA-256 hash of an entry's immutable fields.
/// Uses zero-copy streaming serialization into the hasher.
pub fn entry_hash(
    stage: StageName,
    attempt: u32,
    status: EntryStatus,
    payload: &serde_json::Value,
) -> String {
    let fields = HashedFields {
        stage,
        attempt,
        status,
        payload,
    };

    let mut hasher = Sha256::new();
    if serde_json::to_writer(&mut HashWriter(&mut hasher), &fields).is_err() {
        return String::new();
    }
    hex::encode(hasher.finalize())
}

/// Re-hash an entry and compare against the hash stored at append time.
pub fn verify_entry(entry: &ContextEntry) -> bool {
    entry_hash(entry.stage, entry.attempt, entry.status, &entry.payload) == entry.integrity_hash
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_entry() -> ContextEntry {
        let payload = serde_json::json!({"metric": 42.0});
        let hash = entry_hash(StageName::Quant, 1, EntryStatus::Success, &payload);
        ContextEntry {
            entry_id: Uuid::new_v4(),
            stage: StageName::Quant,
            attempt: 1,
            status: EntryStatus::Success,
            payload,
            limitations: vec![],
            created_at: Utc::now(),
            integrity_hash: hash,
        }
    }

    #[test]
    fn unmodified_entry_verifies() {
        assert!(verify_entry(&sample_entry()));
    }

    #[test]
    fn payload_mutation_is_detected() {
        let mut entry = sample_entry();
        entry.payload = serde_json::json!({"metric": 43.0});
        assert!(!verify_entry(&entry));
    }

    #[test]
    fn hash_is_deterministic() {
        let payload = serde_json::json!({"a": 1, "b": [1.5, 2.5]});
        let h1 = entry_hash(StageName::Research, 2, EntryStatus::Success, &payload);
        let h2 = entry_hash(StageName::Research, 2, EntryStatus::Success, &payload);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }
}
