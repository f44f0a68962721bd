//! Deterministic identifiers
//!
//! Three id families live here:
//! - ledger account UUIDs derived from `sha256(owner_key ":" template)`, so
//!   the same owner/template pair always lands on the same row
//! - monotonic ULIDs for ledger transactions (time-seeded, strictly
//!   increasing within one process)
//! - deterministic idempotency keys for saga actions and trust changes

use std::sync::Mutex;

use sha2::{Digest, Sha256};
use ulid::Ulid;
use uuid::Uuid;

static ULID_GENERATOR: Mutex<Option<ulid::Generator>> = Mutex::new(None);

/// Build the deterministic UUID for a ledger account.
///
/// The first 16 bytes of `sha256(owner_key ":" template)` become the UUID,
/// with the RFC 4122 version/variant bits forced so the value round-trips
/// through Postgres `uuid` columns.
pub fn account_uuid(owner_key: &str, template: &str) -> Uuid {
    let digest = Sha256::digest(format!("{owner_key}:{template}").as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    bytes[6] = (bytes[6] & 0x0f) | 0x50; // name-based version
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    Uuid::from_bytes(bytes)
}

/// Generate a process-monotonic ULID.
///
/// Within one process successive calls never regress even inside the same
/// millisecond. Cross-process ordering comes from the time seed plus the
/// per-account monotonicity check in the ledger.
pub fn new_ulid() -> Ulid {
    let mut slot = ULID_GENERATOR.lock().unwrap_or_else(|e| e.into_inner());
    let generator = slot.get_or_insert_with(ulid::Generator::new);
    match generator.generate() {
        Ok(ulid) => ulid,
        // Random-part overflow within a single millisecond; reseed.
        Err(_) => {
            *generator = ulid::Generator::new();
            Ulid::new()
        }
    }
}

/// Deterministic idempotency key for one saga action on one task.
pub fn saga_key(action: &str, task_id: &Uuid, event_id: &str) -> String {
    format!("{action}:{task_id}:{event_id}")
}

/// Deterministic idempotency key for one trust tier change.
pub fn trust_key(user_id: &Uuid, old_tier: i16, new_tier: i16, reason_ref: &str) -> String {
    format!("trust:{user_id}:{old_tier}:{new_tier}:{reason_ref}")
}

/// Hex sha256 over a raw request body, stored alongside idempotency keys so
/// a replayed key with different content is detectable.
pub fn body_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_uuid_is_deterministic() {
        let a = account_uuid("platform", "platform_cash");
        let b = account_uuid("platform", "platform_cash");
        assert_eq!(a, b);

        let c = account_uuid("platform", "platform_revenue");
        assert_ne!(a, c);
    }

    #[test]
    fn account_uuid_has_rfc4122_bits() {
        let id = account_uuid("user-1", "user_receivable");
        let bytes = id.as_bytes();
        assert_eq!(bytes[6] >> 4, 0x5);
        assert_eq!(bytes[8] >> 6, 0b10);
    }

    #[test]
    fn ulids_are_strictly_increasing() {
        let mut last = new_ulid();
        for _ in 0..1000 {
            let next = new_ulid();
            assert!(next > last, "ULID regressed: {next} <= {last}");
            last = next;
        }
    }

    #[test]
    fn saga_key_shape() {
        let task = Uuid::nil();
        assert_eq!(
            saga_key("RELEASE_PAYOUT", &task, "01ARZ3NDEKTSV4RRFFQ69G5FAV"),
            format!("RELEASE_PAYOUT:{task}:01ARZ3NDEKTSV4RRFFQ69G5FAV")
        );
    }

    #[test]
    fn body_hash_is_hex_sha256() {
        let h = body_hash(b"{}");
        assert_eq!(h.len(), 64);
        assert_eq!(h, body_hash(b"{}"));
        assert_ne!(h, body_hash(b"{ }"));
    }
}
