//! Deterministic identifiers: store UUIDs, HAKeeper replica IDs, instance ids.

use rand::Rng;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// First replica ID handed out to bootstrap HAKeeper members.
pub const HAKEEPER_REPLICA_ID_BASE: u64 = 131_072;
/// Exclusive upper bound of the bootstrap replica-ID range.
pub const HAKEEPER_REPLICA_ID_LIMIT: u64 = 262_144;

const SAFE_ALPHANUMS: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// UUID of the log store at `ordinal`: the ordinal as a big-endian 128-bit integer.
pub fn ordinal_uuid(ordinal: i32) -> String {
    Uuid::from_u128(ordinal.max(0) as u128).to_string()
}

/// Replica ID assigned to the bootstrap member at `ordinal`.
pub fn hakeeper_replica_id(ordinal: i32) -> Option<u64> {
    let id = HAKEEPER_REPLICA_ID_BASE.checked_add(u64::try_from(ordinal).ok()?)?;
    (id < HAKEEPER_REPLICA_ID_LIMIT).then_some(id)
}

/// Stable DNS name of a pod behind a headless service.
pub fn pod_dns_name(pod: &str, headless_service: &str, namespace: &str) -> String {
    format!("{}.{}.{}", pod, headless_service, namespace)
}

/// Store UUID of a CN pod, stable across restarts of the same pod name.
pub fn cn_store_uuid(pod: &str, headless_service: &str, namespace: &str) -> String {
    let digest = Sha256::digest(pod_dns_name(pod, headless_service, namespace).as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}

/// Unique id of a shared-storage location, used to dedup bucket claims.
pub fn bucket_unique_id(provider_type: &str, endpoint: &str, path: &str) -> String {
    let digest = Sha1::digest(format!("{}|{}|{}", provider_type, endpoint, path).as_bytes());
    hex::encode(digest)
}

/// Random five-character id safe for object names.
pub fn instance_id() -> String {
    random_string(5)
}

pub fn random_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| SAFE_ALPHANUMS[rng.gen_range(0..SAFE_ALPHANUMS.len())] as char)
        .collect()
}

/// Kubernetes-style safe encoding: every char is mapped into a vowel-free alphabet.
pub fn safe_encode(s: &str) -> String {
    s.chars()
        .map(|c| SAFE_ALPHANUMS[(c as usize) % SAFE_ALPHANUMS.len()] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordinal_uuid() {
        assert_eq!(ordinal_uuid(0), "00000000-0000-0000-0000-000000000000");
        assert_eq!(ordinal_uuid(2), "00000000-0000-0000-0000-000000000002");
        assert_eq!(ordinal_uuid(11), "00000000-0000-0000-0000-00000000000b");
    }

    #[test]
    fn test_replica_id_range() {
        assert_eq!(hakeeper_replica_id(0), Some(131_072));
        assert_eq!(hakeeper_replica_id(2), Some(131_074));
        assert_eq!(hakeeper_replica_id(131_071), Some(262_143));
        assert_eq!(hakeeper_replica_id(131_072), None);
        assert_eq!(hakeeper_replica_id(-1), None);
    }

    #[test]
    fn test_cn_store_uuid_is_stable_and_distinct() {
        let a = cn_store_uuid("mo-tp-cn-abcde", "mo-tp-cn-headless", "default");
        let b = cn_store_uuid("mo-tp-cn-abcde", "mo-tp-cn-headless", "default");
        let c = cn_store_uuid("mo-tp-cn-fghij", "mo-tp-cn-headless", "default");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 36);
        assert_eq!(a.matches('-').count(), 4);
    }

    #[test]
    fn test_bucket_unique_id() {
        let a = bucket_unique_id("s3", "", "test-bucket/mo");
        assert_eq!(a.len(), 40);
        assert_ne!(a, bucket_unique_id("s3", "", "test-bucket/other"));
    }

    #[test]
    fn test_instance_id_alphabet() {
        let id = instance_id();
        assert_eq!(id.len(), 5);
        assert!(id.bytes().all(|b| SAFE_ALPHANUMS.contains(&b)));
    }
}
