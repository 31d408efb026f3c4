//! Keyed-hash primitives behind pseudonymisation, UID regeneration and
//! date-shift offsets. All of them are BLAKE2b MACs keyed with the project
//! salt, so outputs are stable within a project and unlinkable across
//! projects.

use blake2::digest::Mac;
use blake2::{Blake2b512, Blake2bMac512, Digest};
use models::TagKey;

const MAC_KEY_LIMIT: usize = 64;

/// Keyed BLAKE2b-512 over `data`. Oversized keys are pre-hashed down to the
/// MAC key limit, mirroring HMAC's treatment of long keys.
pub fn mac(key: &[u8], data: &[u8]) -> [u8; 64] {
    let digest;
    let key = if key.len() <= MAC_KEY_LIMIT {
        key
    } else {
        digest = Blake2b512::digest(key);
        &digest[..]
    };
    let mut mac = Blake2bMac512::new_from_slice(key).expect("key within MAC limit");
    mac.update(data);
    let digest = mac.finalize().into_bytes();
    let mut out = [0u8; 64];
    out.copy_from_slice(&digest);
    out
}

/// The per-study date-shift offset in days, in [-30, 0].
pub fn date_shift_days(salt: &[u8], study_uid: &str) -> i64 {
    let digest = mac(salt, study_uid.as_bytes());
    let seed = u64::from_be_bytes(digest[..8].try_into().expect("8 bytes"));
    -((seed % 31) as i64)
}

/// The pseudonymised patient identifier: a keyed hash of the original
/// Patient ID, rendered as 64 hex characters.
pub fn pseudo_patient_id(salt: &[u8], patient_id: &str) -> String {
    let digest = mac(salt, patient_id.as_bytes());
    hex::encode(&digest[..32])
}

/// Deterministically regenerate a UID: `<org-root>.<digest-as-decimal>`,
/// truncated to the 64-character UID limit.
pub fn regenerate_uid(org_root: &str, salt: &[u8], original: &str) -> String {
    let digest = mac(salt, original.as_bytes());
    let number = u128::from_be_bytes(digest[..16].try_into().expect("16 bytes"));
    let mut uid = format!("{}.{}", org_root.trim_end_matches('.'), number);
    uid.truncate(64);
    // Truncation must not leave a trailing component separator.
    while uid.ends_with('.') {
        uid.pop();
    }
    uid
}

/// Keyed hash of one element value. The element's tag is folded into the
/// key so identical values in different attributes hash differently.
pub fn secure_hash_value(salt: &[u8], tag: TagKey, value: &str, limit: Option<usize>) -> String {
    let mut key = salt.to_vec();
    let local: [u8; 4] = {
        let g = tag.group.to_be_bytes();
        let e = tag.element.to_be_bytes();
        [g[0], g[1], e[0], e[1]]
    };
    for (i, byte) in key.iter_mut().enumerate() {
        *byte ^= local[i % 4];
    }
    let digest = mac(&key, value.as_bytes());
    let mut encoded = base64::encode(digest);
    if let Some(limit) = limit {
        encoded.truncate(limit);
    }
    encoded
}

#[cfg(test)]
mod test {
    use super::*;

    const SALT: &[u8] = b"test-salt";

    #[test]
    fn offsets_are_deterministic_and_backwards() {
        let a = date_shift_days(SALT, "1.2.3");
        let b = date_shift_days(SALT, "1.2.3");
        assert_eq!(a, b);
        assert!((-30..=0).contains(&a));

        // A different salt decouples the offset.
        let other = date_shift_days(b"other-salt", "1.2.3");
        assert!((-30..=0).contains(&other));
    }

    #[test]
    fn pseudo_ids_are_hex_and_salted() {
        let id = pseudo_patient_id(SALT, "M1");
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, pseudo_patient_id(SALT, "M1"));
        assert_ne!(id, pseudo_patient_id(b"other", "M1"));
        assert_ne!(id, pseudo_patient_id(SALT, "M2"));
    }

    #[test]
    fn regenerated_uids_are_valid_and_stable() {
        let org_root = "1.2.826.0.1.3680043.10.888";
        let uid = regenerate_uid(org_root, SALT, "1.2.3.4.5");
        assert!(uid.len() <= 64);
        assert!(uid.starts_with(org_root));
        assert!(uid.chars().all(|c| c.is_ascii_digit() || c == '.'));
        assert!(!uid.ends_with('.'));
        assert_eq!(uid, regenerate_uid(org_root, SALT, "1.2.3.4.5"));
        assert_ne!(uid, regenerate_uid(org_root, SALT, "1.2.3.4.6"));
    }

    #[test]
    fn oversized_keys_are_accepted() {
        let long_key = vec![7u8; 200];
        let _ = mac(&long_key, b"data");
    }

    #[test]
    fn secure_hashes_differ_per_attribute() {
        let a = secure_hash_value(SALT, TagKey::new(0x0010, 0x1000), "JANE", None);
        let b = secure_hash_value(SALT, TagKey::new(0x0010, 0x1001), "JANE", None);
        assert_ne!(a, b);

        let clamped = secure_hash_value(SALT, TagKey::new(0x0010, 0x1000), "JANE", Some(16));
        assert_eq!(clamped.len(), 16);
        assert!(a.starts_with(&clamped));
    }
}
