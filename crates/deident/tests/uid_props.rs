//! Property tests for deterministic UID regeneration. Collision behaviour
//! within a project is the load-bearing guarantee: the same source UID must
//! always map to the same output, and distinct sources must not collide.

use deident::hashing::regenerate_uid;
use quickcheck_macros::quickcheck;

const ORG_ROOT: &str = "1.2.826.0.1.3680043.10.888";
const SALT: &[u8] = b"property-salt";

#[quickcheck]
fn regeneration_is_deterministic(uid: String) -> bool {
    regenerate_uid(ORG_ROOT, SALT, &uid) == regenerate_uid(ORG_ROOT, SALT, &uid)
}

#[quickcheck]
fn outputs_are_valid_uids(uid: String) -> bool {
    let out = regenerate_uid(ORG_ROOT, SALT, &uid);
    out.len() <= 64
        && out.starts_with(ORG_ROOT)
        && !out.ends_with('.')
        && out.chars().all(|c| c.is_ascii_digit() || c == '.')
}

#[quickcheck]
fn distinct_inputs_do_not_collide(a: String, b: String) -> bool {
    let out_a = regenerate_uid(ORG_ROOT, SALT, &a);
    let out_b = regenerate_uid(ORG_ROOT, SALT, &b);
    if a == b {
        out_a == out_b
    } else {
        out_a != out_b
    }
}

#[quickcheck]
fn salts_partition_the_output_space(uid: String) -> bool {
    // Different projects must not produce linkable UIDs.
    regenerate_uid(ORG_ROOT, SALT, &uid) != regenerate_uid(ORG_ROOT, b"other-salt", &uid)
}
