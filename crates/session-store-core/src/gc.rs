//! Expiry cutoff computation with per-node skew.
//!
//! Nodes in a small replicated cluster that all run gc at the same moment would race
//! to delete the same rows. Every node except node 1 pushes its cutoff back by a
//! multiple of `max(one day, max_lifetime / 10)` so their deletions rarely overlap.
//! Skew only ever delays expiry; it never removes a session younger than `max_lifetime`.

/// Minimum per-step skew, in seconds.
pub const ONE_DAY_SECS: i64 = 86_400;

/// Nodes with an identity at or above this value are not skewed.
pub const MAX_SKEWED_NODE: i64 = 10;

/// Seconds subtracted from the cutoff on `node_identity`.
pub fn gc_skew(node_identity: i64, max_lifetime: i64) -> i64 {
    if node_identity > 1 && node_identity < MAX_SKEWED_NODE {
        let step = ONE_DAY_SECS.max(max_lifetime / 10);
        (node_identity - 1).saturating_mul(step)
    } else {
        0
    }
}

/// Records with a timestamp strictly below the returned instant are expired.
pub fn gc_cutoff(now: i64, max_lifetime: i64, node_identity: i64) -> i64 {
    now.saturating_sub(max_lifetime)
        .saturating_sub(gc_skew(node_identity, max_lifetime))
}
