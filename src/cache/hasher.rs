use std::fmt::Write as _;

use sha2::{Digest, Sha256};

use crate::core::JobSet;

/// Deterministic, order-independent name for a job set.
///
/// The set is canonicalized (BTreeSet iterates sorted), joined with `-` and
/// digested with SHA-256, so the same set always maps to the same artifact
/// name across restarts, and distinct sets collide with negligible
/// probability.
pub fn job_set_digest(jobs: &JobSet) -> String {
    let joined = jobs
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join("-");
    let digest = Sha256::digest(joined.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}
