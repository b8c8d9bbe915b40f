//! Integrity: content digest (SHA-256) over chunk payloads and whole chunk sets.

use sha2::{Digest, Sha256};

/// 32-byte SHA-256 digest.
pub type Checksum = [u8; 32];

/// Digest a payload.
pub fn checksum(payload: &[u8]) -> Checksum {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Verify payload against an expected digest.
pub fn verify(payload: &[u8], expected: &Checksum) -> bool {
    checksum(payload) == *expected
}

/// Digest over the concatenation of several payloads, in order, without
/// materializing the concatenation.
pub fn aggregate_checksum<'a, I>(parts: I) -> Checksum
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Lowercase hex rendering for logs.
pub fn to_hex(sum: &Checksum) -> String {
    sum.iter().map(|b| format!("{:02x}", b)).collect()
}
