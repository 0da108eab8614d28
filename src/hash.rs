use sha2::{Digest, Sha256};

/// Number of digest bytes kept in an identifier, giving 32 hex characters.
const ID_BYTES: usize = 16;

/// Returns the content identifier of a statement text.
pub fn hash(text: &str) -> String {
    hash_bytes(text.as_bytes())
}

/// Returns the content identifier of arbitrary bytes.
///
/// Only used as a dedup key, so truncating the digest is fine.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..ID_BYTES])
}
