use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// First 7 hex characters of the SHA-256 digest of `bytes`.
///
/// Short enough to read in a log line, long enough that collisions within a
/// single honeypot instance do not matter.
pub fn short_digest(bytes: &[u8]) -> String {
    sha256_hex(bytes)[..7].to_owned()
}
