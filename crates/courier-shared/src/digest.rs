//! BLAKE3 digests used on the wire: payload checksums and SOLO thread ids.

/// Lowercase hex BLAKE3 of a payload, compared against the checksum a client
/// embeds in its signal message.
pub fn payload_checksum(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

/// Whether `checksum` matches the payload bytes. Hex case is ignored.
pub fn checksum_matches(data: &[u8], checksum: &str) -> bool {
    payload_checksum(data).eq_ignore_ascii_case(checksum.trim())
}

// Parties are ordered lexicographically so both sides hash "min_max".
pub(crate) fn solo_thread_digest(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = blake3::Hasher::new();
    hasher.update(lo.as_bytes());
    hasher.update(b"_");
    hasher.update(hi.as_bytes());
    hex::encode(hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_deterministic() {
        let data = b"hello from the other side";
        assert_eq!(payload_checksum(data), payload_checksum(data));
        assert_ne!(payload_checksum(data), payload_checksum(b"hello"));
    }

    #[test]
    fn checksum_match_ignores_case() {
        let data = b"payload";
        let upper = payload_checksum(data).to_uppercase();
        assert!(checksum_matches(data, &upper));
        assert!(!checksum_matches(b"other", &upper));
    }

    #[test]
    fn solo_digest_hashes_joined_pair() {
        let expected = hex::encode(blake3::hash(b"alice_bob").as_bytes());
        assert_eq!(solo_thread_digest("bob", "alice"), expected);
    }
}
