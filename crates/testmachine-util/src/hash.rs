/// Compute the BLAKE3 hash of a byte slice, returning the hex-encoded digest.
#[must_use]
pub fn blake3_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Compute the BLAKE3 hash of a string, returning the hex-encoded digest.
#[must_use]
pub fn blake3_str(data: &str) -> String {
    blake3_bytes(data.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blake3_bytes() {
        let hash = blake3_bytes(b"hello world");
        assert_eq!(
            hash,
            "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24"
        );
    }

    #[test]
    fn test_blake3_str_matches_bytes() {
        assert_eq!(blake3_str("hello world"), blake3_bytes(b"hello world"));
        assert_ne!(blake3_str("a"), blake3_str("b"));
    }
}
