// checksum.rs — SHA-256 checksum helpers for record envelopes.
//
// Every persisted record carries a checksum of its payload so a reader
// can tell a truncated or half-written file from a valid one without
// trusting the version counter. Checksums are SHA-256, lowercase hex.

use sha2::{Digest, Sha256};

/// Checksum arbitrary bytes, returning a lowercase hex-encoded SHA-256 string.
pub fn of_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Checksum a UTF-8 string.
pub fn of_str(s: &str) -> String {
    of_bytes(s.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_deterministic() {
        assert_eq!(of_bytes(b"task card"), of_bytes(b"task card"));
    }

    #[test]
    fn different_payloads_differ() {
        assert_ne!(of_str("p1"), of_str("p2"));
    }

    #[test]
    fn checksum_is_hex_sha256() {
        // SHA-256("") is a fixed, well-known digest.
        assert_eq!(
            of_str(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        let sum = of_str("anything");
        assert_eq!(sum.len(), 64);
        assert!(sum.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
    }
}
