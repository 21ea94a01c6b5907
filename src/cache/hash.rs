//! Short content hashes for cache keys, etags and integrity fingerprints.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

const SHORT_HASH_LEN: usize = 10;

/// URL-safe base64 of the SHA-256 digest, truncated to 10 characters.
pub fn hash(input: impl AsRef<[u8]>) -> String {
    let digest = Sha256::digest(input.as_ref());
    let mut encoded = URL_SAFE_NO_PAD.encode(digest);
    encoded.truncate(SHORT_HASH_LEN);
    encoded
}

/// Strip everything that is not alphanumeric or `_`.
pub fn escape_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

/// Weak etag for a response body.
pub fn etag(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    let encoded = URL_SAFE_NO_PAD.encode(digest);
    format!("W/\"{:x}-{}\"", body.len(), &encoded[..27])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_short_and_stable() {
        let a = hash("/api/hello?x=1");
        assert_eq!(a.len(), 10);
        assert_eq!(a, hash("/api/hello?x=1"));
        assert_ne!(a, hash("/api/hello?x=2"));
    }

    #[test]
    fn test_escape_key() {
        assert_eq!(escape_key("/api/hello-world.json"), "apihelloworldjson");
        assert_eq!(escape_key("accept_language"), "accept_language");
    }

    #[test]
    fn test_etag_is_weak() {
        let tag = etag(b"hello");
        assert!(tag.starts_with("W/\"5-"));
        assert!(tag.ends_with('"'));
        assert_ne!(tag, etag(b"hello!"));
    }
}
