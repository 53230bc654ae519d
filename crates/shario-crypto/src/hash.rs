//! Content digests and key derivation.
//!
//! Transfers carry a whole-file SHA-256 checksum (hex) in the offer and the
//! receiver verifies it after the last chunk. BLAKE3 `derive_key` is used for
//! internal derivations (DHT service keys, Noise static key).

use sha2::{Digest, Sha256};
use std::io::{self, Read};
use std::path::Path;

/// Compute the SHA-256 digest of a byte slice.
#[must_use]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hex form of the SHA-256 digest of a byte slice.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Stream a file through SHA-256 and return the hex digest.
///
/// Reads in 64 KiB blocks so arbitrarily large files hash in constant
/// memory. Blocking; callers on the async runtime wrap this in
/// `spawn_blocking`.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub fn sha256_file_hex<P: AsRef<Path>>(path: P) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Derive a 32-byte key for the given context and input material.
///
/// Deterministic; used for DHT service keys and similar internal ids.
#[must_use]
pub fn derive_key(context: &'static str, material: &[u8]) -> [u8; 32] {
    blake3::derive_key(context, material)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_sha256_known_vector() {
        // SHA-256("hello")
        assert_eq!(
            sha256_hex(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_sha256_empty() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_file_digest_matches_slice_digest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0u32..20_000).flat_map(|i| i.to_le_bytes()).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        assert_eq!(sha256_file_hex(file.path()).unwrap(), sha256_hex(&data));
    }

    #[test]
    fn test_derive_key_contexts_are_separated() {
        let a = derive_key("shario test context a", b"material");
        let b = derive_key("shario test context b", b"material");
        assert_ne!(a, b);

        let a2 = derive_key("shario test context a", b"material");
        assert_eq!(a, a2);
    }
}
