//! BLAKE3 content hashing.
//!
//! Hashes identify file contents in code payloads, source trees observed by
//! the hot-reload watcher, and files reported in `FileChanged` events.

use std::fmt;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CryptoError, CryptoResult};

/// A BLAKE3 content hash (32 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash a byte slice.
    #[must_use]
    pub fn hash(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Hash with a derive-key context for domain separation.
    #[must_use]
    pub fn hash_with_domain(domain: &str, data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key(domain);
        hasher.update(data);
        Self(*hasher.finalize().as_bytes())
    }

    /// Hash everything readable from `reader`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Io`] if reading fails.
    pub fn hash_reader(reader: impl Read) -> CryptoResult<Self> {
        let mut hasher = blake3::Hasher::new();
        hasher
            .update_reader(reader)
            .map_err(|source| CryptoError::Io {
                path: "<reader>".to_string(),
                source,
            })?;
        Ok(Self(*hasher.finalize().as_bytes()))
    }

    /// Hash the contents of a file.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Io`] if the file cannot be opened or read.
    pub fn hash_file(path: impl AsRef<Path>) -> CryptoResult<Self> {
        let path = path.as_ref();
        let mut hasher = blake3::Hasher::new();
        std::fs::File::open(path)
            .and_then(|file| hasher.update_reader(std::io::BufReader::new(file)).map(|_| ()))
            .map_err(|e| CryptoError::io(path, e))?;
        Ok(Self(*hasher.finalize().as_bytes()))
    }

    /// Raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Wrap raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Lowercase hex encoding.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Decode from hex.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encoding`] if the string is not
    /// 64 hex characters.
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::Encoding("hex digest"))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::Encoding("hex digest"))?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl AsRef<[u8]> for ContentHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_input_same_hash() {
        assert_eq!(ContentHash::hash(b"abc"), ContentHash::hash(b"abc"));
        assert_ne!(ContentHash::hash(b"abc"), ContentHash::hash(b"abd"));
    }

    #[test]
    fn domains_separate() {
        let a = ContentHash::hash_with_domain("plughost a", b"data");
        let b = ContentHash::hash_with_domain("plughost b", b"data");
        assert_ne!(a, b);
        assert_ne!(a, ContentHash::hash(b"data"));
    }

    #[test]
    fn file_hash_matches_slice_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, b"hello plugin").unwrap();
        assert_eq!(
            ContentHash::hash_file(&path).unwrap(),
            ContentHash::hash(b"hello plugin")
        );
    }

    #[test]
    fn hex_and_serde_round_trip() {
        let hash = ContentHash::hash(b"x");
        assert_eq!(ContentHash::from_hex(&hash.to_hex()).unwrap(), hash);
        let json = serde_json::to_string(&hash).unwrap();
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
        assert!(ContentHash::from_hex("abcd").is_err());
    }
}
