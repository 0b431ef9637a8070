//! Publisher signing keys.
//!
//! A publisher holds a [`KeyPair`] and signs plugin manifests with it. The
//! runtime only ever sees the [`PublicKey`], registered under the signer
//! reference that manifests name.

use std::fmt;
use std::io::Write;
use std::path::Path;

use base64::Engine;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{CryptoError, CryptoResult};
use crate::signature::Signature;

/// An Ed25519 key pair. The secret half is zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct KeyPair {
    #[zeroize(skip)]
    verifying_key: VerifyingKey,
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random key pair.
    #[must_use]
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self {
            verifying_key,
            signing_key,
        }
    }

    /// Rebuild from the 32-byte secret key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::WrongLength`] unless `bytes` is 32 bytes.
    pub fn from_secret_key(bytes: &[u8]) -> CryptoResult<Self> {
        let mut secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::WrongLength {
                what: "secret key",
                expected: 32,
                actual: bytes.len(),
            })?;
        let signing_key = SigningKey::from_bytes(&secret);
        secret.zeroize();
        let verifying_key = signing_key.verifying_key();
        Ok(Self {
            verifying_key,
            signing_key,
        })
    }

    /// The public key bytes.
    #[must_use]
    pub fn public_key_bytes(&self) -> &[u8; 32] {
        self.verifying_key.as_bytes()
    }

    /// The public half, for distribution to runtimes.
    #[must_use]
    pub fn export_public_key(&self) -> PublicKey {
        PublicKey(*self.public_key_bytes())
    }

    /// Sign a message.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature::from(self.signing_key.sign(message))
    }

    /// Verify a signature made by this key pair.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::BadSignature`] on mismatch.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> CryptoResult<()> {
        signature.verify(message, self.public_key_bytes())
    }

    /// Load a secret key file, or generate one if it does not exist.
    ///
    /// New files are created with mode 0o600 on Unix in a single
    /// create-exclusive open. Existing files that are symlinks are refused.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Io`] on I/O failure or a symlinked path, and
    /// [`CryptoError::WrongLength`] for a truncated file.
    pub fn load_or_generate(path: impl AsRef<Path>) -> CryptoResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CryptoError::io(parent, e))?;
        }

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        match options.open(path) {
            Ok(mut file) => {
                let kp = Self::generate();
                let secret = Zeroizing::new(kp.signing_key.to_bytes());
                file.write_all(&secret[..])
                    .map_err(|e| CryptoError::io(path, e))?;
                tracing::info!(path = %path.display(), "generated signing key");
                return Ok(kp);
            },
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {},
            Err(e) => return Err(CryptoError::io(path, e)),
        }

        let meta = std::fs::symlink_metadata(path).map_err(|e| CryptoError::io(path, e))?;
        if meta.file_type().is_symlink() {
            return Err(CryptoError::io(
                path,
                std::io::Error::other("refusing to read a key file through a symlink"),
            ));
        }
        let bytes = Zeroizing::new(std::fs::read(path).map_err(|e| CryptoError::io(path, e))?);
        Self::from_secret_key(&bytes)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.export_public_key())
            .finish_non_exhaustive()
    }
}

/// An Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Wrap raw bytes without validating the curve point.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Standard base64, the format of `<signer>.pub` trust files.
    #[must_use]
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Decode and validate a base64 public key.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed base64, wrong length, or a point that
    /// is not a valid Ed25519 key.
    pub fn from_base64(s: &str) -> CryptoResult<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s.trim())
            .map_err(|_| CryptoError::Encoding("base64"))?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::WrongLength {
                what: "public key",
                expected: 32,
                actual: bytes.len(),
            })?;
        VerifyingKey::from_bytes(&bytes)
            .map_err(|e| CryptoError::MalformedKey(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Short fingerprint for logs.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl TryFrom<String> for PublicKey {
    type Error = CryptoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_base64(&value)
    }
}

impl From<PublicKey> for String {
    fn from(key: PublicKey) -> Self {
        key.to_base64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let kp = KeyPair::generate();
        let sig = kp.sign(b"manifest");
        assert!(kp.verify(b"manifest", &sig).is_ok());
        assert!(kp.verify(b"other", &sig).is_err());
    }

    #[test]
    fn secret_key_rebuilds_same_public_key() {
        let kp = KeyPair::generate();
        let rebuilt = KeyPair::from_secret_key(&kp.signing_key.to_bytes()).unwrap();
        assert_eq!(rebuilt.export_public_key(), kp.export_public_key());
        assert!(KeyPair::from_secret_key(&[0u8; 31]).is_err());
    }

    #[test]
    fn load_or_generate_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("publisher.key");
        let first = KeyPair::load_or_generate(&path).unwrap();
        let second = KeyPair::load_or_generate(&path).unwrap();
        assert_eq!(first.export_public_key(), second.export_public_key());
    }

    #[cfg(unix)]
    #[test]
    fn generated_key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("publisher.key");
        let _kp = KeyPair::load_or_generate(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn public_key_base64_round_trip() {
        let pk = KeyPair::generate().export_public_key();
        assert_eq!(PublicKey::from_base64(&pk.to_base64()).unwrap(), pk);
        let json = serde_json::to_string(&pk).unwrap();
        assert_eq!(serde_json::from_str::<PublicKey>(&json).unwrap(), pk);
    }
}
