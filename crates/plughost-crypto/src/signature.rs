//! Detached Ed25519 signatures.

use std::fmt;

use base64::Engine;
use ed25519_dalek::{Signature as DalekSignature, Verifier, VerifyingKey};

use crate::error::{CryptoError, CryptoResult};

/// An Ed25519 signature (64 bytes).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Wrap raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Try to build from a slice.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::WrongLength`] unless the slice is exactly 64
    /// bytes.
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; 64] =
            slice
                .try_into()
                .map_err(|_| CryptoError::WrongLength {
                    what: "signature",
                    expected: 64,
                    actual: slice.len(),
                })?;
        Ok(Self(bytes))
    }

    /// Raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// Standard base64, the form stored in `signature.value`.
    #[must_use]
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Decode from standard base64.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed base64 or a decoded length other
    /// than 64.
    pub fn from_base64(s: &str) -> CryptoResult<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s.trim())
            .map_err(|_| CryptoError::Encoding("base64"))?;
        Self::try_from_slice(&bytes)
    }

    /// Verify against `message` and a raw public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::MalformedKey`] for a malformed key and
    /// [`CryptoError::BadSignature`] on mismatch.
    pub fn verify(&self, message: &[u8], public_key: &[u8; 32]) -> CryptoResult<()> {
        let key = VerifyingKey::from_bytes(public_key)
            .map_err(|e| CryptoError::MalformedKey(e.to_string()))?;
        key.verify(message, &DalekSignature::from_bytes(&self.0))
            .map_err(|_| CryptoError::BadSignature)
    }
}

impl From<DalekSignature> for Signature {
    fn from(sig: DalekSignature) -> Self {
        Self(sig.to_bytes())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}...)", &hex::encode(self.0)[..16])
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyPair;

    #[test]
    fn base64_round_trip() {
        let kp = KeyPair::generate();
        let sig = kp.sign(b"msg");
        let decoded = Signature::from_base64(&sig.to_base64()).unwrap();
        assert_eq!(decoded, sig);
    }

    #[test]
    fn wrong_length_is_rejected() {
        let err = Signature::from_base64("AAAA").unwrap_err();
        assert!(matches!(
            err,
            CryptoError::WrongLength { expected: 64, .. }
        ));
        assert!(matches!(
            Signature::from_base64("not base64!"),
            Err(CryptoError::Encoding(_))
        ));
    }

    #[test]
    fn tampered_message_fails() {
        let kp = KeyPair::generate();
        let sig = kp.sign(b"original");
        assert!(sig.verify(b"original", kp.public_key_bytes()).is_ok());
        assert!(matches!(
            sig.verify(b"tampered", kp.public_key_bytes()),
            Err(CryptoError::BadSignature)
        ));
    }
}
