//! Trusted signer registry.
//!
//! Manifests name their signer by reference (`signature.signer`). The
//! registry maps those references to public keys. A trust directory holds one
//! `<signer>.pub` file per signer containing the base64 public key.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{CryptoError, CryptoResult};
use crate::keypair::PublicKey;
use crate::signature::Signature;

/// File extension of public key files in a trust directory.
pub const PUBLIC_KEY_EXTENSION: &str = "pub";

/// Public keys of signers whose plugins may be loaded.
#[derive(Debug, Clone, Default)]
pub struct SignerRegistry {
    signers: HashMap<String, PublicKey>,
}

impl SignerRegistry {
    /// Create an empty registry. Nothing verifies until a signer is trusted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust `key` under `signer`, replacing any previous key.
    pub fn trust(&mut self, signer: impl Into<String>, key: PublicKey) {
        self.signers.insert(signer.into(), key);
    }

    /// Stop trusting `signer`. Returns `true` if it was present.
    pub fn revoke(&mut self, signer: &str) -> bool {
        self.signers.remove(signer).is_some()
    }

    /// Key registered for `signer`.
    #[must_use]
    pub fn get(&self, signer: &str) -> Option<&PublicKey> {
        self.signers.get(signer)
    }

    /// Number of trusted signers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.signers.len()
    }

    /// Whether no signer is trusted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.signers.is_empty()
    }

    /// Verify `signature` over `message` with the key registered for
    /// `signer`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnknownSigner`] if the signer is not trusted,
    /// or [`CryptoError::BadSignature`] on mismatch.
    pub fn verify(&self, signer: &str, message: &[u8], signature: &Signature) -> CryptoResult<()> {
        let key = self
            .signers
            .get(signer)
            .ok_or_else(|| CryptoError::UnknownSigner(signer.to_string()))?;
        signature.verify(message, key.as_bytes())
    }

    /// Load every `<signer>.pub` file in `dir`.
    ///
    /// A missing directory yields an empty registry. Unreadable or malformed
    /// key files are skipped with a warning so one bad file does not revoke
    /// every other signer.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Io`] if the directory exists but cannot be
    /// listed.
    pub fn load_dir(dir: impl AsRef<Path>) -> CryptoResult<Self> {
        let dir = dir.as_ref();
        let mut registry = Self::new();
        if !dir.is_dir() {
            tracing::debug!(dir = %dir.display(), "trust directory absent; no signers trusted");
            return Ok(registry);
        }

        let entries = std::fs::read_dir(dir).map_err(|e| CryptoError::io(dir, e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PUBLIC_KEY_EXTENSION) {
                continue;
            }
            let Some(signer) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let key = match std::fs::read_to_string(&path)
                .map_err(|e| CryptoError::io(&path, e))
                .and_then(|text| PublicKey::from_base64(&text))
            {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable signer key");
                    continue;
                },
            };
            tracing::debug!(signer, fingerprint = %key.fingerprint(), "trusted signer");
            registry.trust(signer, key);
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyPair;

    #[test]
    fn unknown_signer_is_rejected() {
        let kp = KeyPair::generate();
        let registry = SignerRegistry::new();
        let sig = kp.sign(b"m");
        assert!(matches!(
            registry.verify("nobody", b"m", &sig),
            Err(CryptoError::UnknownSigner(_))
        ));
    }

    #[test]
    fn trusted_signer_verifies_and_revocation_sticks() {
        let kp = KeyPair::generate();
        let mut registry = SignerRegistry::new();
        registry.trust("acme", kp.export_public_key());
        let sig = kp.sign(b"m");
        assert!(registry.verify("acme", b"m", &sig).is_ok());
        assert!(registry.revoke("acme"));
        assert!(registry.verify("acme", b"m", &sig).is_err());
    }

    #[test]
    fn key_under_other_signer_does_not_verify() {
        let acme = KeyPair::generate();
        let mallory = KeyPair::generate();
        let mut registry = SignerRegistry::new();
        registry.trust("acme", acme.export_public_key());
        let forged = mallory.sign(b"m");
        assert!(matches!(
            registry.verify("acme", b"m", &forged),
            Err(CryptoError::BadSignature)
        ));
    }

    #[test]
    fn loads_trust_directory() {
        let dir = tempfile::tempdir().unwrap();
        let kp = KeyPair::generate();
        std::fs::write(
            dir.path().join("acme.pub"),
            kp.export_public_key().to_base64(),
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.pub"), "not a key").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = SignerRegistry::load_dir(dir.path()).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("acme"), Some(&kp.export_public_key()));
    }

    #[test]
    fn missing_trust_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SignerRegistry::load_dir(dir.path().join("absent")).unwrap();
        assert!(registry.is_empty());
    }
}
