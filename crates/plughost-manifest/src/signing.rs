//! Manifest signatures.
//!
//! The signed message is `blake3_derive_key(SIGNING_DOMAIN, canonical || digest)`
//! where `canonical` is the canonical manifest form and `digest` is the code
//! payload digest. Changing any manifest field outside `signature`, or any
//! payload byte, invalidates the signature.

use plughost_crypto::{ContentHash, CryptoError, KeyPair, Signature, SignerRegistry};

use crate::canonical::canonical_bytes;
use crate::error::SignatureError;
use crate::model::{Manifest, SignatureBlock};
use crate::payload::CodePayload;

/// The only accepted `signature.algorithm`.
pub const SIGNATURE_ALGORITHM: &str = "ed25519";

const SIGNING_DOMAIN: &str = "plughost manifest signature v1";

/// The 32-byte message covered by a manifest signature.
#[must_use]
pub fn signing_message(manifest: &Manifest, payload: &CodePayload) -> ContentHash {
    let mut data = canonical_bytes(manifest);
    data.extend_from_slice(payload.digest().as_bytes());
    ContentHash::hash_with_domain(SIGNING_DOMAIN, &data)
}

/// Sign `manifest` over `payload`, replacing any existing signature block.
pub fn sign_manifest(
    manifest: &mut Manifest,
    payload: &CodePayload,
    keypair: &KeyPair,
    signer: impl Into<String>,
) {
    let message = signing_message(manifest, payload);
    let signature = keypair.sign(message.as_bytes());
    manifest.signature = Some(SignatureBlock {
        algorithm: SIGNATURE_ALGORITHM.to_string(),
        value: signature.to_base64(),
        signer: signer.into(),
    });
}

/// Verify the signature block of `manifest` against trusted signers.
///
/// # Errors
///
/// Returns a [`SignatureError`] naming the failure.
pub fn verify_manifest(
    manifest: &Manifest,
    payload: &CodePayload,
    registry: &SignerRegistry,
) -> Result<(), SignatureError> {
    let block = manifest
        .signature
        .as_ref()
        .ok_or_else(|| SignatureError::Malformed("manifest is not signed".to_string()))?;
    if block.algorithm != SIGNATURE_ALGORITHM {
        return Err(SignatureError::UnsupportedAlgorithm(block.algorithm.clone()));
    }
    let signature =
        Signature::from_base64(&block.value).map_err(|e| SignatureError::Malformed(e.to_string()))?;
    let message = signing_message(manifest, payload);
    registry
        .verify(&block.signer, message.as_bytes(), &signature)
        .map_err(|e| match e {
            CryptoError::UnknownSigner(s) => SignatureError::UnknownSigner(s),
            _ => SignatureError::Mismatch,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{SchemaLimits, check};

    const UNSIGNED: &str = r#"
name = "signed-plugin"
version = "1.2.3"
entryPoint = "main.sh"
[permissions]
[isolationLimits]
maxHeapMb = 16
"#;

    fn setup() -> (Manifest, CodePayload, KeyPair, SignerRegistry) {
        let manifest = check(UNSIGNED, &SchemaLimits::default().unsigned(), None).unwrap();
        let payload = CodePayload::from_files([("main.sh", b"echo ok".to_vec())]);
        let keypair = KeyPair::generate();
        let mut registry = SignerRegistry::new();
        registry.trust("acme", keypair.export_public_key());
        (manifest, payload, keypair, registry)
    }

    #[test]
    fn sign_then_verify() {
        let (mut manifest, payload, keypair, registry) = setup();
        sign_manifest(&mut manifest, &payload, &keypair, "acme");
        assert!(verify_manifest(&manifest, &payload, &registry).is_ok());
    }

    #[test]
    fn field_change_breaks_signature() {
        let (mut manifest, payload, keypair, registry) = setup();
        sign_manifest(&mut manifest, &payload, &keypair, "acme");
        manifest.isolation_limits.max_heap_mb = 17;
        assert_eq!(
            verify_manifest(&manifest, &payload, &registry),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn payload_change_breaks_signature() {
        let (mut manifest, payload, keypair, registry) = setup();
        sign_manifest(&mut manifest, &payload, &keypair, "acme");
        let tampered = CodePayload::from_files([("main.sh", b"echo pwned".to_vec())]);
        assert_eq!(
            verify_manifest(&manifest, &tampered, &registry),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn unknown_signer_and_algorithm() {
        let (mut manifest, payload, keypair, registry) = setup();
        sign_manifest(&mut manifest, &payload, &keypair, "stranger");
        assert!(matches!(
            verify_manifest(&manifest, &payload, &registry),
            Err(SignatureError::UnknownSigner(s)) if s == "stranger"
        ));

        if let Some(block) = manifest.signature.as_mut() {
            block.algorithm = "rsa".into();
        }
        assert!(matches!(
            verify_manifest(&manifest, &payload, &registry),
            Err(SignatureError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn garbage_signature_is_malformed() {
        let (mut manifest, payload, keypair, registry) = setup();
        sign_manifest(&mut manifest, &payload, &keypair, "acme");
        if let Some(block) = manifest.signature.as_mut() {
            block.value = "not base64!".into();
        }
        assert!(matches!(
            verify_manifest(&manifest, &payload, &registry),
            Err(SignatureError::Malformed(_))
        ));
    }
}
