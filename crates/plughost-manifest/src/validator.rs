//! Manifest validation: schema check, then signature check.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use plughost_core::InstanceId;
use plughost_crypto::{ContentHash, SignerRegistry};
use tracing::debug;

use crate::MANIFEST_FILE_NAME;
use crate::error::ValidationError;
use crate::model::Manifest;
use crate::payload::CodePayload;
use crate::schema::{self, SchemaLimits};
use crate::signing::verify_manifest;

/// Largest manifest file accepted (256 KiB).
const MAX_MANIFEST_SIZE: u64 = 256 * 1024;

/// A manifest that passed both the schema and signature checks.
#[derive(Debug, Clone)]
pub struct ValidatedManifest {
    manifest: Arc<Manifest>,
    payload: Arc<CodePayload>,
    payload_digest: ContentHash,
    dir: Option<PathBuf>,
}

impl ValidatedManifest {
    /// The manifest.
    #[must_use]
    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    /// The payload it was verified against.
    #[must_use]
    pub fn payload(&self) -> &CodePayload {
        &self.payload
    }

    /// Digest of the verified payload.
    #[must_use]
    pub fn payload_digest(&self) -> ContentHash {
        self.payload_digest
    }

    /// Plugin directory, when validated from disk.
    #[must_use]
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// `name@version`.
    #[must_use]
    pub fn instance_id(&self) -> InstanceId {
        self.manifest.instance_id()
    }

    /// Absolute entry point path, when validated from disk.
    #[must_use]
    pub fn entry_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(&self.manifest.entry_point))
    }
}

/// Runs the schema and signature checks against a trust registry.
#[derive(Debug, Clone)]
pub struct ManifestValidator {
    registry: Arc<SignerRegistry>,
    limits: SchemaLimits,
}

impl ManifestValidator {
    /// Create a validator.
    #[must_use]
    pub fn new(registry: Arc<SignerRegistry>, limits: SchemaLimits) -> Self {
        Self { registry, limits }
    }

    /// The same validator with signatures required regardless of the
    /// limits it was created with.
    #[must_use]
    pub fn enforcing_signatures(mut self) -> Self {
        self.limits.require_signature = true;
        self
    }

    /// Trusted signers.
    #[must_use]
    pub fn registry(&self) -> &SignerRegistry {
        &self.registry
    }

    /// Schema limits in force.
    #[must_use]
    pub fn limits(&self) -> &SchemaLimits {
        &self.limits
    }

    /// Validate manifest text against an already collected payload.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Schema`] listing every failing field, or
    /// [`ValidationError::Signature`] if the schema passed but the signature
    /// did not.
    pub fn validate(
        &self,
        text: &str,
        payload: CodePayload,
    ) -> Result<ValidatedManifest, ValidationError> {
        let manifest = schema::check(text, &self.limits, Some(&payload))?;
        if self.limits.require_signature || manifest.signature.is_some() {
            verify_manifest(&manifest, &payload, &self.registry)?;
        }
        debug!(instance = %manifest.instance_id(), "manifest validated");
        Ok(ValidatedManifest {
            manifest: Arc::new(manifest),
            payload_digest: payload.digest(),
            payload: Arc::new(payload),
            dir: None,
        })
    }

    /// Validate the plugin in `dir`.
    ///
    /// # Errors
    ///
    /// As [`Self::validate`], plus [`ValidationError::Io`] if the directory
    /// cannot be read.
    pub fn validate_dir(&self, dir: &Path) -> Result<ValidatedManifest, ValidationError> {
        let text = read_manifest(dir)?;
        let payload = CodePayload::from_dir(dir).map_err(|e| ValidationError::Io {
            path: dir.display().to_string(),
            message: e.to_string(),
        })?;
        let mut validated = self.validate(&text, payload)?;
        validated.dir = Some(dir.to_path_buf());
        Ok(validated)
    }
}

/// Read `plugin.toml` from `dir`, enforcing the size limit.
///
/// # Errors
///
/// Returns [`ValidationError::Io`] if the file is missing, too large or
/// unreadable.
pub fn read_manifest(dir: &Path) -> Result<String, ValidationError> {
    let path = dir.join(MANIFEST_FILE_NAME);
    let io_err = |message: String| ValidationError::Io {
        path: path.display().to_string(),
        message,
    };
    let len = std::fs::metadata(&path)
        .map_err(|e| io_err(e.to_string()))?
        .len();
    if len > MAX_MANIFEST_SIZE {
        return Err(io_err(format!(
            "manifest is {len} bytes, exceeding the {MAX_MANIFEST_SIZE} byte limit"
        )));
    }
    std::fs::read_to_string(&path).map_err(|e| io_err(e.to_string()))
}

#[cfg(test)]
mod tests {
    use plughost_crypto::KeyPair;

    use super::*;
    use crate::error::SignatureError;
    use crate::signing::sign_manifest;

    const BODY: &str = r#"
name = "disk-plugin"
version = "0.2.0"
entryPoint = "main.sh"
[permissions]
filesystem = [{ path = "/tmp", mode = "read" }]
[isolationLimits]
maxHeapMb = 16
"#;

    fn write_signed(dir: &Path, keypair: &KeyPair) {
        std::fs::write(dir.join("main.sh"), "#!/bin/sh\necho ok\n").unwrap();
        let payload = CodePayload::from_dir(dir).unwrap();
        let mut manifest =
            schema::check(BODY, &SchemaLimits::default().unsigned(), Some(&payload)).unwrap();
        sign_manifest(&mut manifest, &payload, keypair, "acme");
        std::fs::write(
            dir.join(MANIFEST_FILE_NAME),
            toml::to_string(&manifest).unwrap(),
        )
        .unwrap();
    }

    fn validator(keypair: &KeyPair) -> ManifestValidator {
        let mut registry = SignerRegistry::new();
        registry.trust("acme", keypair.export_public_key());
        ManifestValidator::new(Arc::new(registry), SchemaLimits::default())
    }

    #[test]
    fn signed_directory_validates() {
        let dir = tempfile::tempdir().unwrap();
        let keypair = KeyPair::generate();
        write_signed(dir.path(), &keypair);

        let validated = validator(&keypair).validate_dir(dir.path()).unwrap();
        assert_eq!(validated.instance_id().to_string(), "disk-plugin@0.2.0");
        assert_eq!(validated.entry_path(), Some(dir.path().join("main.sh")));
        assert_eq!(validated.payload().files().len(), 1);
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let keypair = KeyPair::generate();
        write_signed(dir.path(), &keypair);
        std::fs::write(dir.path().join("main.sh"), "#!/bin/sh\nrm -rf /\n").unwrap();

        let err = validator(&keypair).validate_dir(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::Signature(SignatureError::Mismatch)
        ));
    }

    #[test]
    fn added_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let keypair = KeyPair::generate();
        write_signed(dir.path(), &keypair);
        std::fs::write(dir.path().join("extra.sh"), "true").unwrap();
        assert!(validator(&keypair).validate_dir(dir.path()).is_err());
    }

    #[test]
    fn schema_runs_before_signature() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.sh"), "true").unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILE_NAME),
            "name = \"no-perms\"\nversion = \"1.0.0\"\nentryPoint = \"main.sh\"\n[isolationLimits]\nmaxHeapMb = 1\n",
        )
        .unwrap();
        let err = validator(&KeyPair::generate())
            .validate_dir(dir.path())
            .unwrap_err();
        let ValidationError::Schema(schema) = err else {
            panic!("expected schema error, got {err:?}");
        };
        assert!(schema.mentions("permissions"));
        assert!(schema.mentions("signature"));
    }

    #[test]
    fn missing_entry_point_is_a_schema_issue() {
        let keypair = KeyPair::generate();
        let err = validator(&keypair)
            .validate(BODY, CodePayload::default())
            .unwrap_err();
        let ValidationError::Schema(schema) = err else {
            panic!("expected schema error");
        };
        assert!(schema.mentions("entryPoint"));
    }

    #[test]
    fn enforcing_signatures_overrides_unsigned_limits() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.sh"), "#!/bin/sh\necho ok\n").unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE_NAME), BODY).unwrap();
        let registry = Arc::new(SignerRegistry::new());

        let lenient = ManifestValidator::new(
            Arc::clone(&registry),
            SchemaLimits::default().unsigned(),
        );
        assert!(lenient.validate_dir(dir.path()).is_ok());

        let err = lenient
            .enforcing_signatures()
            .validate_dir(dir.path())
            .unwrap_err();
        let ValidationError::Schema(schema) = err else {
            panic!("expected schema error, got {err:?}");
        };
        assert!(schema.mentions("signature"));
    }

    #[test]
    fn missing_manifest_is_io() {
        let dir = tempfile::tempdir().unwrap();
        let err = validator(&KeyPair::generate())
            .validate_dir(dir.path())
            .unwrap_err();
        assert!(matches!(err, ValidationError::Io { .. }));
    }
}
