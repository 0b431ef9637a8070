//! Sign command: sign a plugin manifest over its code payload.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use plughost_config::Config;
use plughost_crypto::KeyPair;
use plughost_manifest::schema::{SchemaLimits, check};
use plughost_manifest::{CodePayload, MANIFEST_FILE_NAME, read_manifest, sign_manifest};

use super::keys::key_path;
use crate::theme::Theme;

/// Sign the manifest in `dir` with the key at `key` as `signer`.
pub(crate) fn sign(
    config: &Config,
    dir: &Path,
    signer: &str,
    key: Option<PathBuf>,
) -> anyhow::Result<()> {
    let path = key_path(key)?;
    if !path.exists() {
        bail!(
            "no signing key at {}; run `plughost keys generate` first",
            path.display()
        );
    }
    let keypair = KeyPair::load_or_generate(&path)?;
    let id = sign_dir(config, dir, signer, &keypair)?;
    println!(
        "{}",
        Theme::success(&format!("Signed {id} as '{signer}'"))
    );
    println!(
        "  Fingerprint: {}",
        keypair.export_public_key().fingerprint()
    );
    Ok(())
}

/// Rewrite `dir/plugin.toml` with a fresh signature block. Returns the
/// instance id.
pub(crate) fn sign_dir(
    config: &Config,
    dir: &Path,
    signer: &str,
    keypair: &KeyPair,
) -> anyhow::Result<String> {
    let text = read_manifest(dir)?;
    let payload = CodePayload::from_dir(dir)
        .with_context(|| format!("failed to read payload in {}", dir.display()))?;
    let limits = SchemaLimits {
        allowed_extensions: config.sandbox.allowed_extensions.clone(),
        max_heap_mb: config.sandbox.max_heap_mb_ceiling,
        require_signature: false,
    };
    let mut manifest = check(&text, &limits, Some(&payload))?;
    sign_manifest(&mut manifest, &payload, keypair, signer);
    let signed = toml::to_string(&manifest).context("failed to encode manifest")?;
    std::fs::write(dir.join(MANIFEST_FILE_NAME), signed)
        .with_context(|| format!("failed to write manifest in {}", dir.display()))?;
    Ok(manifest.instance_id().to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use plughost_manifest::ManifestValidator;
    use plughost_test::{PluginFixture, TestSigner};

    use super::*;

    #[test]
    fn signed_directory_validates() {
        let dir = tempfile::tempdir().unwrap();
        PluginFixture::script("greeter", "0.3.0", "#!/bin/sh\n")
            .write_unsigned(dir.path())
            .unwrap();
        let signer = TestSigner::new("local");

        let id = sign_dir(&Config::default(), dir.path(), "local", signer.keypair()).unwrap();
        assert_eq!(id, "greeter@0.3.0");

        let validator = ManifestValidator::new(
            Arc::new(signer.registry()),
            SchemaLimits {
                allowed_extensions: Config::default().sandbox.allowed_extensions,
                max_heap_mb: 4_096,
                require_signature: true,
            },
        );
        assert!(validator.validate_dir(dir.path()).is_ok());
    }

    #[test]
    fn invalid_manifest_is_not_signed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.sh"), "true").unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILE_NAME),
            "name = \"x\"\nversion = \"1.0.0\"\nentryPoint = \"main.sh\"\n",
        )
        .unwrap();
        let err = sign_dir(
            &Config::default(),
            dir.path(),
            "local",
            &KeyPair::generate(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("permissions"));
    }
}
