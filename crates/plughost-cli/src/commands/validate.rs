//! Validate command: check a plugin directory the way the loader would.

use std::path::Path;
use std::sync::Arc;

use anyhow::bail;
use plughost_config::Config;
use plughost_crypto::SignerRegistry;
use plughost_manifest::{ManifestValidator, SchemaLimits, ValidationError};

use crate::theme::Theme;

/// Validate the manifest and payload in `dir`.
pub(crate) fn validate(config: &Config, dir: &Path, allow_unsigned: bool) -> anyhow::Result<()> {
    let registry = SignerRegistry::load_dir(&config.runtime.trust_dir)?;
    let validator = ManifestValidator::new(
        Arc::new(registry),
        SchemaLimits {
            allowed_extensions: config.sandbox.allowed_extensions.clone(),
            max_heap_mb: config.sandbox.max_heap_mb_ceiling,
            require_signature: !allow_unsigned,
        },
    );

    match validator.validate_dir(dir) {
        Ok(validated) => {
            let manifest = validated.manifest();
            println!(
                "{}",
                Theme::success(&format!("{} is valid", validated.instance_id()))
            );
            println!("{}", Theme::field("Entry point", &manifest.entry_point));
            println!(
                "{}",
                Theme::field("Payload", &validated.payload_digest().to_hex())
            );
            if let Some(signature) = &manifest.signature {
                println!("{}", Theme::field("Signed by", &signature.signer));
            }
            Ok(())
        },
        Err(ValidationError::Schema(e)) => {
            println!("{}", Theme::error("Manifest has schema errors:"));
            for issue in &e.issues {
                println!("  {} {issue}", Theme::error("-"));
            }
            bail!("{} is not a valid plugin", dir.display())
        },
        Err(e) => {
            println!("{}", Theme::error(&e.to_string()));
            bail!("{} is not a valid plugin", dir.display())
        },
    }
}

#[cfg(test)]
mod tests {
    use plughost_test::{PluginFixture, TestSigner};

    use super::*;

    fn config_trusting(trust_dir: &Path) -> Config {
        let mut config = Config::default();
        config.runtime.trust_dir = trust_dir.to_path_buf();
        config
    }

    #[test]
    fn accepts_trusted_signature() {
        let tmp = tempfile::tempdir().unwrap();
        let signer = TestSigner::new("acme");
        signer.write_trust_file(&tmp.path().join("trust")).unwrap();
        let dir = PluginFixture::script("greeter", "1.0.0", "#!/bin/sh\n")
            .install(tmp.path(), &signer)
            .unwrap();

        validate(&config_trusting(&tmp.path().join("trust")), &dir, false).unwrap();
    }

    #[test]
    fn unsigned_needs_flag() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("greeter");
        PluginFixture::script("greeter", "1.0.0", "#!/bin/sh\n")
            .write_unsigned(&dir)
            .unwrap();
        let config = config_trusting(&tmp.path().join("missing"));

        assert!(validate(&config, &dir, false).is_err());
        validate(&config, &dir, true).unwrap();
    }
}
