//! Keys command: manage the publisher signing key.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use plughost_config::Config;
use plughost_crypto::{KeyPair, PUBLIC_KEY_EXTENSION};

use crate::theme::Theme;

/// `~/.plughost/keys/signing.key`, or `key` when given.
pub(crate) fn key_path(key: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(key) = key {
        return Ok(key);
    }
    let dirs = directories::BaseDirs::new().context("cannot determine home directory")?;
    Ok(dirs.home_dir().join(".plughost").join("keys").join("signing.key"))
}

/// Show the public key of the signing key.
pub(crate) fn show_key(key: Option<PathBuf>) -> anyhow::Result<()> {
    let path = key_path(key)?;
    if !path.exists() {
        bail!(
            "no signing key at {}; run `plughost keys generate` first",
            path.display()
        );
    }
    let keypair = KeyPair::load_or_generate(&path)?;
    print_key(&keypair, &path);
    Ok(())
}

/// Generate a signing key, optionally trusting it locally as `trust`.
pub(crate) fn generate_key(
    config: &Config,
    key: Option<PathBuf>,
    force: bool,
    trust: Option<&str>,
) -> anyhow::Result<()> {
    let path = key_path(key)?;
    if path.exists() {
        if !force {
            println!("{}", Theme::warning("A signing key already exists."));
            println!(
                "{}",
                Theme::warning("Plugins signed with it will stop validating once it is replaced.")
            );
            bail!("refusing to overwrite {} without --force", path.display());
        }
        std::fs::remove_file(&path)
            .with_context(|| format!("failed to remove {}", path.display()))?;
    }

    let keypair = KeyPair::load_or_generate(&path)?;
    println!("{}", Theme::success("New signing key generated."));
    print_key(&keypair, &path);

    if let Some(signer) = trust {
        let trusted = trust_key(&config.runtime.trust_dir, signer, &keypair)?;
        println!(
            "{}",
            Theme::success(&format!("Trusted as '{signer}' in {}", trusted.display()))
        );
    }
    Ok(())
}

/// Write the public key to `<trust_dir>/<signer>.pub`.
pub(crate) fn trust_key(trust_dir: &Path, signer: &str, keypair: &KeyPair) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(trust_dir)
        .with_context(|| format!("failed to create {}", trust_dir.display()))?;
    let path = trust_dir.join(format!("{signer}.{PUBLIC_KEY_EXTENSION}"));
    std::fs::write(&path, keypair.export_public_key().to_base64())
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

fn print_key(keypair: &KeyPair, path: &Path) {
    let public = keypair.export_public_key();
    println!("\n{}", Theme::header("Signing Key"));
    println!("{}", Theme::field("Fingerprint", &public.fingerprint()));
    println!("{}", Theme::field("Public key", &public.to_base64()));
    println!(
        "{}",
        Theme::field("Key file", &Theme::dimmed(&path.display().to_string()))
    );
    println!();
}
