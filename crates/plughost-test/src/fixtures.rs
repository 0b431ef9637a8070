//! Signed plugin directories for tests.

use std::io;
use std::path::{Path, PathBuf};

use plughost_core::HookKind;
use plughost_crypto::{KeyPair, PUBLIC_KEY_EXTENSION, SignerRegistry};
use plughost_manifest::schema::{SchemaLimits, check};
use plughost_manifest::{CodePayload, MANIFEST_FILE_NAME, sign_manifest};
use toml::{Table, Value};

/// A publisher key trusted by the runtime under test.
#[derive(Debug)]
pub struct TestSigner {
    name: String,
    keypair: KeyPair,
}

impl TestSigner {
    /// Generate a fresh key for signer `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keypair: KeyPair::generate(),
        }
    }

    /// Signer reference written into `signature.signer`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The signing key.
    #[must_use]
    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    /// A registry trusting only this signer.
    #[must_use]
    pub fn registry(&self) -> SignerRegistry {
        let mut registry = SignerRegistry::new();
        registry.trust(self.name.clone(), self.keypair.export_public_key());
        registry
    }

    /// Write `<name>.pub` into `trust_dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns any I/O error.
    pub fn write_trust_file(&self, trust_dir: &Path) -> io::Result<PathBuf> {
        std::fs::create_dir_all(trust_dir)?;
        let path = trust_dir.join(format!("{}.{PUBLIC_KEY_EXTENSION}", self.name));
        std::fs::write(&path, self.keypair.export_public_key().to_base64())?;
        Ok(path)
    }
}

impl Default for TestSigner {
    fn default() -> Self {
        Self::new("test-signer")
    }
}

/// Builder for a plugin directory.
///
/// Defaults to an empty permission set, 64 MiB heap and no hooks.
#[derive(Debug, Clone)]
pub struct PluginFixture {
    name: String,
    version: String,
    entry_point: String,
    files: Vec<(String, Vec<u8>)>,
    hooks: Table,
    filesystem: Vec<Value>,
    outbound: Vec<Value>,
    vendor_ids: Vec<Value>,
    product_ids: Vec<Value>,
    queue: Vec<Value>,
    concurrency: Option<u32>,
    max_heap_mb: i64,
    description: Option<String>,
}

impl PluginFixture {
    fn new(name: &str, version: &str, entry_point: &str, contents: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            entry_point: entry_point.to_string(),
            files: vec![(entry_point.to_string(), contents)],
            hooks: Table::new(),
            filesystem: Vec::new(),
            outbound: Vec::new(),
            vendor_ids: Vec::new(),
            product_ids: Vec::new(),
            queue: Vec::new(),
            concurrency: None,
            max_heap_mb: 64,
            description: None,
        }
    }

    /// A plugin served by a guest registered on the thread backend.
    #[must_use]
    pub fn native(name: &str, version: &str) -> Self {
        Self::new(name, version, "main.native", format!("{name} {version}\n").into_bytes())
    }

    /// A plugin run as a `sh` script in a child process.
    #[must_use]
    pub fn script(name: &str, version: &str, script: &str) -> Self {
        Self::new(name, version, "main.sh", script.as_bytes().to_vec())
    }

    /// Bind `hook` to `handler`.
    #[must_use]
    pub fn hook(mut self, hook: HookKind, handler: &str) -> Self {
        self.hooks
            .insert(hook.manifest_key().to_string(), Value::String(handler.to_string()));
        self
    }

    /// Grant filesystem access to `path` (`read`, `write` or `readwrite`).
    #[must_use]
    pub fn filesystem(mut self, path: &str, mode: &str) -> Self {
        let mut grant = Table::new();
        grant.insert("path".into(), Value::String(path.to_string()));
        grant.insert("mode".into(), Value::String(mode.to_string()));
        self.filesystem.push(Value::Table(grant));
        self
    }

    /// Grant an outbound network destination.
    #[must_use]
    pub fn outbound(mut self, destination: &str) -> Self {
        self.outbound.push(Value::String(destination.to_string()));
        self
    }

    /// Accept devices with this vendor and product id.
    #[must_use]
    pub fn device(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.vendor_ids
            .push(Value::String(format!("0x{vendor_id:04x}")));
        self.product_ids
            .push(Value::String(format!("0x{product_id:04x}")));
        self
    }

    /// Grant a queue topic (`publish`, `subscribe` or `both`).
    #[must_use]
    pub fn queue(mut self, topic: &str, mode: &str) -> Self {
        let mut grant = Table::new();
        grant.insert("topic".into(), Value::String(topic.to_string()));
        grant.insert("mode".into(), Value::String(mode.to_string()));
        self.queue.push(Value::Table(grant));
        self
    }

    /// Declare the plugin concurrency-safe with `handlers` concurrent
    /// handlers.
    #[must_use]
    pub fn concurrency(mut self, handlers: u32) -> Self {
        self.concurrency = Some(handlers);
        self
    }

    /// Set `isolationLimits.maxHeapMb`.
    #[must_use]
    pub fn max_heap_mb(mut self, mb: i64) -> Self {
        self.max_heap_mb = mb;
        self
    }

    /// Set the description.
    #[must_use]
    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// Add a payload file.
    #[must_use]
    pub fn file(mut self, path: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.files.push((path.to_string(), contents.into()));
        self
    }

    /// The unsigned manifest document.
    #[must_use]
    pub fn manifest_toml(&self) -> String {
        let mut root = Table::new();
        root.insert("name".into(), Value::String(self.name.clone()));
        root.insert("version".into(), Value::String(self.version.clone()));
        root.insert("entryPoint".into(), Value::String(self.entry_point.clone()));
        if let Some(description) = &self.description {
            root.insert("description".into(), Value::String(description.clone()));
        }
        if self.concurrency.is_some() {
            root.insert("concurrencySafe".into(), Value::Boolean(true));
        }

        let mut permissions = Table::new();
        if !self.filesystem.is_empty() {
            permissions.insert("filesystem".into(), Value::Array(self.filesystem.clone()));
        }
        if !self.outbound.is_empty() {
            let mut network = Table::new();
            network.insert("outbound".into(), Value::Array(self.outbound.clone()));
            permissions.insert("network".into(), Value::Table(network));
        }
        if !self.vendor_ids.is_empty() {
            let mut device = Table::new();
            device.insert("vendorIds".into(), Value::Array(self.vendor_ids.clone()));
            device.insert("productIds".into(), Value::Array(self.product_ids.clone()));
            permissions.insert("device".into(), Value::Table(device));
        }
        if !self.queue.is_empty() {
            permissions.insert("queue".into(), Value::Array(self.queue.clone()));
        }
        root.insert("permissions".into(), Value::Table(permissions));

        if !self.hooks.is_empty() {
            root.insert("hooks".into(), Value::Table(self.hooks.clone()));
        }
        let mut limits = Table::new();
        limits.insert("maxHeapMb".into(), Value::Integer(self.max_heap_mb));
        if let Some(handlers) = self.concurrency {
            limits.insert(
                "maxConcurrentHandlers".into(),
                Value::Integer(i64::from(handlers)),
            );
        }
        root.insert("isolationLimits".into(), Value::Table(limits));
        toml::to_string(&root).unwrap_or_default()
    }

    /// Write the payload files and the unsigned manifest into `dir`.
    ///
    /// # Errors
    ///
    /// Returns any I/O error.
    pub fn write_unsigned(&self, dir: &Path) -> io::Result<PathBuf> {
        self.write_files(dir)?;
        std::fs::write(dir.join(MANIFEST_FILE_NAME), self.manifest_toml())?;
        Ok(dir.to_path_buf())
    }

    /// Write the payload files and a manifest signed by `signer` into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error, or an error wrapping the schema failure if the
    /// fixture describes an invalid manifest.
    pub fn write_signed(&self, dir: &Path, signer: &TestSigner) -> io::Result<PathBuf> {
        self.write_files(dir)?;
        let payload = CodePayload::from_dir(dir)?;
        let mut manifest = check(
            &self.manifest_toml(),
            &SchemaLimits::default().unsigned(),
            Some(&payload),
        )
        .map_err(|e| io::Error::other(e.to_string()))?;
        sign_manifest(&mut manifest, &payload, signer.keypair(), signer.name());
        let text = toml::to_string(&manifest).map_err(io::Error::other)?;
        std::fs::write(dir.join(MANIFEST_FILE_NAME), text)?;
        Ok(dir.to_path_buf())
    }

    /// Write a signed copy into `root/<name>` and return that directory.
    ///
    /// # Errors
    ///
    /// As [`Self::write_signed`].
    pub fn install(&self, root: &Path, signer: &TestSigner) -> io::Result<PathBuf> {
        self.write_signed(&root.join(&self.name), signer)
    }

    fn write_files(&self, dir: &Path) -> io::Result<()> {
        std::fs::create_dir_all(dir)?;
        for (path, contents) in &self.files {
            let target = dir.join(path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, contents)?;
        }
        Ok(())
    }
}
