//! Structural manifest check.
//!
//! The raw TOML tree is walked field by field and every defect is collected
//! before anything is deserialized, so a [`SchemaError`] always lists all
//! failing fields. Only a clean document is turned into a [`Manifest`].

use std::net::IpAddr;
use std::path::{Component, Path};

use plughost_core::{HookKind, PluginName};
use toml::{Table, Value};

use crate::error::{FieldIssue, SchemaError};
use crate::model::{Manifest, parse_device_id};
use crate::payload::CodePayload;

/// Maximum entries in any grant list.
pub const MAX_GRANT_ENTRIES: usize = 64;

/// Maximum `maxConcurrentHandlers`.
pub const MAX_CONCURRENT_HANDLERS: i64 = 64;

const MAX_DESCRIPTION_LEN: usize = 512;
const MAX_SIGNER_LEN: usize = 128;
const MAX_HANDLER_LEN: usize = 64;
const MAX_PATTERN_LEN: usize = 255;

const TOP_LEVEL_KEYS: &[&str] = &[
    "name",
    "version",
    "entryPoint",
    "description",
    "concurrencySafe",
    "permissions",
    "hooks",
    "isolationLimits",
    "signature",
];

/// Platform bounds applied by the schema check.
#[derive(Debug, Clone)]
pub struct SchemaLimits {
    /// Entry point extensions (without dot) that may be executed.
    pub allowed_extensions: Vec<String>,
    /// Largest accepted `isolationLimits.maxHeapMb`.
    pub max_heap_mb: u64,
    /// Whether a `signature` block is required.
    pub require_signature: bool,
}

impl Default for SchemaLimits {
    fn default() -> Self {
        Self {
            allowed_extensions: ["native", "sh", "py", "js", "bin"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            max_heap_mb: 4_096,
            require_signature: true,
        }
    }
}

impl SchemaLimits {
    /// Limits for tooling that handles manifests before they are signed.
    #[must_use]
    pub fn unsigned(mut self) -> Self {
        self.require_signature = false;
        self
    }
}

/// Check a manifest document.
///
/// When `payload` is given, the entry point must be one of its files.
///
/// # Errors
///
/// Returns a [`SchemaError`] listing every failing field.
pub fn check(
    text: &str,
    limits: &SchemaLimits,
    payload: Option<&CodePayload>,
) -> Result<Manifest, SchemaError> {
    let root: Table = toml::from_str(text).map_err(|e| SchemaError {
        issues: vec![FieldIssue::new("manifest", format!("not valid TOML: {}", e.message()))],
    })?;

    let mut c = Checker::default();
    for key in root.keys() {
        if !TOP_LEVEL_KEYS.contains(&key.as_str()) {
            c.issue(key, "unknown field");
        }
    }

    c.check_name(root.get("name"));
    c.check_version(root.get("version"));
    c.check_entry_point(root.get("entryPoint"), limits, payload);
    if let Some(description) = root.get("description") {
        match description.as_str() {
            Some(d) if d.len() > MAX_DESCRIPTION_LEN => c.issue(
                "description",
                format!("must be at most {MAX_DESCRIPTION_LEN} characters"),
            ),
            Some(_) => {},
            None => c.issue("description", "must be a string"),
        }
    }
    if let Some(flag) = root.get("concurrencySafe")
        && !flag.is_bool()
    {
        c.issue("concurrencySafe", "must be a boolean");
    }
    c.check_permissions(root.get("permissions"));
    c.check_hooks(root.get("hooks"));
    c.check_limits(root.get("isolationLimits"), limits);
    c.check_signature(root.get("signature"), limits.require_signature);

    if !c.issues.is_empty() {
        return Err(SchemaError { issues: c.issues });
    }
    Value::Table(root).try_into().map_err(|e: toml::de::Error| SchemaError {
        issues: vec![FieldIssue::new("manifest", e.message().to_string())],
    })
}

#[derive(Default)]
struct Checker {
    issues: Vec<FieldIssue>,
}

impl Checker {
    fn issue(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(FieldIssue::new(field, message));
    }

    fn required<'a>(&mut self, field: &str, value: Option<&'a Value>) -> Option<&'a Value> {
        if value.is_none() {
            self.issue(field, "required");
        }
        value
    }

    fn string<'a>(&mut self, field: &str, value: &'a Value) -> Option<&'a str> {
        let s = value.as_str();
        if s.is_none() {
            self.issue(field, "must be a string");
        }
        s
    }

    fn table<'a>(&mut self, field: &str, value: &'a Value) -> Option<&'a Table> {
        let t = value.as_table();
        if t.is_none() {
            self.issue(field, "must be a table");
        }
        t
    }

    fn list<'a>(&mut self, field: &str, value: &'a Value) -> Option<&'a [Value]> {
        let Some(items) = value.as_array() else {
            self.issue(field, "must be an array");
            return None;
        };
        if items.len() > MAX_GRANT_ENTRIES {
            self.issue(field, format!("at most {MAX_GRANT_ENTRIES} entries allowed"));
            return None;
        }
        Some(items)
    }

    fn closed_keys(&mut self, prefix: &str, table: &Table, allowed: &[&str]) {
        for key in table.keys() {
            if !allowed.contains(&key.as_str()) {
                self.issue(format!("{prefix}.{key}"), "unknown field");
            }
        }
    }

    fn int_in_range(&mut self, field: &str, value: &Value, min: i64, max: i64) {
        match value.as_integer() {
            Some(n) if (min..=max).contains(&n) => {},
            Some(n) => self.issue(field, format!("{n} is out of range {min}..={max}")),
            None => self.issue(field, "must be an integer"),
        }
    }

    fn check_name(&mut self, value: Option<&Value>) {
        let Some(value) = self.required("name", value) else { return };
        if let Some(name) = self.string("name", value)
            && !PluginName::is_valid(name)
        {
            self.issue("name", "must match [a-z0-9-]{3,50}");
        }
    }

    fn check_version(&mut self, value: Option<&Value>) {
        let Some(value) = self.required("version", value) else { return };
        if let Some(version) = self.string("version", value)
            && let Err(e) = semver::Version::parse(version)
        {
            self.issue("version", format!("not a semantic version: {e}"));
        }
    }

    fn check_entry_point(
        &mut self,
        value: Option<&Value>,
        limits: &SchemaLimits,
        payload: Option<&CodePayload>,
    ) {
        const FIELD: &str = "entryPoint";
        let Some(value) = self.required(FIELD, value) else { return };
        let Some(entry) = self.string(FIELD, value) else { return };
        let path = Path::new(entry);
        if entry.is_empty() {
            self.issue(FIELD, "must not be empty");
            return;
        }
        if !path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            self.issue(FIELD, "must be a relative path inside the plugin directory");
            return;
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if limits.allowed_extensions.iter().any(|a| a == ext) => {},
            Some(ext) => self.issue(
                FIELD,
                format!(
                    "extension '{ext}' not allowed; expected one of: {}",
                    limits.allowed_extensions.join(", ")
                ),
            ),
            None => self.issue(FIELD, "must have a file extension"),
        }
        if let Some(payload) = payload
            && !payload.contains(entry)
        {
            self.issue(FIELD, "file not found in plugin payload");
        }
    }

    fn check_permissions(&mut self, value: Option<&Value>) {
        const FIELD: &str = "permissions";
        let Some(value) = self.required(FIELD, value) else { return };
        let Some(table) = self.table(FIELD, value) else { return };
        for (category, value) in table {
            let field = format!("{FIELD}.{category}");
            match category.as_str() {
                "filesystem" => self.check_filesystem(&field, value),
                "network" => self.check_network(&field, value),
                "device" => self.check_device(&field, value),
                "queue" => self.check_queue(&field, value),
                _ => self.issue(field, "unknown capability category"),
            }
        }
    }

    fn check_filesystem(&mut self, field: &str, value: &Value) {
        let Some(items) = self.list(field, value) else { return };
        for (i, item) in items.iter().enumerate() {
            let entry = format!("{field}[{i}]");
            let Some(grant) = self.table(&entry, item) else { continue };
            self.closed_keys(&entry, grant, &["path", "mode"]);
            let path_field = format!("{entry}.path");
            match grant.get("path") {
                None => self.issue(path_field, "required"),
                Some(p) => {
                    if let Some(p) = self.string(&path_field, p) {
                        if !p.starts_with('/') {
                            self.issue(path_field, "must be absolute");
                        } else if p.split('/').any(|seg| seg == "..") {
                            self.issue(path_field, "must not contain '..'");
                        } else if p.len() > MAX_PATTERN_LEN {
                            self.issue(path_field, "too long");
                        }
                    }
                },
            }
            self.one_of(&format!("{entry}.mode"), grant.get("mode"), &[
                "read",
                "write",
                "readwrite",
            ]);
        }
    }

    fn one_of(&mut self, field: &str, value: Option<&Value>, allowed: &[&str]) {
        let Some(value) = self.required(field, value) else { return };
        if let Some(s) = self.string(field, value)
            && !allowed.contains(&s)
        {
            self.issue(field, format!("must be one of: {}", allowed.join(", ")));
        }
    }

    fn check_network(&mut self, field: &str, value: &Value) {
        let Some(table) = self.table(field, value) else { return };
        self.closed_keys(field, table, &["outbound", "inbound"]);
        if let Some(outbound) = table.get("outbound") {
            let list_field = format!("{field}.outbound");
            if let Some(items) = self.list(&list_field, outbound) {
                for (i, item) in items.iter().enumerate() {
                    let entry = format!("{list_field}[{i}]");
                    if let Some(dest) = self.string(&entry, item)
                        && let Err(message) = check_destination(dest)
                    {
                        self.issue(entry, message);
                    }
                }
            }
        }
        if let Some(inbound) = table.get("inbound") {
            let entry = format!("{field}.inbound");
            if let Some(rule) = self.table(&entry, inbound) {
                self.closed_keys(&entry, rule, &["port", "interface"]);
                let port_field = format!("{entry}.port");
                if let Some(port) = self.required(&port_field, rule.get("port")) {
                    self.int_in_range(&port_field, port, 1, i64::from(u16::MAX));
                }
                let iface_field = format!("{entry}.interface");
                if let Some(iface) = self.required(&iface_field, rule.get("interface"))
                    && let Some(iface) = self.string(&iface_field, iface)
                    && iface.parse::<IpAddr>().is_err()
                {
                    self.issue(iface_field, "must be an IP address");
                }
            }
        }
    }

    fn check_device(&mut self, field: &str, value: &Value) {
        let Some(table) = self.table(field, value) else { return };
        self.closed_keys(field, table, &["vendorIds", "productIds"]);
        for key in ["vendorIds", "productIds"] {
            let Some(ids) = table.get(key) else { continue };
            let list_field = format!("{field}.{key}");
            let Some(items) = self.list(&list_field, ids) else { continue };
            for (i, item) in items.iter().enumerate() {
                let entry = format!("{list_field}[{i}]");
                let ok = match item {
                    Value::Integer(n) => (0..=i64::from(u16::MAX)).contains(n),
                    Value::String(s) => parse_device_id(s).is_some(),
                    _ => false,
                };
                if !ok {
                    self.issue(entry, "must be a 16-bit id (integer or \"0x1234\")");
                }
            }
        }
    }

    fn check_queue(&mut self, field: &str, value: &Value) {
        let Some(items) = self.list(field, value) else { return };
        for (i, item) in items.iter().enumerate() {
            let entry = format!("{field}[{i}]");
            let Some(grant) = self.table(&entry, item) else { continue };
            self.closed_keys(&entry, grant, &["topic", "mode"]);
            let topic_field = format!("{entry}.topic");
            if let Some(topic) = self.required(&topic_field, grant.get("topic"))
                && let Some(topic) = self.string(&topic_field, topic)
                && !is_valid_topic(topic)
            {
                self.issue(
                    topic_field,
                    "must be dot-separated segments of [A-Za-z0-9_-] or '*'",
                );
            }
            self.one_of(&format!("{entry}.mode"), grant.get("mode"), &[
                "publish",
                "subscribe",
                "both",
            ]);
        }
    }

    fn check_hooks(&mut self, value: Option<&Value>) {
        const FIELD: &str = "hooks";
        let Some(value) = value else { return };
        let Some(table) = self.table(FIELD, value) else { return };
        if table.contains_key("onJob") && table.contains_key("onJobReceived") {
            self.issue("hooks.onJob", "duplicates hooks.onJobReceived");
        }
        for (key, handler) in table {
            let field = format!("{FIELD}.{key}");
            if HookKind::from_manifest_key(key).is_none() {
                self.issue(field, "unknown hook");
                continue;
            }
            if let Some(name) = self.string(&field, handler)
                && !is_valid_handler(name)
            {
                self.issue(
                    field,
                    format!("handler must be an identifier of at most {MAX_HANDLER_LEN} characters"),
                );
            }
        }
    }

    fn check_limits(&mut self, value: Option<&Value>, limits: &SchemaLimits) {
        const FIELD: &str = "isolationLimits";
        let Some(value) = self.required(FIELD, value) else { return };
        let Some(table) = self.table(FIELD, value) else { return };
        self.closed_keys(FIELD, table, &[
            "maxHeapMb",
            "maxCpuPercent",
            "maxConcurrentHandlers",
        ]);
        let heap_field = format!("{FIELD}.maxHeapMb");
        if let Some(heap) = self.required(&heap_field, table.get("maxHeapMb")) {
            let ceiling = i64::try_from(limits.max_heap_mb).unwrap_or(i64::MAX);
            self.int_in_range(&heap_field, heap, 1, ceiling);
        }
        if let Some(cpu) = table.get("maxCpuPercent") {
            self.int_in_range(&format!("{FIELD}.maxCpuPercent"), cpu, 1, 100);
        }
        if let Some(handlers) = table.get("maxConcurrentHandlers") {
            self.int_in_range(
                &format!("{FIELD}.maxConcurrentHandlers"),
                handlers,
                1,
                MAX_CONCURRENT_HANDLERS,
            );
        }
    }

    fn check_signature(&mut self, value: Option<&Value>, required: bool) {
        const FIELD: &str = "signature";
        let value = if required {
            self.required(FIELD, value)
        } else {
            value
        };
        let Some(value) = value else { return };
        let Some(table) = self.table(FIELD, value) else { return };
        self.closed_keys(FIELD, table, &["algorithm", "value", "signer"]);
        for key in ["algorithm", "value", "signer"] {
            let field = format!("{FIELD}.{key}");
            let Some(v) = self.required(&field, table.get(key)) else { continue };
            match self.string(&field, v) {
                Some("") => self.issue(field, "must not be empty"),
                Some(s) if key == "signer" && s.len() > MAX_SIGNER_LEN => {
                    self.issue(field, format!("must be at most {MAX_SIGNER_LEN} characters"));
                },
                _ => {},
            }
        }
    }
}

/// Validate an outbound destination pattern: `*`, `host`, `*.suffix`,
/// optionally followed by `:port`.
fn check_destination(dest: &str) -> Result<(), String> {
    if dest.len() > MAX_PATTERN_LEN {
        return Err("too long".to_string());
    }
    if dest == "*" {
        return Ok(());
    }
    let (host, port) = match dest.rsplit_once(':') {
        Some((h, p)) if !h.contains(':') => (h, Some(p)),
        _ => (dest, None),
    };
    if let Some(port) = port {
        match port.parse::<u16>() {
            Ok(p) if p > 0 => {},
            _ => return Err(format!("invalid port '{port}'")),
        }
    }
    let bare = host.strip_prefix("*.").unwrap_or(host);
    let valid = !bare.is_empty()
        && bare
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        && !bare.starts_with('.')
        && !bare.ends_with('.');
    if valid {
        Ok(())
    } else {
        Err(format!("invalid host pattern '{host}'"))
    }
}

fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_PATTERN_LEN
        && topic.split('.').all(|seg| {
            seg == "*"
                || (!seg.is_empty()
                    && seg
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        })
}

fn is_valid_handler(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= MAX_HANDLER_LEN
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
name = "usb-logger"
version = "1.0.0"
entryPoint = "main.sh"

[permissions]
filesystem = [{ path = "/plugins", mode = "read" }]
queue = [{ topic = "devices.*", mode = "publish" }]

[permissions.network]
outbound = ["api.example.com:443", "*.internal"]
inbound = { port = 8080, interface = "127.0.0.1" }

[permissions.device]
vendorIds = ["0x1234"]
productIds = [0x5678]

[hooks]
onLoad = "init"
onDeviceAttached = "attached"
onJob = "job"

[isolationLimits]
maxHeapMb = 64
maxConcurrentHandlers = 2

[signature]
algorithm = "ed25519"
value = "AAAA"
signer = "acme"
"#;

    fn limits() -> SchemaLimits {
        SchemaLimits::default()
    }

    #[test]
    fn valid_manifest_parses() {
        let manifest = check(VALID, &limits(), None).unwrap();
        assert_eq!(manifest.name.as_str(), "usb-logger");
        assert_eq!(manifest.permissions.device.vendor_ids, vec![0x1234]);
        assert_eq!(manifest.permissions.device.product_ids, vec![0x5678]);
        assert_eq!(manifest.hooks.handler(HookKind::OnJobReceived), Some("job"));
        assert_eq!(manifest.isolation_limits.max_cpu_percent, 100);
        assert_eq!(manifest.handler_concurrency(), 1);
    }

    #[test]
    fn missing_permissions_is_reported() {
        let text = VALID.replace("[permissions]\n", "[unused]\n");
        let text = text
            .replace("[permissions.network]", "[other.network]")
            .replace("[permissions.device]", "[other.device]");
        let err = check(&text, &limits(), None).unwrap_err();
        assert!(err.to_string().contains("permissions: required"), "{err}");
    }

    #[test]
    fn every_failing_field_is_listed() {
        let text = r#"
name = "Bad Name"
version = "one"
entryPoint = "../escape.exe"
[isolationLimits]
maxHeapMb = 0
"#;
        let err = check(text, &limits(), None).unwrap_err();
        for field in [
            "name",
            "version",
            "entryPoint",
            "permissions",
            "isolationLimits.maxHeapMb",
            "signature",
        ] {
            assert!(err.mentions(field), "missing {field} in {err}");
        }
    }

    #[test]
    fn unknown_categories_and_keys_are_rejected() {
        let text = VALID.replace(
            "[permissions.device]",
            "[permissions.camera]\nenabled = true\n[permissions.device]",
        );
        let text = text.replace("maxHeapMb = 64", "maxHeapMb = 64\nmaxDisk = 5");
        let err = check(&text, &limits(), None).unwrap_err();
        assert!(err.mentions("permissions.camera"));
        assert!(err.mentions("isolationLimits.maxDisk"));
    }

    #[test]
    fn extension_whitelist_applies() {
        let text = VALID.replace("main.sh", "main.exe");
        let err = check(&text, &limits(), None).unwrap_err();
        assert!(err.mentions("entryPoint"));
    }

    #[test]
    fn heap_ceiling_applies() {
        let text = VALID.replace("maxHeapMb = 64", "maxHeapMb = 999999");
        let err = check(&text, &limits(), None).unwrap_err();
        assert!(err.mentions("isolationLimits.maxHeapMb"));
    }

    #[test]
    fn grant_shapes_are_checked() {
        let text = VALID
            .replace("path = \"/plugins\", mode = \"read\"", "path = \"plugins\", mode = \"rw\"")
            .replace("\"0x1234\"", "\"0x12345\"")
            .replace("interface = \"127.0.0.1\"", "interface = \"localhost\"");
        let err = check(&text, &limits(), None).unwrap_err();
        assert!(err.mentions("permissions.filesystem[0].path"));
        assert!(err.mentions("permissions.filesystem[0].mode"));
        assert!(err.mentions("permissions.device.vendorIds[0]"));
        assert!(err.mentions("permissions.network.inbound.interface"));
    }

    #[test]
    fn unsigned_manifest_allowed_for_tooling() {
        let end = VALID.find("[signature]").unwrap();
        let unsigned = &VALID[..end];
        assert!(check(unsigned, &limits(), None).is_err());
        let manifest = check(unsigned, &limits().unsigned(), None).unwrap();
        assert!(manifest.signature.is_none());
    }

    #[test]
    fn destinations() {
        assert!(check_destination("*").is_ok());
        assert!(check_destination("api.example.com").is_ok());
        assert!(check_destination("*.example.com:8443").is_ok());
        assert!(check_destination("10.0.0.1:22").is_ok());
        assert!(check_destination("bad host").is_err());
        assert!(check_destination("host:0").is_err());
        assert!(check_destination("host:99999").is_err());
    }

    #[test]
    fn not_toml_is_a_single_issue() {
        let err = check("name = ", &limits(), None).unwrap_err();
        assert_eq!(err.issues.len(), 1);
        assert_eq!(err.issues[0].field, "manifest");
    }
}
