//! Plugins that fail validation never run any code.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{Harness, PROMPT, next_matching, plugin};
use plughost_core::{HookKind, InstanceStatus};
use plughost_events::DiagnosticKind;
use plughost_manifest::{MANIFEST_FILE_NAME, SignatureError, ValidationError};
use plughost_runtime::RuntimeError;
use plughost_test::{PluginFixture, RecordingGuest, SideEffectProbe, TestSigner};

/// Register a guest for `name` that counts how often a context is launched.
fn counting_guest(h: &Harness, name: &str, probe: &SideEffectProbe) -> Arc<AtomicUsize> {
    let launches = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&launches);
    let guest = RecordingGuest::new().with_probe(probe.clone());
    h.register_with(name, move |_spec| {
        counter.fetch_add(1, Ordering::SeqCst);
        guest.clone()
    });
    launches
}

#[tokio::test]
async fn missing_permissions_is_a_schema_error() {
    let h = Harness::new();
    let dir = h.plugins().join("no-perms");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("main.native"), "no-perms").unwrap();
    std::fs::write(
        dir.join(MANIFEST_FILE_NAME),
        r#"name = "no-perms"
version = "1.0.0"
entryPoint = "main.native"

[isolationLimits]
maxHeapMb = 64
"#,
    )
    .unwrap();
    let mut diagnostics = h.runtime.subscribe_diagnostics();

    let err = h.runtime.load(&dir).await.unwrap_err();
    let RuntimeError::Validation(ValidationError::Schema(schema)) = &err else {
        panic!("expected a schema error, got {err}");
    };
    assert!(schema.mentions("permissions"));
    assert!(err.to_string().contains("permissions: required"), "{err}");

    let diagnostic = next_matching(&mut diagnostics, PROMPT, |d| d.kind == DiagnosticKind::SchemaError)
        .await
        .expect("schema diagnostic");
    assert_eq!(diagnostic.plugin, "no-perms");
    assert!(h.runtime.table().current(&plugin("no-perms")).is_none());
}

#[tokio::test]
async fn untrusted_signer_never_runs_code() {
    let h = Harness::new();
    let probe = SideEffectProbe::new();
    let launches = counting_guest(&h, "intruder", &probe);
    let dir = PluginFixture::native("intruder", "1.0.0")
        .hook(HookKind::OnLoad, "load")
        .install(&h.plugins(), &TestSigner::new("test-publisher"))
        .unwrap();
    let mut lifecycle = h.runtime.subscribe_lifecycle();
    let mut diagnostics = h.runtime.subscribe_diagnostics();

    let err = h.runtime.load(&dir).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Validation(ValidationError::Signature(SignatureError::Mismatch))
    ));

    let failed = next_matching(&mut lifecycle, PROMPT, |e| e.to == InstanceStatus::Failed)
        .await
        .expect("failed transition");
    assert_eq!(failed.instance.to_string(), "intruder@1.0.0");
    assert!(
        next_matching(&mut diagnostics, PROMPT, |d| d.kind == DiagnosticKind::SignatureError)
            .await
            .is_some()
    );
    assert_eq!(launches.load(Ordering::SeqCst), 0);
    assert!(probe.entries().is_empty());
    assert_eq!(probe.max_concurrent(), 0);
}

#[tokio::test]
async fn tampered_payload_is_rejected() {
    let h = Harness::new();
    let probe = SideEffectProbe::new();
    let launches = counting_guest(&h, "tampered", &probe);
    let dir = h.install(&PluginFixture::native("tampered", "1.0.0").hook(HookKind::OnLoad, "load"));
    std::fs::write(dir.join("main.native"), "replaced after signing").unwrap();

    let err = h.runtime.load(&dir).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Validation(ValidationError::Signature(_))
    ));
    assert_eq!(launches.load(Ordering::SeqCst), 0);
    assert!(probe.entries().is_empty());
}

#[tokio::test]
async fn unsigned_manifest_is_rejected() {
    let h = Harness::new();
    let probe = SideEffectProbe::new();
    let launches = counting_guest(&h, "unsigned", &probe);
    let dir = h.plugins().join("unsigned");
    PluginFixture::native("unsigned", "1.0.0")
        .hook(HookKind::OnLoad, "load")
        .write_unsigned(&dir)
        .unwrap();

    assert!(h.runtime.load(&dir).await.is_err());
    assert_eq!(launches.load(Ordering::SeqCst), 0);
    let statuses = h.runtime.statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].status, InstanceStatus::Failed);
    assert!(statuses[0].instance.is_none());
}

#[tokio::test]
async fn trusted_plugin_runs_on_load() {
    let h = Harness::new();
    let probe = SideEffectProbe::new();
    let launches = counting_guest(&h, "trusted", &probe);

    let instance = h
        .load(&PluginFixture::native("trusted", "1.0.0").hook(HookKind::OnLoad, "load"))
        .await;
    assert_eq!(instance.status(), InstanceStatus::Active);
    assert_eq!(launches.load(Ordering::SeqCst), 1);
    assert_eq!(probe.count("load"), 1);
}
