//! Out-of-scope host calls are denied, recorded once, and survivable.

mod common;

use std::time::Duration;

use common::{Harness, PROMPT, next_matching, plugin};
use plughost_core::{Capability, HookKind, InstanceStatus};
use plughost_events::DiagnosticKind;
use plughost_runtime::JobRequest;
use plughost_test::{Behavior, PluginFixture, RecordingGuest};
use serde_json::json;

const DENIED_PATH: &str = "/etc/plughost-denied";

fn reader() -> PluginFixture {
    PluginFixture::native("fs-reader", "1.0.0")
        .filesystem("/plugins", "read")
        .hook(HookKind::OnJobReceived, "job")
}

fn job(target: &str) -> JobRequest {
    JobRequest {
        job_type: "custom".into(),
        target: plugin(target),
        payload: json!({}),
    }
}

fn write_outside_grant() -> Behavior {
    Behavior::WriteFile {
        path: DENIED_PATH.into(),
        contents: "owned".into(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn write_outside_grant_is_denied_once() {
    let h = Harness::with_config(|c| c.dispatcher.max_attempts = 1);
    let guest = RecordingGuest::new().on("job", write_outside_grant());
    h.register("fs-reader", &guest);
    let instance = h.load(&reader()).await;
    let mut violations = h.runtime.subscribe_violations();
    let mut dead = h.runtime.subscribe_dead_letters();

    h.runtime.submit(job("fs-reader")).await.unwrap();

    let violation = next_matching(&mut violations, PROMPT, |_| true)
        .await
        .expect("violation recorded");
    assert_eq!(violation.plugin_id.to_string(), "fs-reader@1.0.0");
    assert_eq!(violation.target, DENIED_PATH);
    assert_eq!(violation.capability, Capability::FsWrite);
    assert_eq!(violation.violations_in_window, 1);
    assert!(!violation.threshold_exceeded);
    assert!(!std::path::Path::new(DENIED_PATH).exists());

    let notice = next_matching(&mut dead, PROMPT, |_| true)
        .await
        .expect("handler error dead-lettered");
    assert!(notice.last_error.contains("denied"), "{}", notice.last_error);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(violations.drain().is_empty());

    // The plugin keeps running and serves the next job.
    assert_eq!(instance.status(), InstanceStatus::Active);
    guest.set("job", Behavior::Reply(json!("still here")));
    let mut jobs = h.runtime.subscribe_jobs();
    h.runtime.submit(job("fs-reader")).await.unwrap();
    let finished = next_matching(&mut jobs, PROMPT, |_| true).await.unwrap();
    assert_eq!(finished.result, json!("still here"));
    assert_eq!(
        h.runtime.table().current(&plugin("fs-reader")).unwrap().id(),
        instance.id()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn granted_read_is_allowed() {
    let h = Harness::new();
    let data = h.root().join("data");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::write(data.join("reading.txt"), "42").unwrap();
    let path = data.join("reading.txt").display().to_string();

    let guest = RecordingGuest::new().on("job", Behavior::ReadFile(path));
    h.register("fs-reader", &guest);
    h.load(
        &PluginFixture::native("fs-reader", "1.0.0")
            .filesystem(&data.display().to_string(), "read")
            .hook(HookKind::OnJobReceived, "job"),
    )
    .await;
    let mut violations = h.runtime.subscribe_violations();
    let mut jobs = h.runtime.subscribe_jobs();

    h.runtime.submit(job("fs-reader")).await.unwrap();
    let finished = next_matching(&mut jobs, PROMPT, |_| true).await.unwrap();
    assert_eq!(finished.result, json!({ "contents": "42" }));
    assert!(violations.drain().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn threshold_disables_the_plugin() {
    let h = Harness::with_config(|c| {
        c.dispatcher.max_attempts = 1;
        c.permissions.violation_threshold = 3;
    });
    let guest = RecordingGuest::new().on("job", write_outside_grant());
    h.register("fs-reader", &guest);
    h.load(&reader()).await;
    let mut diagnostics = h.runtime.subscribe_diagnostics();
    let mut violations = h.runtime.subscribe_violations();

    for _ in 0..3 {
        h.runtime.submit(job("fs-reader")).await.unwrap();
    }

    let third = next_matching(&mut violations, PROMPT, |v| v.violations_in_window == 3)
        .await
        .expect("third violation");
    assert!(third.threshold_exceeded);
    let disabled = next_matching(&mut diagnostics, PROMPT, |d| d.kind == DiagnosticKind::Disabled)
        .await
        .expect("plugin disabled");
    assert_eq!(disabled.plugin, "fs-reader");
    assert!(
        common::wait(|| h.runtime.table().current(&plugin("fs-reader")).is_none()).await,
        "disabled plugin is no longer routed"
    );
    assert!(h.runtime.disabled_reason(&plugin("fs-reader")).is_some());
    let reported = h.runtime.statuses();
    let reported = reported
        .iter()
        .find(|s| s.id.name().as_str() == "fs-reader")
        .expect("disabled plugin is still reported");
    assert!(reported.disabled_reason.is_some());

    // Installs are refused until an operator force-reloads.
    assert!(h.runtime.reload(&plugin("fs-reader")).await.is_err());
    guest.set("job", Behavior::Echo);
    let instance = h.runtime.force_reload(&plugin("fs-reader")).await.unwrap();
    assert_eq!(instance.status(), InstanceStatus::Active);
    assert!(h.runtime.disabled_reason(&plugin("fs-reader")).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn queue_publish_needs_a_grant() {
    let h = Harness::with_config(|c| c.dispatcher.max_attempts = 1);
    let guest = RecordingGuest::new().on(
        "job",
        Behavior::Publish {
            topic: "alerts".into(),
            message: json!({ "level": "high" }),
        },
    );
    h.register("chatty", &guest);
    h.load(
        &PluginFixture::native("chatty", "1.0.0")
            .queue("metrics", "publish")
            .hook(HookKind::OnJobReceived, "job"),
    )
    .await;
    let mut violations = h.runtime.subscribe_violations();

    h.runtime.submit(job("chatty")).await.unwrap();
    let violation = next_matching(&mut violations, PROMPT, |_| true).await.unwrap();
    assert_eq!(violation.capability, Capability::QueuePublish);
    assert_eq!(violation.target, "alerts");
}
