//! Swapping versions while jobs are in flight.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{Harness, PROMPT, next_matching, plugin};
use plughost_core::{HookKind, InstanceStatus};
use plughost_events::{DiagnosticKind, ReloadOutcome};
use plughost_runtime::{JobRequest, RuntimeError};
use plughost_test::{Behavior, PluginFixture, RecordingGuest, SideEffectProbe};
use serde_json::json;

fn worker(version: &str) -> PluginFixture {
    PluginFixture::native("worker", version).hook(HookKind::OnJobReceived, "job")
}

fn job(n: u32) -> JobRequest {
    JobRequest {
        job_type: "work".into(),
        target: plugin("worker"),
        payload: json!({ "n": n }),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn watcher_swaps_while_a_job_finishes_on_the_old_version() {
    let h = Harness::with_config(|c| c.watcher.enabled = true);
    let old = RecordingGuest::labelled("1.0.0")
        .on("job", Behavior::Delay(Duration::from_millis(1_500)));
    let new = RecordingGuest::labelled("1.1.0");
    {
        let (old, new) = (old.clone(), new.clone());
        h.register_with("worker", move |spec| {
            if spec.instance.version().to_string() == "1.0.0" {
                old.clone()
            } else {
                new.clone()
            }
        });
    }
    h.install(&worker("1.0.0"));
    h.runtime.start().await.unwrap();
    let first = h
        .runtime
        .table()
        .current(&plugin("worker"))
        .expect("1.0.0 routed");
    assert_eq!(first.id().to_string(), "worker@1.0.0");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut jobs = h.runtime.subscribe_jobs();
    let mut reloads = h.runtime.subscribe_reloads();
    let slow = h.runtime.submit(job(1)).await.unwrap();
    assert!(old.wait_for_calls("job", 1, PROMPT).await);

    h.install(&worker("1.1.0"));
    let swapped = next_matching(&mut reloads, PROMPT, |r| {
        r.outcome == ReloadOutcome::Swapped
            && r.current.as_ref().is_some_and(|c| c.to_string() == "worker@1.1.0")
    })
    .await
    .expect("watcher swaps to 1.1.0");
    assert_eq!(swapped.previous.as_ref(), Some(first.id()));

    let fresh = h.runtime.submit(job(2)).await.unwrap();
    let mut finished = Vec::new();
    while finished.len() < 2 {
        let done = next_matching(&mut jobs, PROMPT, |j| j.job_id == slow || j.job_id == fresh)
            .await
            .expect("both jobs finish");
        finished.push(done);
    }
    let on = |id| {
        finished
            .iter()
            .find(|j| j.job_id == id)
            .map(|j| j.instance.to_string())
    };
    assert_eq!(on(slow).as_deref(), Some("worker@1.0.0"));
    assert_eq!(on(fresh).as_deref(), Some("worker@1.1.0"));
    assert_eq!(old.call_count("job"), 1);
    assert_eq!(new.call_count("job"), 1);

    // The old instance is retired once drained.
    assert!(
        common::wait(|| h
            .runtime
            .status(first.id())
            .is_some_and(|s| s.status == InstanceStatus::Unloaded && s.instance.is_none()))
        .await
    );
    assert_eq!(first.status(), InstanceStatus::Unloaded);
    h.runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn swap_mid_stream_delivers_every_job_once() {
    let h = Harness::new();
    let probe = SideEffectProbe::new();
    {
        let probe = probe.clone();
        h.register_with("worker", move |spec| {
            RecordingGuest::labelled(spec.instance.version().to_string())
                .with_probe(probe.clone())
                .on("job", Behavior::Delay(Duration::from_millis(50)))
        });
    }
    let v1 = worker("1.0.0")
        .write_signed(&h.root().join("v1"), &h.signer)
        .unwrap();
    let v2 = worker("2.0.0")
        .write_signed(&h.root().join("v2"), &h.signer)
        .unwrap();
    h.runtime.load(&v1).await.unwrap();
    let mut jobs = h.runtime.subscribe_jobs();

    let mut submitted = HashSet::new();
    for n in 0..10 {
        submitted.insert(h.runtime.submit(job(n)).await.unwrap());
    }
    h.runtime.load(&v2).await.unwrap();
    let mut after_swap = HashSet::new();
    for n in 10..20 {
        let id = h.runtime.submit(job(n)).await.unwrap();
        after_swap.insert(id);
        submitted.insert(id);
    }

    let mut seen = HashSet::new();
    while seen.len() < submitted.len() {
        let done = next_matching(&mut jobs, PROMPT, |j| submitted.contains(&j.job_id))
            .await
            .expect("every job finishes");
        assert!(seen.insert(done.job_id), "job {} finished twice", done.job_id);
        if after_swap.contains(&done.job_id) {
            assert_eq!(done.instance.to_string(), "worker@2.0.0");
        }
    }

    let entries = probe.entries();
    assert_eq!(entries.len(), 20);
    let ids: HashSet<_> = entries
        .iter()
        .map(|e| e.payload["jobId"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(ids.len(), 20);
    for id in &after_swap {
        let runs: Vec<_> = entries
            .iter()
            .filter(|e| e.payload["jobId"].as_str() == Some(id.to_string().as_str()))
            .collect();
        assert_eq!(runs.len(), 1, "job {id} ran {} times", runs.len());
        assert_eq!(runs[0].label, "2.0.0");
    }
    let on_v2 = entries.iter().filter(|e| e.label == "2.0.0").count();
    assert!(on_v2 >= 10, "only {on_v2} jobs ran on 2.0.0");
    assert!(probe.max_concurrent() <= 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_replacement_keeps_the_running_version() {
    let h = Harness::new();
    let guest = RecordingGuest::new();
    h.register("worker", &guest);
    let first = h.load(&worker("1.0.0")).await;
    let mut reloads = h.runtime.subscribe_reloads();
    let mut diagnostics = h.runtime.subscribe_diagnostics();

    guest.set("load", Behavior::Fail("bad config".into()));
    h.install(&worker("1.1.0").hook(HookKind::OnLoad, "load"));
    let err = h.runtime.reload(&plugin("worker")).await.unwrap_err();
    assert!(matches!(err, RuntimeError::ReloadConflict { .. }));

    let record = next_matching(&mut reloads, PROMPT, |_| true).await.unwrap();
    assert!(matches!(record.outcome, ReloadOutcome::Rejected { .. }));
    assert_eq!(record.previous.as_ref(), Some(first.id()));
    assert!(record.current.is_none());
    assert!(
        next_matching(&mut diagnostics, PROMPT, |d| d.kind == DiagnosticKind::ReloadConflict)
            .await
            .is_some()
    );

    let routed = h.runtime.table().current(&plugin("worker")).unwrap();
    assert_eq!(routed.id(), first.id());
    assert_eq!(routed.status(), InstanceStatus::Active);
    let mut finished = h.runtime.subscribe_jobs();
    let id = h.runtime.submit(job(7)).await.unwrap();
    let done = next_matching(&mut finished, PROMPT, |j| j.job_id == id)
        .await
        .unwrap();
    assert_eq!(done.instance, *first.id());
}

#[tokio::test(flavor = "multi_thread")]
async fn same_version_reload_gets_a_new_generation() {
    let h = Harness::new();
    h.register("worker", &RecordingGuest::new());
    let first = h.load(&worker("1.0.0")).await;
    let second = h.runtime.reload(&plugin("worker")).await.unwrap();

    assert_eq!(first.id(), second.id());
    assert!(second.generation() > first.generation());
    assert!(common::wait(|| first.status() == InstanceStatus::Unloaded).await);
    let current = h.runtime.status(second.id()).unwrap();
    assert_eq!(current.generation, second.generation());
}
