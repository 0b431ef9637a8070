//! Device events reach matching plugins exactly once.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Harness, PROMPT, next_matching, usb};
use plughost_core::HookKind;
use plughost_devices::{DeviceEnumerator, DeviceInfo, EventKind, EventLog, StaticEnumerator};
use plughost_test::{Behavior, PluginFixture, RecordingGuest};
use serde_json::json;

fn usb_logger(name: &str, vendor_id: u16, product_id: u16) -> PluginFixture {
    PluginFixture::native(name, "1.0.0")
        .device(vendor_id, product_id)
        .hook(HookKind::OnDeviceAttached, "attached")
        .hook(HookKind::OnDeviceDetached, "detached")
}

#[tokio::test(flavor = "multi_thread")]
async fn matching_attach_is_handled_within_500ms() {
    let h = Harness::new();
    let guest = RecordingGuest::new().on("attached", Behavior::Reply(json!({ "handled": true })));
    h.register("usb-logger", &guest);
    h.load(&usb_logger("usb-logger", 0x1234, 0x5678)).await;
    h.runtime.start_event_pump();
    let mut jobs = h.runtime.subscribe_jobs();

    let event = h.attach(0x1234, 0x5678, 4).await;

    let finished = next_matching(&mut jobs, Duration::from_millis(500), |j| {
        j.job_type == "device.attach"
    })
    .await
    .expect("attach handled within 500ms");
    assert_eq!(finished.result, json!({ "handled": true }));
    assert_eq!(finished.instance.to_string(), "usb-logger@1.0.0");

    let call = &guest.calls_for("attached")[0];
    assert_eq!(call.payload["payload"]["subjectId"], event.subject_id);
    assert_eq!(call.payload["payload"]["attributes"]["vendorId"], 0x1234);
    assert_eq!(call.payload["attempt"], 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn filters_select_plugins() {
    let h = Harness::new();
    let wanted = RecordingGuest::new();
    let other = RecordingGuest::new();
    h.register("sensor-reader", &wanted);
    h.register("printer-driver", &other);
    h.load(&usb_logger("sensor-reader", 0x1234, 0x5678)).await;
    h.load(&usb_logger("printer-driver", 0x04b8, 0x0005)).await;
    h.runtime.start_event_pump();

    h.attach(0x1234, 0x5678, 7).await;
    assert!(wanted.wait_for_calls("attached", 1, PROMPT).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(other.call_count("attached"), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn routing_an_event_twice_creates_one_job() {
    let h = Harness::new();
    let guest = RecordingGuest::new();
    h.register("usb-logger", &guest);
    h.load(&usb_logger("usb-logger", 0x1234, 0x5678)).await;
    h.runtime.start_event_pump();

    let event = h.attach(0x1234, 0x5678, 4).await;
    assert!(guest.wait_for_calls("attached", 1, PROMPT).await);

    let stream = h.runtime.config().runtime.event_stream.clone();
    let again = h
        .runtime
        .dispatcher()
        .route_event(&stream, &event)
        .await
        .unwrap();
    assert!(again.is_empty());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(guest.call_count("attached"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn callback_and_poll_deliver_exactly_once() {
    let h = Harness::new();
    let guest = RecordingGuest::new();
    h.register("usb-logger", &guest);
    h.load(&usb_logger("usb-logger", 0x1234, 0x5678)).await;
    h.runtime.start_event_pump();

    let devfs = h.root().join("devfs");
    std::fs::create_dir_all(devfs.join("001")).unwrap();
    let enumerator = Arc::new(StaticEnumerator::new(Vec::new()));
    h.runtime.start_device_monitor(
        Arc::clone(&enumerator) as Arc<dyn DeviceEnumerator>,
        Some(devfs.as_path()),
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Both the enumerator and the device node report the same device.
    enumerator.insert(DeviceInfo::new(1, 4, usb(0x1234, 0x5678, 4)));
    std::fs::write(devfs.join("001/004"), b"").unwrap();
    assert!(guest.wait_for_calls("attached", 1, PROMPT).await);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(guest.call_count("attached"), 1);

    enumerator.remove("001/004");
    std::fs::remove_file(devfs.join("001/004")).unwrap();
    assert!(guest.wait_for_calls("detached", 1, PROMPT).await);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(guest.call_count("detached"), 1);
    assert_eq!(guest.call_count("attached"), 1);

    let stream = h.runtime.config().runtime.event_stream.clone();
    let logged = h.log.read_after(&stream, 0, 100).await.unwrap();
    let kinds: Vec<EventKind> = logged.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EventKind::Attach, EventKind::Detach]);
    assert!(h.runtime.devices().list().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn device_present_at_startup_is_attached() {
    let h = Harness::new();
    let guest = RecordingGuest::new();
    h.register("usb-logger", &guest);
    h.load(&usb_logger("usb-logger", 0x1234, 0x5678)).await;
    h.runtime.start_event_pump();

    let enumerator = Arc::new(StaticEnumerator::new(vec![DeviceInfo::new(
        2,
        9,
        usb(0x1234, 0x5678, 9),
    )]));
    h.runtime
        .start_device_monitor(Arc::clone(&enumerator) as Arc<dyn DeviceEnumerator>, None);

    assert!(guest.wait_for_calls("attached", 1, PROMPT).await);
    assert_eq!(guest.calls_for("attached")[0].payload["payload"]["source"], "poll");
    assert_eq!(h.runtime.devices().list().len(), 1);
}
