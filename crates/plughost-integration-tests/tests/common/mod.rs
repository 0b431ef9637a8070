//! Shared harness for runtime integration tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use plughost_config::{Config, JobStoreKind};
use plughost_core::PluginName;
use plughost_devices::{
    DeviceAttributes, DeviceEvent, DeviceInfo, EventKind, EventLog, EventSource, MemoryEventLog,
    NewEvent,
};
use plughost_events::Subscription;
use plughost_runtime::{LaunchSpec, PluginInstance, PluginRuntime};
use plughost_sdk::Guest;
use plughost_test::{PluginFixture, RecordingGuest, TestSigner, init_test_tracing};
use tempfile::TempDir;

/// How long tests wait for something that should happen promptly.
#[allow(dead_code)]
pub const PROMPT: Duration = Duration::from_secs(5);

/// A runtime over a private temp directory, trusting one test signer.
///
/// Devices and the hot-reload watcher are off and jobs live in memory
/// unless a test turns them on.
#[allow(dead_code)]
pub struct Harness {
    /// The runtime under test.
    pub runtime: Arc<PluginRuntime>,
    /// Trusted publisher.
    pub signer: TestSigner,
    /// The event log the runtime reads.
    pub log: Arc<MemoryEventLog>,
    dir: TempDir,
}

#[allow(dead_code)]
impl Harness {
    /// Harness with the test defaults.
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Harness with the test defaults adjusted by `tweak`.
    pub fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        init_test_tracing();
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(dir.path());
        tweak(&mut config);
        std::fs::create_dir_all(&config.runtime.plugin_dirs[0]).expect("plugin root");

        let signer = TestSigner::new("test-publisher");
        let log = Arc::new(MemoryEventLog::new());
        let runtime = PluginRuntime::builder()
            .config(config)
            .signers(signer.registry())
            .event_log(Arc::clone(&log) as Arc<dyn EventLog>)
            .build()
            .expect("runtime builds");
        Self {
            runtime,
            signer,
            log,
            dir,
        }
    }

    /// Temp directory root.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Configured plugin root.
    pub fn plugins(&self) -> PathBuf {
        self.runtime.config().runtime.plugin_dirs[0].clone()
    }

    /// Write `fixture` signed into `<plugins>/<name>`.
    pub fn install(&self, fixture: &PluginFixture) -> PathBuf {
        fixture
            .install(&self.plugins(), &self.signer)
            .expect("fixture installs")
    }

    /// Serve every instance of `name` with `guest`.
    pub fn register(&self, name: &str, guest: &RecordingGuest) {
        self.runtime
            .threads()
            .register_guest(plugin(name), Arc::new(guest.clone()));
    }

    /// Serve instances of `name` with a guest chosen per launch.
    pub fn register_with(
        &self,
        name: &str,
        pick: impl Fn(&LaunchSpec) -> RecordingGuest + Send + Sync + 'static,
    ) {
        self.runtime.threads().register(
            plugin(name),
            Arc::new(move |spec: &LaunchSpec| -> Arc<dyn Guest> { Arc::new(pick(spec)) }),
        );
    }

    /// Install `fixture` and load it.
    pub async fn load(&self, fixture: &PluginFixture) -> Arc<PluginInstance> {
        let dir = self.install(fixture);
        self.runtime.load(&dir).await.expect("plugin loads")
    }

    /// Append an attach event for a device on bus 1 to the runtime's stream.
    pub async fn attach(&self, vendor_id: u16, product_id: u16, address: u16) -> DeviceEvent {
        self.append(EventKind::Attach, usb(vendor_id, product_id, address))
            .await
    }

    /// Append an event of `kind` for `attributes`.
    pub async fn append(&self, kind: EventKind, attributes: DeviceAttributes) -> DeviceEvent {
        let stream = &self.runtime.config().runtime.event_stream;
        self.log
            .append(stream, NewEvent::usb(kind, attributes, EventSource::Callback))
            .await
            .expect("event appended")
    }
}

/// Plugin name literal.
#[allow(dead_code)]
pub fn plugin(name: &str) -> PluginName {
    PluginName::new(name).expect("valid plugin name")
}

/// Attributes of a fully described device on bus 1.
#[allow(dead_code)]
pub fn usb(vendor_id: u16, product_id: u16, address: u16) -> DeviceAttributes {
    DeviceInfo::new(
        1,
        address,
        DeviceAttributes {
            vendor_id: Some(vendor_id),
            product_id: Some(product_id),
            product: Some("Test Device".into()),
            ..Default::default()
        },
    )
    .attributes
}

/// Configuration rooted at `root` with short timeouts and no retry jitter.
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.runtime.plugin_dirs = vec![root.join("plugins")];
    config.runtime.state_dir = root.join("state");
    config.runtime.trust_dir = root.join("trust");

    config.sandbox.load_timeout_ms = 2_000;
    config.sandbox.unload_timeout_ms = 500;
    config.sandbox.drain_timeout_ms = 5_000;
    config.sandbox.kill_grace_ms = 200;
    config.sandbox.restart_backoff_initial_ms = 20;
    config.sandbox.restart_backoff_max_ms = 100;

    config.dispatcher.store = JobStoreKind::Memory;
    config.dispatcher.backoff_initial_ms = 10;
    config.dispatcher.backoff_max_ms = 50;
    config.dispatcher.backoff_jitter = 0.0;
    config.dispatcher.job_timeout_ms = 5_000;

    config.devices.enabled = false;
    config.devices.poll_interval_ms = 50;
    config.devices.dedup_window_ms = 2_000;
    config.watcher.enabled = false;
    config.watcher.debounce_ms = 100;
    config
}

/// Next value on `sub` matching `pred`, or `None` after `timeout`.
#[allow(dead_code)]
pub async fn next_matching<T: Send + Sync + 'static>(
    sub: &mut Subscription<T>,
    timeout: Duration,
    mut pred: impl FnMut(&T) -> bool,
) -> Option<Arc<T>> {
    tokio::time::timeout(timeout, async {
        loop {
            let value = sub.recv().await?;
            if pred(&value) {
                return Some(value);
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Poll `condition` until it holds or [`PROMPT`] passes.
#[allow(dead_code)]
pub async fn wait(condition: impl FnMut() -> bool) -> bool {
    plughost_test::wait_until(PROMPT, condition).await
}
