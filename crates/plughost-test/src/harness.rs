//! Test harness helpers.

use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Send runtime logs to the test output. Filter with `RUST_LOG`; defaults
/// to `warn`. Safe to call from every test.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(timeout, poll).await.is_ok()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn wait_until_sees_condition() {
        init_test_tracing();
        let n = AtomicU32::new(0);
        assert!(
            wait_until(Duration::from_secs(1), || n.fetch_add(1, Ordering::SeqCst) >= 3).await
        );
        assert!(!wait_until(Duration::from_millis(30), || false).await);
    }
}
