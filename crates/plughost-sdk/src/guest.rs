//! The trait a plugin implements.

use async_trait::async_trait;
use plughost_core::HookKind;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::host::HostApi;

/// One hook invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// Host-assigned call id.
    pub call_id: u64,
    /// Which hook fired.
    pub hook: HookKind,
    /// Handler name bound to the hook in the manifest.
    pub handler: String,
    /// Hook input.
    pub payload: Value,
}

/// Per-call context handed to a handler.
#[derive(Debug, Clone)]
pub struct HookContext {
    host: HostApi,
    cancel: CancellationToken,
}

impl HookContext {
    pub(crate) fn new(host: HostApi, cancel: CancellationToken) -> Self {
        Self { host, cancel }
    }

    /// Host operations for this context.
    #[must_use]
    pub fn host(&self) -> &HostApi {
        &self.host
    }

    /// Whether the host asked this call to stop.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the host asks this call to stop.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

/// Plugin entry point.
///
/// Handlers should poll [`HookContext::is_cancelled`] (or race
/// [`HookContext::cancelled`]) in long-running work. A cancelled handler
/// that returns an error is reported to the host as cancelled.
#[async_trait]
pub trait Guest: Send + Sync + 'static {
    /// Run the handler for `call`.
    ///
    /// # Errors
    ///
    /// The error string is reported to the host as a handler failure.
    async fn on_invoke(&self, call: Invocation, ctx: HookContext) -> Result<Value, String>;
}
