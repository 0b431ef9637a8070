//! Host/guest wire protocol.
//!
//! The host and a plugin's execution context share no memory. They exchange
//! these messages over channels (thread contexts) or as newline-delimited
//! JSON over stdin/stdout (process contexts).
//!
//! A guest announces itself with [`GuestMessage::Ready`]. The host then sends
//! [`HostMessage::Invoke`] for lifecycle and job hooks and the guest answers
//! each with a [`GuestMessage::Result`] carrying the same `call_id`. While a
//! handler runs, the guest may issue [`GuestMessage::HostCall`]s; every one is
//! checked against the instance's grants before the host acts on it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::{Capability, HookKind};

/// Protocol version announced in [`GuestMessage::Ready`].
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from the host into a plugin context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// Run the handler bound to `hook`.
    Invoke {
        /// Correlates the eventual [`GuestMessage::Result`].
        call_id: u64,
        /// Which hook fired.
        hook: HookKind,
        /// Handler name from the manifest `hooks` table.
        handler: String,
        /// Hook input.
        payload: Value,
    },
    /// Ask the guest to cooperatively cancel a running call.
    Cancel {
        /// The call to cancel.
        call_id: u64,
    },
    /// Answer to a [`GuestMessage::HostCall`].
    HostReply {
        /// The request being answered.
        request_id: u64,
        /// Outcome of the host call.
        result: HostCallResult,
    },
    /// Stop the guest loop and exit.
    Shutdown,
}

/// Messages sent from a plugin context to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuestMessage {
    /// The guest loop is running.
    Ready {
        /// Protocol version spoken by the guest.
        protocol: u32,
    },
    /// A handler finished.
    Result {
        /// The call this answers.
        call_id: u64,
        /// Handler outcome.
        outcome: HandlerOutcome,
    },
    /// The guest asks the host to perform a capability-sensitive operation.
    HostCall {
        /// Correlates the eventual [`HostMessage::HostReply`].
        request_id: u64,
        /// The requested operation.
        call: HostCall,
    },
    /// A log line to re-emit on the host.
    Log {
        /// Severity.
        level: LogLevel,
        /// Log text.
        message: String,
    },
}

/// Result of running one handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HandlerOutcome {
    /// The handler returned a value.
    Ok {
        /// Returned value.
        value: Value,
    },
    /// The handler failed.
    Error {
        /// Failure description.
        message: String,
    },
    /// The handler observed a cancellation request and stopped.
    Cancelled,
}

/// Guest log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Verbose diagnostics.
    Debug,
    /// Normal operation.
    Info,
    /// Something unexpected but recoverable.
    Warn,
    /// A failure.
    Error,
}

/// A capability-sensitive operation requested by a guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HostCall {
    /// Read a UTF-8 file.
    FsRead {
        /// Absolute path.
        path: String,
    },
    /// Create or overwrite a file with UTF-8 contents.
    FsWrite {
        /// Absolute path.
        path: String,
        /// New contents.
        contents: String,
    },
    /// Connect to `host:port`, optionally send a request, and read a bounded
    /// response.
    NetConnect {
        /// Destination host.
        host: String,
        /// Destination port.
        port: u16,
        /// Bytes to send after connecting.
        #[serde(default)]
        send: Option<String>,
    },
    /// Listen on `interface:port` and accept a single connection.
    NetAccept {
        /// Local interface address.
        interface: String,
        /// Local port.
        port: u16,
    },
    /// Look up an attached device by subject id.
    DeviceOpen {
        /// Device subject id, e.g. `usb:1234:5678:001:004`.
        subject_id: String,
    },
    /// Publish a message on a queue topic.
    QueuePublish {
        /// Topic name.
        topic: String,
        /// Message body.
        message: Value,
    },
}

impl HostCall {
    /// The capability this call requires.
    #[must_use]
    pub fn capability(&self) -> Capability {
        match self {
            Self::FsRead { .. } => Capability::FsRead,
            Self::FsWrite { .. } => Capability::FsWrite,
            Self::NetConnect { .. } => Capability::NetOutbound,
            Self::NetAccept { .. } => Capability::NetInbound,
            Self::DeviceOpen { .. } => Capability::DeviceAccess,
            Self::QueuePublish { .. } => Capability::QueuePublish,
        }
    }

    /// The target string the capability check matches against.
    #[must_use]
    pub fn target(&self) -> String {
        match self {
            Self::FsRead { path } | Self::FsWrite { path, .. } => path.clone(),
            Self::NetConnect { host, port, .. } => format!("{host}:{port}"),
            Self::NetAccept { interface, port } => format!("{interface}:{port}"),
            Self::DeviceOpen { subject_id } => subject_id.clone(),
            Self::QueuePublish { topic, .. } => topic.clone(),
        }
    }
}

/// Host answer to a [`HostCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HostCallResult {
    /// The operation ran.
    Ok {
        /// Operation output.
        value: Value,
    },
    /// The instance lacks a grant for the operation.
    Denied {
        /// Requested capability.
        capability: Capability,
        /// Requested target.
        target: String,
    },
    /// The operation was allowed but failed.
    Failed {
        /// Failure description.
        message: String,
    },
}
