//! Plughost Manifest - declaration, schema and signature of a plugin.
//!
//! A plugin directory holds a `plugin.toml` manifest next to its code. The
//! [`ManifestValidator`] runs two independent checks and both must pass:
//!
//! 1. **Schema**: a closed set of keys and capability categories with
//!    bounded sub-shapes. Every failing field is reported, not just the first.
//! 2. **Signature**: an Ed25519 signature over the canonical manifest (with
//!    `signature` excluded) concatenated with the digest of every file in the
//!    code payload.
//!
//! The only way to obtain a [`ValidatedManifest`] is through the validator,
//! so code holding one knows both checks passed.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod canonical;
pub mod error;
pub mod model;
pub mod payload;
pub mod schema;
pub mod signing;
pub mod validator;

pub use error::{FieldIssue, SchemaError, SignatureError, ValidationError};
pub use model::{
    AccessMode, DeviceFilter, FsGrant, Hooks, InboundRule, IsolationLimits, Manifest,
    NetworkGrants, Permissions, QueueGrant, QueueMode, SignatureBlock,
};
pub use canonical::canonical_bytes;
pub use payload::{CodePayload, PayloadFile};
pub use schema::SchemaLimits;
pub use signing::{SIGNATURE_ALGORITHM, sign_manifest, signing_message, verify_manifest};
pub use validator::{ManifestValidator, ValidatedManifest, read_manifest};

/// File name of the manifest inside a plugin directory.
pub const MANIFEST_FILE_NAME: &str = "plugin.toml";
