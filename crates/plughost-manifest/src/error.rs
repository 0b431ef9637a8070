//! Validation error taxonomy.

use std::fmt;

use thiserror::Error;

/// One failing manifest field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIssue {
    /// Dotted path, e.g. `permissions.filesystem[0].mode`.
    pub field: String,
    /// What is wrong.
    pub message: String,
}

impl FieldIssue {
    pub(crate) fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Structural manifest defect listing every offending field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("schema error: {}", join_issues(.issues))]
pub struct SchemaError {
    /// All failing fields, in document order.
    pub issues: Vec<FieldIssue>,
}

impl SchemaError {
    /// Whether any issue concerns `field`.
    #[must_use]
    pub fn mentions(&self, field: &str) -> bool {
        self.issues.iter().any(|i| i.field == field)
    }
}

fn join_issues(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Integrity or authenticity failure. Always fatal to loading.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// `signature.algorithm` is not supported.
    #[error("unsupported signature algorithm '{0}'")]
    UnsupportedAlgorithm(String),

    /// `signature.value` is not a base64 Ed25519 signature.
    #[error("malformed signature: {0}")]
    Malformed(String),

    /// No trusted key is registered for the signer.
    #[error("unknown signer '{0}'")]
    UnknownSigner(String),

    /// The signature does not cover this manifest and payload.
    #[error("signature does not match manifest and code payload")]
    Mismatch,
}

/// Why a manifest was rejected.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Schema check failed.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Signature check failed.
    #[error("signature error: {0}")]
    Signature(#[from] SignatureError),

    /// The manifest or payload could not be read.
    #[error("failed to read plugin {path}: {message}")]
    Io {
        /// Path that failed.
        path: String,
        /// Underlying error.
        message: String,
    },
}
