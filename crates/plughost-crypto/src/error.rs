//! Crypto failures.

use std::path::Path;

use thiserror::Error;

/// Why a key, signature or digest could not be used.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Decoded bytes have the wrong size for `what`.
    #[error("{what} must be {expected} bytes, got {actual}")]
    WrongLength {
        /// `"public key"`, `"secret key"` or `"signature"`.
        what: &'static str,
        /// Required size.
        expected: usize,
        /// Size found.
        actual: usize,
    },

    /// 32 bytes that are not an Ed25519 point.
    #[error("not an Ed25519 public key: {0}")]
    MalformedKey(String),

    /// The registry has no key for this signer.
    #[error("no trusted key for signer '{0}'")]
    UnknownSigner(String),

    /// The signature does not match.
    #[error("bad signature")]
    BadSignature,

    /// Text is not valid in the named encoding.
    #[error("malformed {0}")]
    Encoding(&'static str),

    /// Reading or writing key material or hashed content failed.
    #[error("{path}: {source}")]
    Io {
        /// File involved, or a short description of the stream.
        path: String,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
}

impl CryptoError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Crypto result alias.
pub type CryptoResult<T> = Result<T, CryptoError>;
