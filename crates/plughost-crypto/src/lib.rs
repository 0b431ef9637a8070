//! Plughost Crypto - signing and hashing primitives for plugin manifests.
//!
//! This crate provides:
//! - Ed25519 signing keys for publishers, with secure memory handling
//! - Detached signatures carried in manifests as base64
//! - BLAKE3 content hashing for code payloads and source trees
//! - A registry of trusted signers keyed by the manifest's signer reference
//!
//! # Example
//!
//! ```
//! use plughost_crypto::{ContentHash, KeyPair, SignerRegistry};
//!
//! let keypair = KeyPair::generate();
//! let mut registry = SignerRegistry::new();
//! registry.trust("acme", keypair.export_public_key());
//!
//! let digest = ContentHash::hash(b"plugin payload");
//! let signature = keypair.sign(digest.as_bytes());
//! assert!(registry.verify("acme", digest.as_bytes(), &signature).is_ok());
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod error;
mod hash;
mod keypair;
mod registry;
mod signature;

pub use error::{CryptoError, CryptoResult};
pub use hash::ContentHash;
pub use keypair::{KeyPair, PublicKey};
pub use registry::{PUBLIC_KEY_EXTENSION, SignerRegistry};
pub use signature::Signature;
