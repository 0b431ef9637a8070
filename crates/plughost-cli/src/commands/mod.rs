//! CLI command implementations.

pub(crate) mod config;
pub(crate) mod devices;
pub(crate) mod keys;
pub(crate) mod run;
pub(crate) mod sign;
pub(crate) mod validate;
