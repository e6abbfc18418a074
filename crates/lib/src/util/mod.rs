//! Shared utilities.
//!
//! Common utilities used across the crate including hashing, backoff and test helpers.

pub mod hash;
pub mod retry;

#[cfg(test)]
pub mod testutil;
