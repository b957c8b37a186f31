//! Internal "plugin" modules (crate-local sub-systems).
//!
//! Regular Rust modules with a stable boundary so the binary and tests can
//! depend on them without reaching into each other's internals.

pub mod kv;
pub mod tree;
