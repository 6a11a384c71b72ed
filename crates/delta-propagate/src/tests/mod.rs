//! Integration-level tests for the propagation crate.

mod soundness;
