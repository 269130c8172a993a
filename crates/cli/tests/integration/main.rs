//! CLI integration tests.
//!
//! Each test builds against its own temporary store and a local registry
//! holding a minimal `python:3.10-slim` rootfs.

mod common;

mod build_tests;
mod gc_tests;
mod inspect_tests;
mod run_tests;
