//! Gantry Integration Tests
//!
//! End-to-end tests that run real workers against loopback sockets.
//! Run with: `cargo test -p gantry-tests`

pub mod common;
