//! Integration test entry point for hamchat-node.
//!
//! Run with: cargo test -p hamchat-node --test integration

mod harness;
mod auth;
mod relay;
mod resilience;
