//! Purpose: Library crate behind the `rksok` server binary and its tests.
//! Exports: `core` (protocol, framing, grammar, authority, store, errors), `connection`, `serve`, `api`.
//! Role: Everything except argument parsing and process exit lives here.
//! Invariants: No module installs a global subscriber; only the binary calls `serve::init_tracing`.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod connection;
pub mod core;
pub mod serve;
