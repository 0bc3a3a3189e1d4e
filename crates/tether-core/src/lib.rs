//! Core library for tether: drives the `cursor-agent` CLI as an ACP agent.
//!
//! The pieces, bottom-up:
//!
//! - [`stream`] parses the CLI's `stream-json` output into typed events.
//! - [`translate`] turns those events into ACP session notifications.
//! - [`connection`] spawns and supervises the CLI process.
//! - [`ipc`] serves the permission and context hooks the CLI calls back into.
//! - [`hooks`] installs (and restores) the CLI's hook configuration.
//! - [`harness`] ties everything into the [`harness::Harness`] lifecycle.

pub mod config;
pub mod connection;
pub mod harness;
pub mod hooks;
pub mod ipc;
pub mod stream;
pub mod translate;

pub use config::BridgeConfig;
