//! Logflume - plugin-side runtime and tail engine for a log collection agent
//!
//! This library provides the pieces a logflume plugin process is built from:
//! the framed message pipe to the parent router, the per-unit execution
//! runtime, and the file-tailing input engine with durable position
//! bookkeeping.
//!
//! # High-Level API
//!
//! A plugin binary wires a factory into the runtime and runs it:
//!
//! ```ignore
//! use logflume::runtime::PluginRuntime;
//! use logflume::tail::TailInput;
//!
//! logflume::logging::init_plugin_logging();
//! PluginRuntime::new("in-tail", TailInput::factory).run().await?;
//! ```

pub mod buffer;
pub mod logging;
pub mod message;
pub mod parser;
pub mod pipe;
pub mod plugin;
pub mod runtime;
pub mod tail;

/// Version of the logflume library and plugins.
///
/// This is synchronized across all components in the workspace.
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
