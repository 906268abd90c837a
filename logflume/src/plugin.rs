//! The user-facing plugin API.
//!
//! A plugin implements [`Plugin`] plus at most one of the two capability
//! traits: [`FilterPlugin`] (transforms events in flight) or
//! [`OutputPlugin`] (encodes events and writes buffered chunks). The
//! capability set is declared once through the [`PluginInstance`] the
//! factory returns; the exec unit never has to re-discover it per message.
//!
//! Plugin calls are synchronous. Long-running inputs spawn their own tokio
//! tasks from `start` and deliver records through [`Env::emit`], which is
//! safe to call from any task.

use std::fmt::Display;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::buffer::BufferError;
use crate::message::{Body, Event, Message};
use crate::parser::ParseError;
use crate::pipe::PipeWriter;
use crate::tail::position::PositionError;

/// Configuration decoding errors surfaced through [`Env::read_config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration blob failed to decode into the plugin's record.
    #[error("invalid plugin configuration: {0}")]
    Decode(#[from] toml::de::Error),
}

/// Errors returned by plugin lifecycle and data calls.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Configuration could not be decoded or was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A parser collaborator could not be constructed or failed.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Position bookkeeping failed.
    #[error(transparent)]
    Position(#[from] PositionError),

    /// The tail engine failed.
    #[error(transparent)]
    Tail(#[from] crate::tail::TailError),

    /// Buffering failed.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// Plain I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Anything else the plugin wants to report.
    #[error("{0}")]
    Other(String),
}

impl PluginError {
    /// Build an error from a plain message.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

/// Base lifecycle every plugin implements.
pub trait Plugin: Send {
    /// Decode configuration and prepare resources. The environment handle is
    /// the plugin's only channel back into the runtime; keep it.
    fn init(&mut self, env: Env) -> Result<(), PluginError>;

    /// Begin producing. Input plugins spawn their tasks here.
    fn start(&mut self) -> Result<(), PluginError>;

    /// Release resources. Called exactly once, at unit shutdown.
    fn close(&mut self) -> Result<(), PluginError>;
}

/// A plugin that transforms events in flight.
pub trait FilterPlugin: Plugin {
    /// Transform one event.
    ///
    /// `Ok(Some(event))` forwards the (possibly new) event, `Ok(None)` drops
    /// it. On error the runtime passes the original event through unchanged.
    fn filter(&mut self, event: &Event) -> Result<Option<Event>, PluginError>;
}

/// A plugin that ships events somewhere.
pub trait OutputPlugin: Plugin {
    /// Serialize one event into a buffer item, or `None` to skip it.
    fn encode(&mut self, event: &Event) -> Result<Option<Box<dyn crate::buffer::Sizer>>, PluginError>;

    /// Transmit one buffered chunk. Returns how many items were written.
    fn write(&mut self, chunk: Vec<Box<dyn crate::buffer::Sizer>>) -> Result<usize, PluginError>;
}

/// A plugin instance tagged with its capability set.
///
/// The factory declares the capability once; everything downstream matches
/// on the variant instead of re-testing types.
pub enum PluginInstance {
    /// Produces events on its own (no per-event callback).
    Input(Box<dyn Plugin>),
    /// Transforms events.
    Filter(Box<dyn FilterPlugin>),
    /// Ships events.
    Output(Box<dyn OutputPlugin>),
}

impl PluginInstance {
    /// The base trait object, whichever the capability.
    pub fn as_plugin_mut(&mut self) -> &mut dyn Plugin {
        match self {
            PluginInstance::Input(p) => p.as_mut(),
            PluginInstance::Filter(p) => p.as_mut(),
            PluginInstance::Output(p) => p.as_mut(),
        }
    }

    /// Whether this instance carries the output capability.
    pub fn is_output(&self) -> bool {
        matches!(self, PluginInstance::Output(_))
    }
}

/// Creates fresh plugin instances, one per exec unit.
pub type PluginFactory = Arc<dyn Fn() -> PluginInstance + Send + Sync>;

/// Per-unit logger carrying the unit identity into every record.
///
/// Diagnostics go to the tracing subscriber, which plugin binaries point at
/// standard error so the framed channel on standard output stays clean.
#[derive(Clone)]
pub struct UnitLogger {
    unit_id: i32,
    plugin: Arc<str>,
}

impl UnitLogger {
    /// Create a logger for one unit.
    pub fn new(unit_id: i32, plugin: &str) -> Self {
        Self {
            unit_id,
            plugin: plugin.into(),
        }
    }

    /// Informational message.
    pub fn info(&self, msg: impl Display) {
        tracing::info!(unit_id = self.unit_id, plugin = %self.plugin, "{msg}");
    }

    /// Recoverable problem; the stream continues.
    pub fn warn(&self, msg: impl Display) {
        tracing::warn!(unit_id = self.unit_id, plugin = %self.plugin, "{msg}");
    }

    /// Unrecoverable for this unit.
    pub fn error(&self, msg: impl Display) {
        tracing::error!(unit_id = self.unit_id, plugin = %self.plugin, "{msg}");
    }

    /// Verbose diagnostics.
    pub fn debug(&self, msg: impl Display) {
        tracing::debug!(unit_id = self.unit_id, plugin = %self.plugin, "{msg}");
    }
}

/// The execution environment handed to a plugin at `init`.
///
/// Clone-able and task-safe; input plugins move clones into their tasks.
#[derive(Clone)]
pub struct Env {
    unit_id: i32,
    config: Arc<str>,
    writer: PipeWriter,
    /// The unit's logger.
    pub log: UnitLogger,
}

impl Env {
    pub(crate) fn new(unit_id: i32, config: String, writer: PipeWriter, log: UnitLogger) -> Self {
        Self {
            unit_id,
            config: config.into(),
            writer,
            log,
        }
    }

    /// Decode the unit's configuration blob into the plugin's record type.
    pub fn read_config<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        Ok(toml::from_str(&self.config)?)
    }

    /// Send an event to the parent, stamped with this unit's id.
    ///
    /// This is the delivery path for input plugins. Events appear on the
    /// pipe in emit order.
    pub fn emit(&self, event: Event) {
        if self
            .writer
            .write(Message::unit(self.unit_id, Body::Event(event)))
            .is_err()
        {
            self.log.debug("emit after pipe shutdown, event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::Pipe;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct DemoConfig {
        tag: String,
        #[serde(default)]
        read_from_head: bool,
    }

    fn test_env(config: &str) -> (Env, Pipe) {
        let (host, plugin) = Pipe::in_process();
        let env = Env::new(
            5,
            config.to_string(),
            plugin.writer(),
            UnitLogger::new(5, "demo"),
        );
        (env, host)
    }

    #[test]
    fn test_read_config_decodes_toml() {
        let (env, _host) = test_env("tag = \"app.demo\"\nread_from_head = true\n");
        let conf: DemoConfig = env.read_config().unwrap();
        assert_eq!(conf.tag, "app.demo");
        assert!(conf.read_from_head);
    }

    #[test]
    fn test_read_config_reports_decode_errors() {
        let (env, _host) = test_env("tag = [broken");
        let result: Result<DemoConfig, _> = env.read_config();
        assert!(matches!(result, Err(ConfigError::Decode(_))));
    }

    #[tokio::test]
    async fn test_emit_stamps_unit_id() {
        let (env, mut host) = test_env("");
        env.emit(Event::new("app.demo", crate::message::Record::new()));

        let msg = host.read().await.unwrap();
        assert_eq!(msg.unit_id, 5);
        assert!(matches!(msg.body, Body::Event(_)));
    }

    #[test]
    fn test_emit_after_shutdown_is_silent() {
        let (env, host) = test_env("");
        drop(host);
        // Must not panic or error out.
        env.emit(Event::new("app.demo", crate::message::Record::new()));
    }
}
